use super::*;

use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream};

// frames: 4-byte big-endian length covering the code and message, 1-byte
// message code, encoded message
const ERROR_RESP: u8 = 0;
const SET_CLIENT_ID_REQ: u8 = 5;
const SET_CLIENT_ID_RESP: u8 = 6;
const GET_REQ: u8 = 9;
const GET_RESP: u8 = 10;
const PUT_REQ: u8 = 11;
const PUT_RESP: u8 = 12;
const DEL_REQ: u8 = 13;
const DEL_RESP: u8 = 14;

// responses larger than this are treated as a protocol error
const MAX_RESPONSE: usize = 64 * 1024 * 1024;

#[derive(Clone, PartialEq, Message)]
pub struct RpbErrorResp {
    #[prost(bytes = "vec", tag = "1")]
    pub errmsg: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub errcode: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct RpbSetClientIdReq {
    #[prost(bytes = "vec", tag = "1")]
    pub client_id: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RpbGetReq {
    #[prost(bytes = "vec", tag = "1")]
    pub bucket: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub key: Vec<u8>,
    #[prost(uint32, optional, tag = "3")]
    pub r: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RpbContent {
    #[prost(bytes = "vec", tag = "1")]
    pub value: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub content_type: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RpbGetResp {
    #[prost(message, repeated, tag = "1")]
    pub content: Vec<RpbContent>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub vclock: Option<Vec<u8>>,
    #[prost(bool, optional, tag = "3")]
    pub unchanged: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RpbPutReq {
    #[prost(bytes = "vec", tag = "1")]
    pub bucket: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub vclock: Option<Vec<u8>>,
    #[prost(message, optional, tag = "4")]
    pub content: Option<RpbContent>,
    #[prost(uint32, optional, tag = "5")]
    pub w: Option<u32>,
    #[prost(uint32, optional, tag = "6")]
    pub dw: Option<u32>,
    #[prost(bool, optional, tag = "7")]
    pub return_body: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RpbDelReq {
    #[prost(bytes = "vec", tag = "1")]
    pub bucket: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub key: Vec<u8>,
    #[prost(uint32, optional, tag = "3")]
    pub rw: Option<u32>,
}

fn quorum(value: u32) -> Option<u32> {
    (value > 0).then_some(value)
}

/// A single connection, opened lazily and re-opened after any I/O failure.
/// Requests on one client are serialized.
pub struct PbClient {
    host: String,
    port: u16,
    buffer_kb: u32,
    client_id: Mutex<Option<[u8; 4]>>,
    connection: Mutex<Option<TcpStream>>,
}

impl PbClient {
    pub fn new(host: &str, port: u16, buffer_kb: u32) -> Self {
        Self {
            host: host.to_owned(),
            port,
            buffer_kb,
            client_id: Mutex::new(None),
            connection: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<TcpStream, StoreError> {
        let addr = lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address for {}", self.host),
                )
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        let size = self.buffer_kb.saturating_mul(1024);
        if size > 0 {
            socket.set_send_buffer_size(size)?;
            socket.set_recv_buffer_size(size)?;
        }

        let mut stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!("connected to {}:{}", self.host, self.port);

        // the client id is per connection
        if let Some(id) = *self.client_id.lock().await {
            let request = RpbSetClientIdReq {
                client_id: id.to_vec(),
            };
            exchange(&mut stream, SET_CLIENT_ID_REQ, &request, SET_CLIENT_ID_RESP).await?;
        }

        Ok(stream)
    }

    async fn call<M: Message>(
        &self,
        code: u8,
        request: &M,
        expect: u8,
    ) -> Result<Bytes, StoreError> {
        let mut connection = self.connection.lock().await;
        let mut stream = match connection.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        let result = exchange(&mut stream, code, request, expect).await;

        // keep the connection unless the stream itself failed
        if !matches!(result, Err(StoreError::Io(_))) {
            *connection = Some(stream);
        }
        result
    }
}

async fn exchange<M: Message>(
    stream: &mut TcpStream,
    code: u8,
    request: &M,
    expect: u8,
) -> Result<Bytes, StoreError> {
    let body = request.encode_to_vec();
    let mut frame = Vec::with_capacity(5 + body.len());
    frame.extend_from_slice(&(body.len() as u32 + 1).to_be_bytes());
    frame.push(code);
    frame.extend_from_slice(&body);
    stream.write_all(&frame).await?;

    let len = stream.read_u32().await? as usize;
    if len == 0 || len > MAX_RESPONSE {
        return Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("bad response length {len}"),
        )));
    }
    let mut response = vec![0; len];
    stream.read_exact(&mut response).await?;
    let response = Bytes::from(response);

    match response[0] {
        c if c == expect => Ok(response.slice(1..)),
        ERROR_RESP => {
            let error = RpbErrorResp::decode(response.slice(1..))
                .map_err(|e| StoreError::Protocol(e.to_string()))?;
            Err(StoreError::Server(format!(
                "{} (code {})",
                String::from_utf8_lossy(&error.errmsg),
                error.errcode
            )))
        }
        other => Err(StoreError::Protocol(format!(
            "expected message code {expect}, got {other}"
        ))),
    }
}

#[async_trait]
impl StoreClient for PbClient {
    async fn fetch(
        &self,
        bucket: &str,
        key: &str,
        r: u32,
    ) -> Result<Option<StoredObject>, StoreError> {
        let request = RpbGetReq {
            bucket: bucket.as_bytes().to_vec(),
            key: key.as_bytes().to_vec(),
            r: quorum(r),
        };
        let body = self.call(GET_REQ, &request, GET_RESP).await?;
        let response =
            RpbGetResp::decode(body).map_err(|e| StoreError::Protocol(e.to_string()))?;

        if response.content.is_empty() && response.vclock.is_none() {
            return Ok(None);
        }

        // with siblings the first one stands in for the object
        Ok(Some(StoredObject {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            value: response
                .content
                .into_iter()
                .next()
                .map(|c| Bytes::from(c.value)),
            vclock: response.vclock.map(Bytes::from),
        }))
    }

    async fn store(&self, object: StoredObject, w: u32, dw: u32) -> Result<(), StoreError> {
        let request = RpbPutReq {
            bucket: object.bucket.into_bytes(),
            key: Some(object.key.into_bytes()),
            vclock: object.vclock.map(|v| v.to_vec()),
            content: Some(RpbContent {
                value: object.value.map(|v| v.to_vec()).unwrap_or_default(),
                content_type: Some(b"application/octet-stream".to_vec()),
            }),
            w: quorum(w),
            dw: quorum(dw),
            return_body: Some(false),
        };
        self.call(PUT_REQ, &request, PUT_RESP).await?;
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str, rw: u32) -> Result<(), StoreError> {
        let request = RpbDelReq {
            bucket: bucket.as_bytes().to_vec(),
            key: key.as_bytes().to_vec(),
            rw: quorum(rw),
        };
        self.call(DEL_REQ, &request, DEL_RESP).await?;
        Ok(())
    }

    async fn set_client_id(&self, id: [u8; 4]) -> Result<(), StoreError> {
        *self.client_id.lock().await = Some(id);

        let mut connection = self.connection.lock().await;
        let mut stream = match connection.take() {
            Some(stream) => stream,
            // a fresh connection announces the id itself
            None => {
                *connection = Some(self.connect().await?);
                return Ok(());
            }
        };

        let request = RpbSetClientIdReq {
            client_id: id.to_vec(),
        };
        let result = exchange(&mut stream, SET_CLIENT_ID_REQ, &request, SET_CLIENT_ID_RESP).await;
        if !matches!(result, Err(StoreError::Io(_))) {
            *connection = Some(stream);
        }
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn read_request(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let len = stream.read_u32().await.ok()? as usize;
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await.ok()?;
        let code = body.remove(0);
        Some((code, body))
    }

    async fn respond(stream: &mut TcpStream, code: u8, body: &[u8]) {
        let mut frame = (body.len() as u32 + 1).to_be_bytes().to_vec();
        frame.push(code);
        frame.extend_from_slice(body);
        stream.write_all(&frame).await.expect("write");
    }

    /// A fake server that keeps one object in memory and records the codes
    /// it was sent.
    async fn fake_server() -> (u16, async_channel::Receiver<u8>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let (tx, rx) = async_channel::unbounded();
        tokio::spawn(async move {
            let mut stored: Option<RpbPutReq> = None;
            while let Ok((mut stream, _)) = listener.accept().await {
                while let Some((code, body)) = read_request(&mut stream).await {
                    let _ = tx.send(code).await;
                    match code {
                        SET_CLIENT_ID_REQ => respond(&mut stream, SET_CLIENT_ID_RESP, &[]).await,
                        GET_REQ => {
                            let response = match &stored {
                                Some(put) => RpbGetResp {
                                    content: put.content.clone().into_iter().collect(),
                                    vclock: Some(b"vc1".to_vec()),
                                    unchanged: None,
                                },
                                None => RpbGetResp::default(),
                            };
                            respond(&mut stream, GET_RESP, &response.encode_to_vec()).await;
                        }
                        PUT_REQ => {
                            stored = RpbPutReq::decode(&body[..]).ok();
                            respond(&mut stream, PUT_RESP, &[]).await;
                        }
                        _ => {
                            let error = RpbErrorResp {
                                errmsg: b"unsupported".to_vec(),
                                errcode: 1,
                            };
                            respond(&mut stream, ERROR_RESP, &error.encode_to_vec()).await;
                        }
                    }
                }
            }
        });
        (port, rx)
    }

    #[tokio::test]
    async fn fetch_store_round_trip() {
        let (port, codes) = fake_server().await;
        let client = PbClient::new("127.0.0.1", port, 16);

        client.generate_and_set_client_id().await.expect("client id");
        assert_eq!(client.fetch("b", "k", 0).await.expect("fetch"), None);

        let object = StoredObject::new("b", "k", Bytes::from_static(b"v"));
        client.store(object, 2, 1).await.expect("store");

        let fetched = client.fetch("b", "k", 0).await.expect("fetch").expect("object");
        assert_eq!(fetched.value, Some(Bytes::from_static(b"v")));
        assert_eq!(fetched.vclock, Some(Bytes::from_static(b"vc1")));

        // one connection, so the client id went out exactly once
        let mut seen = Vec::new();
        while let Ok(code) = codes.try_recv() {
            seen.push(code);
        }
        assert_eq!(seen, vec![SET_CLIENT_ID_REQ, GET_REQ, PUT_REQ, GET_REQ]);
    }

    #[tokio::test]
    async fn server_errors_keep_the_connection() {
        let (port, _codes) = fake_server().await;
        let client = PbClient::new("127.0.0.1", port, 16);

        match client.delete("b", "k", 0).await {
            Err(StoreError::Server(msg)) => assert!(msg.contains("unsupported"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(client.connection.lock().await.is_some());
    }

    #[tokio::test]
    async fn refused_connections_surface_as_io_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let client = PbClient::new("127.0.0.1", port, 16);
        assert!(matches!(
            client.generate_and_set_client_id().await,
            Err(StoreError::Io(_))
        ));
    }

    #[test]
    fn zero_quorums_are_omitted() {
        let request = RpbGetReq {
            bucket: b"b".to_vec(),
            key: b"k".to_vec(),
            r: quorum(0),
        };
        let with_r = RpbGetReq {
            r: quorum(2),
            ..request.clone()
        };
        assert_eq!(with_r.encoded_len(), request.encoded_len() + 2);
    }
}
