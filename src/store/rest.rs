use super::*;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::fmt::Write;

const CONTENT_TYPE: &str = "content-type";
const VCLOCK: &str = "x-riak-vclock";
const CLIENT_ID: &str = "x-riak-clientid";

/// Client for the store's HTTP interface rooted at `/riak`.
pub struct HttpClient {
    base: String,
    client: Client<HttpConnector, Full<Bytes>>,
    client_id: std::sync::Mutex<Option<String>>,
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl HttpClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            base: format!("http://{host}:{port}/riak"),
            client: Client::builder(TokioExecutor::new()).build_http(),
            client_id: std::sync::Mutex::new(None),
        }
    }

    fn url(&self, bucket: &str, key: &str, params: &[(&str, u32)]) -> String {
        let mut url = format!(
            "{}/{}/{}",
            self.base,
            url_escape::encode_component(bucket),
            url_escape::encode_component(key)
        );
        let mut separator = '?';
        // zero quorums are left to the server default
        for (name, value) in params.iter().filter(|(_, v)| *v > 0) {
            url.push(separator);
            let _ = write!(url, "{name}={value}");
            separator = '&';
        }
        url
    }

    fn client_id(&self) -> Option<String> {
        self.client_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        headers: Vec<(&'static str, Bytes)>,
        body: Bytes,
    ) -> Result<Reply, StoreError> {
        let mut builder = Request::builder().method(method).uri(&url);
        for (name, value) in headers {
            builder = builder.header(name, value.as_ref());
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| StoreError::Http(format!("{url}: {e}")))?;

        let response: Response<Incoming> = self
            .client
            .request(request)
            .await
            .map_err(|e| StoreError::Http(format!("{url}: {e}")))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| StoreError::Http(format!("{url}: {e}")))?
            .to_bytes();

        Ok(Reply {
            status,
            headers,
            body,
        })
    }

    fn unexpected(reply: &Reply, method: &'static str, url: &str) -> StoreError {
        StoreError::Status {
            status: reply.status.as_u16(),
            method,
            path: url.to_owned(),
        }
    }
}

#[async_trait]
impl StoreClient for HttpClient {
    async fn fetch(
        &self,
        bucket: &str,
        key: &str,
        r: u32,
    ) -> Result<Option<StoredObject>, StoreError> {
        let url = self.url(bucket, key, &[("r", r)]);
        let reply = self
            .send(Method::GET, url.clone(), Vec::new(), Bytes::new())
            .await?;

        let vclock = reply
            .headers
            .get(VCLOCK)
            .map(|v| Bytes::copy_from_slice(v.as_bytes()));

        match reply.status {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::OK => Ok(Some(StoredObject {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
                value: Some(reply.body),
                vclock,
            })),
            // siblings: the object exists, but there is no single value
            StatusCode::MULTIPLE_CHOICES => Ok(Some(StoredObject {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
                value: None,
                vclock,
            })),
            _ => Err(Self::unexpected(&reply, "GET", &url)),
        }
    }

    async fn store(&self, object: StoredObject, w: u32, dw: u32) -> Result<(), StoreError> {
        let mut url = self.url(&object.bucket, &object.key, &[("w", w), ("dw", dw)]);
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str("returnbody=false");

        let mut headers = vec![(CONTENT_TYPE, Bytes::from_static(b"application/octet-stream"))];
        if let Some(vclock) = object.vclock {
            headers.push((VCLOCK, vclock));
        }
        if let Some(id) = self.client_id() {
            headers.push((CLIENT_ID, Bytes::from(id)));
        }

        let reply = self
            .send(
                Method::PUT,
                url.clone(),
                headers,
                object.value.unwrap_or_default(),
            )
            .await?;

        match reply.status {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
            _ => Err(Self::unexpected(&reply, "PUT", &url)),
        }
    }

    async fn delete(&self, bucket: &str, key: &str, rw: u32) -> Result<(), StoreError> {
        let url = self.url(bucket, key, &[("rw", rw)]);
        let mut headers = Vec::new();
        if let Some(id) = self.client_id() {
            headers.push((CLIENT_ID, Bytes::from(id)));
        }

        let reply = self
            .send(Method::DELETE, url.clone(), headers, Bytes::new())
            .await?;

        match reply.status {
            StatusCode::NO_CONTENT | StatusCode::OK | StatusCode::NOT_FOUND => Ok(()),
            _ => Err(Self::unexpected(&reply, "DELETE", &url)),
        }
    }

    async fn set_client_id(&self, id: [u8; 4]) -> Result<(), StoreError> {
        *self.client_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(STANDARD.encode(id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers each connection's first request with `response` and hands the
    /// raw request head back through the channel.
    async fn canned(response: &'static str) -> (u16, async_channel::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let (tx, rx) = async_channel::unbounded();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = tx.send(String::from_utf8_lossy(&head).into_owned()).await;
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        (port, rx)
    }

    #[test]
    fn urls_escape_and_skip_default_quorums() {
        let client = HttpClient::new("10.0.0.1", 8098);
        assert_eq!(
            client.url("Yg==\r\n", "a/b", &[("r", 0)]),
            "http://10.0.0.1:8098/riak/Yg%3D%3D%0D%0A/a%2Fb"
        );
        assert_eq!(
            client.url("b", "k", &[("w", 2), ("dw", 0), ("x", 1)]),
            "http://10.0.0.1:8098/riak/b/k?w=2&x=1"
        );
    }

    #[tokio::test]
    async fn not_found_is_absent() {
        let (port, requests) =
            canned("HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n").await;
        let client = HttpClient::new("127.0.0.1", port);

        let object = client.fetch("b", "k", 2).await.expect("fetch");
        assert_eq!(object, None);

        let head = requests.recv().await.expect("request");
        assert!(head.starts_with("GET /riak/b/k?r=2 HTTP/1.1"), "{head}");
    }

    #[tokio::test]
    async fn found_carries_value_and_vclock() {
        let (port, _requests) = canned(
            "HTTP/1.1 200 OK\r\nx-riak-vclock: a85hYGBg\r\ncontent-length: 5\r\n\r\nhello",
        )
        .await;
        let client = HttpClient::new("127.0.0.1", port);

        let object = client.fetch("b", "k", 0).await.expect("fetch").expect("object");
        assert_eq!(object.value, Some(Bytes::from_static(b"hello")));
        assert_eq!(object.vclock, Some(Bytes::from_static(b"a85hYGBg")));
    }

    #[tokio::test]
    async fn writes_send_vclock_and_client_id() {
        let (port, requests) =
            canned("HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n").await;
        let client = HttpClient::new("127.0.0.1", port);
        client.set_client_id([1, 2, 3, 4]).await.expect("id");

        let object = StoredObject {
            bucket: "b".into(),
            key: "k".into(),
            value: Some(Bytes::from_static(b"v")),
            vclock: Some(Bytes::from_static(b"a85hYGBg")),
        };
        client.store(object, 3, 0).await.expect("store");

        let head = requests.recv().await.expect("request").to_ascii_lowercase();
        assert!(head.starts_with("put /riak/b/k?w=3&returnbody=false"), "{head}");
        assert!(head.contains("x-riak-vclock: a85hygbg"), "{head}");
        assert!(head.contains("x-riak-clientid: aqidba=="), "{head}");
    }

    #[tokio::test]
    async fn server_errors_are_reported() {
        let (port, _requests) =
            canned("HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\n\r\n").await;
        let client = HttpClient::new("127.0.0.1", port);

        match client.delete("b", "k", 0).await {
            Err(StoreError::Status { status: 503, .. }) => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}
