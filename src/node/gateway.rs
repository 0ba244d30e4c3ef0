//! TCP gateway that connects a remote driver node to the local node.
//!
//! Every frame is a 4-byte big-endian length followed by an encoded term.
//! A session starts with `{connect, NodeName, Cookie}` from the client and an
//! `ok` (or `{error, Reason}`) from us. After that the client sends
//! `{send, To, Msg}` and `{exit, To, Reason}` frames, where `To` is a pid or a
//! registered name, and receives the same shapes for traffic addressed to
//! pids on its node.

use super::{Node, Outbound};
use crate::metrics::*;
use crate::term::{self, CodecError, Term};

use async_channel::unbounded;
use ringlog::{debug, error, info, warn};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad frame: {0}")]
    Codec(#[from] CodecError),
    #[error("frame of {size} bytes exceeds the limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("handshake failed: {0}")]
    Handshake(&'static str),
}

#[derive(Clone, Debug)]
pub struct GatewaySettings {
    pub cookie: Option<String>,
    pub max_frame_size: usize,
}

pub struct Gateway {
    listener: TcpListener,
    node: Node,
    settings: GatewaySettings,
}

impl Gateway {
    pub async fn bind(
        address: &str,
        node: Node,
        settings: GatewaySettings,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            node,
            settings,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("gateway listening on {addr}");
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    GATEWAY_CONNECT.increment();
                    let node = self.node.clone();
                    let settings = self.settings.clone();
                    tokio::spawn(async move {
                        GATEWAY_CONNECT_CURR.increment();
                        if let Err(e) = session(node, stream, peer, settings).await {
                            warn!("gateway session with {peer} ended: {e}");
                        }
                        GATEWAY_CONNECT_CURR.decrement();
                    });
                }
                Err(e) => {
                    error!("gateway accept failed: {e}");
                    return;
                }
            }
        }
    }
}

async fn session(
    node: Node,
    stream: TcpStream,
    peer: SocketAddr,
    settings: GatewaySettings,
) -> Result<(), GatewayError> {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let hello = match read_frame(&mut reader, settings.max_frame_size).await? {
        Some(term) => term,
        None => return Ok(()),
    };

    let remote = match handshake(&hello, &node, settings.cookie.as_deref()) {
        Ok(remote) => remote,
        Err(reason) => {
            let reply = Term::tuple(vec![Term::atom("error"), Term::atom(reason)]);
            write_frame(&mut writer, &reply).await?;
            return Err(GatewayError::Handshake(reason));
        }
    };

    let (tx, rx) = unbounded::<Outbound>();
    node.add_route(&remote, tx.clone());
    write_frame(&mut writer, &Term::atom("ok")).await?;
    info!("node {remote} connected from {peer}");

    let writer_task = tokio::spawn(async move {
        while let Ok(outbound) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &outbound.to_term()).await {
                debug!("gateway write failed: {e}");
                break;
            }
            FRAMES_TX.increment();
        }
    });

    let result = loop {
        match read_frame(&mut reader, settings.max_frame_size).await {
            Ok(Some(frame)) => {
                FRAMES_RX.increment();
                dispatch(&node, frame);
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    node.remove_route(&remote, &tx);
    writer_task.abort();
    info!("node {remote} disconnected");
    result
}

fn handshake(hello: &Term, node: &Node, cookie: Option<&str>) -> Result<String, &'static str> {
    let (name, offered) = match hello.as_tuple() {
        Some([tag, name, offered]) if tag.as_atom() == Some("connect") => (name, offered),
        _ => return Err("badhandshake"),
    };

    let name = name.as_atom().ok_or("badnode")?;
    if name.is_empty() || name == node.name() {
        return Err("badnode");
    }

    if let Some(expected) = cookie {
        let offered = match offered {
            Term::Atom(a) => a.as_bytes(),
            Term::Binary(b) => &b[..],
            Term::String(s) => &s[..],
            _ => return Err("badcookie"),
        };
        if offered != expected.as_bytes() {
            return Err("badcookie");
        }
    }

    Ok(name.to_owned())
}

fn dispatch(node: &Node, frame: Term) {
    let (kind, to, payload) = match frame {
        Term::Tuple(mut items) if items.len() == 3 => {
            let payload = items.pop();
            let to = items.pop();
            let kind = items.pop();
            match (kind, to, payload) {
                (Some(Term::Atom(kind)), Some(to), Some(payload)) => (kind, to, payload),
                _ => {
                    debug!("ignoring malformed gateway frame");
                    return;
                }
            }
        }
        other => {
            debug!("ignoring malformed gateway frame: {other}");
            return;
        }
    };

    match (kind.as_str(), to) {
        ("send", Term::Pid(pid)) => {
            node.send(&pid, payload);
        }
        ("send", Term::Atom(name)) => {
            node.send_named(&name, payload);
        }
        ("exit", Term::Pid(pid)) => {
            node.exit(&pid, None, payload);
        }
        ("exit", Term::Atom(name)) => {
            node.exit_named(&name, payload);
        }
        (kind, to) => debug!("ignoring gateway frame {kind} for {to}"),
    }
}

pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    limit: usize,
) -> Result<Option<Term>, GatewayError> {
    let size = match reader.read_u32().await {
        Ok(size) => size as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if size > limit {
        return Err(GatewayError::FrameTooLarge { size, limit });
    }

    let mut buf = vec![0; size];
    reader.read_exact(&mut buf).await?;
    Ok(Some(term::decode(&buf)?))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    term: &Term,
) -> Result<(), GatewayError> {
    let data = term::encode(term);
    writer.write_u32(data.len() as u32).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Signal;
    use crate::term::Pid;

    async fn start(cookie: Option<&str>) -> (Node, SocketAddr) {
        let node = Node::new("shim@test");
        let gateway = Gateway::bind(
            "127.0.0.1:0",
            node.clone(),
            GatewaySettings {
                cookie: cookie.map(str::to_owned),
                max_frame_size: 1024,
            },
        )
        .await
        .expect("bind");
        let addr = gateway.local_addr().expect("addr");
        tokio::spawn(gateway.serve());
        (node, addr)
    }

    async fn connect(addr: SocketAddr, name: &str, cookie: &str) -> (TcpStream, Term) {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let hello = Term::tuple(vec![
            Term::atom("connect"),
            Term::atom(name),
            Term::atom(cookie),
        ]);
        write_frame(&mut stream, &hello).await.expect("write");
        let reply = read_frame(&mut stream, 1024)
            .await
            .expect("read")
            .expect("frame");
        (stream, reply)
    }

    #[tokio::test]
    async fn rejects_wrong_cookie() {
        let (_node, addr) = start(Some("secret")).await;
        let (_stream, reply) = connect(addr, "driver@test", "guess").await;
        assert_eq!(
            reply,
            Term::tuple(vec![Term::atom("error"), Term::atom("badcookie")])
        );
    }

    #[tokio::test]
    async fn relays_messages_both_ways() {
        let (node, addr) = start(Some("secret")).await;
        let factory = node.create_named_mailbox("factory");

        let (mut stream, reply) = connect(addr, "driver@test", "secret").await;
        assert_eq!(reply, Term::atom("ok"));

        let driver = Pid::new("driver@test", 5, 0, 1);
        let frame = Term::tuple(vec![
            Term::atom("send"),
            Term::atom("factory"),
            Term::tuple(vec![Term::Pid(driver.clone()), Term::atom("hello")]),
        ]);
        write_frame(&mut stream, &frame).await.expect("write");

        let received = factory.receive().await;
        assert_eq!(
            received,
            Signal::Message(Term::tuple(vec![
                Term::Pid(driver.clone()),
                Term::atom("hello")
            ]))
        );

        assert!(factory.send(&driver, Term::atom("world")));
        let outbound = read_frame(&mut stream, 1024)
            .await
            .expect("read")
            .expect("frame");
        assert_eq!(
            outbound,
            Term::tuple(vec![
                Term::atom("send"),
                Term::Pid(driver),
                Term::atom("world")
            ])
        );
    }

    #[tokio::test]
    async fn exit_frames_reach_mailboxes() {
        let (node, addr) = start(None).await;
        let factory = node.create_named_mailbox("factory");
        let (mut stream, _) = connect(addr, "driver@test", "anything").await;

        let frame = Term::tuple(vec![
            Term::atom("exit"),
            Term::atom("factory"),
            Term::atom("interrupted"),
        ]);
        write_frame(&mut stream, &frame).await.expect("write");

        assert_eq!(
            factory.receive().await,
            Signal::Exit {
                from: None,
                reason: Term::atom("interrupted")
            }
        );
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let mut data: &[u8] = &[0, 0, 16, 0];
        match read_frame(&mut data, 1024).await {
            Err(GatewayError::FrameTooLarge { size: 4096, limit: 1024 }) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_eof_ends_the_stream() {
        let mut data: &[u8] = &[];
        assert!(matches!(read_frame(&mut data, 1024).await, Ok(None)));
    }

    #[tokio::test]
    async fn reconnect_keeps_the_newer_route() {
        let (node, addr) = start(None).await;
        let factory = node.create_named_mailbox("factory");

        let (old, _) = connect(addr, "driver@test", "anything").await;
        let (mut new, reply) = connect(addr, "driver@test", "anything").await;
        assert_eq!(reply, Term::atom("ok"));

        // the old session notices its peer is gone after the new one took over
        drop(old);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(node.has_route("driver@test"));

        let driver = Pid::new("driver@test", 5, 0, 1);
        assert!(factory.send(&driver, Term::atom("world")));
        let outbound = read_frame(&mut new, 1024)
            .await
            .expect("read")
            .expect("frame");
        assert_eq!(
            outbound,
            Term::tuple(vec![Term::atom("send"), Term::Pid(driver), Term::atom("world")])
        );
    }

    #[tokio::test]
    async fn deeply_nested_hello_ends_only_that_session() {
        let (_node, addr) = start(None).await;

        let mut frame = vec![131];
        for _ in 0..300 {
            frame.extend_from_slice(&[104, 1]);
        }
        frame.push(106);

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(&(frame.len() as u32).to_be_bytes())
            .await
            .expect("write");
        stream.write_all(&frame).await.expect("write");
        assert!(matches!(read_frame(&mut stream, 1024).await, Ok(None) | Err(_)));

        let (_stream, reply) = connect(addr, "driver@test", "anything").await;
        assert_eq!(reply, Term::atom("ok"));
    }
}
