use super::decode::{self, envelope, DecodeError};
use super::worker::Worker;
use crate::config::DecodePolicy;
use crate::metrics::*;
use crate::node::{Mailbox, Node, Signal};
use crate::store::{ClientConfig, ClientFactory, ClusterNode, StoreError, Transport};
use crate::term::{Pid, Term};

use ringlog::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("{0}")]
    Transport(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("timed out building a client for {0}")]
    Timeout(ClientConfig),
}

#[derive(Clone, Debug)]
pub struct RegistrySettings {
    /// Buffer size for cluster requests whose numbers don't fit.
    pub default_buffer_kb: u32,
    pub connect_timeout: Duration,
    pub decode_policy: DecodePolicy,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            default_buffer_kb: 16,
            connect_timeout: Duration::from_secs(5),
            decode_policy: DecodePolicy::Reply,
        }
    }
}

pub struct Registry {
    mailbox: Mailbox,
    factory: Arc<dyn ClientFactory>,
    runtime: Handle,
    pool: JoinSet<()>,
    settings: RegistrySettings,
}

impl Registry {
    pub fn new(
        node: &Node,
        name: &str,
        factory: Arc<dyn ClientFactory>,
        runtime: Handle,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            mailbox: node.create_named_mailbox(name),
            factory,
            runtime,
            pool: JoinSet::new(),
            settings,
        }
    }

    pub fn pid(&self) -> &Pid {
        self.mailbox.pid()
    }

    /// Serve spawn requests until an exit signal arrives, then stop every
    /// worker.
    pub async fn run(mut self) {
        info!("registry {} started", self.pid());

        loop {
            tokio::select! {
                signal = self.mailbox.receive() => match signal {
                    Signal::Message(message) => self.handle(&message).await,
                    Signal::Exit { reason, .. } => {
                        info!("registry received exit ({reason}), stopping {} workers", self.pool.len());
                        break;
                    }
                },
                Some(result) = self.pool.join_next(), if !self.pool.is_empty() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            error!("worker task panicked: {e}");
                        }
                    }
                }
            }
        }

        self.pool.abort_all();
        while self.pool.join_next().await.is_some() {}
        self.mailbox.exit("interrupted");
    }

    async fn handle(&mut self, message: &Term) {
        SPAWN.increment();

        let (from, payload) = match envelope(message) {
            Ok(parts) => parts,
            Err(e) => {
                SPAWN_EX.increment();
                warn!("registry dropped {message}: {e}");
                return;
            }
        };

        let reply = match self.spawn(payload).await {
            Ok(pid) => {
                SPAWN_OK.increment();
                Term::Pid(pid)
            }
            Err(e) => {
                SPAWN_EX.increment();
                warn!("spawn request {payload} from {from} failed: {e}");
                Term::tuple(vec![Term::atom("error"), Term::string(&e.to_string())])
            }
        };

        self.mailbox.send(from, reply);
    }

    async fn spawn(&mut self, payload: &Term) -> Result<Pid, SpawnError> {
        let config = self.client_config(payload)?;

        let client = match timeout(
            self.settings.connect_timeout,
            self.factory.new_client(&config),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(SpawnError::Timeout(config)),
        };

        let worker = Worker::new(
            self.mailbox.node().create_mailbox(),
            client,
            self.settings.decode_policy,
        );
        let pid = worker.pid().clone();
        self.pool.spawn_on(worker.run(), &self.runtime);

        info!("spawned worker {pid} for {config}");
        Ok(pid)
    }

    fn client_config(&self, payload: &Term) -> Result<ClientConfig, SpawnError> {
        match payload.as_tuple().map(|e| e.len()) {
            Some(4) => single(payload),
            Some(3) => self.cluster(payload),
            _ => Err(DecodeError::expected("a spawn request", payload).into()),
        }
    }

    /// `{[{HostTuple, Port}, ...], BufferSizeKb, Transport}`
    fn cluster(&self, payload: &Term) -> Result<ClientConfig, SpawnError> {
        let elements = decode::tuple(payload, 3)?;

        let mut in_range = true;
        let mut nodes = Vec::new();
        for member in decode::list(&elements[0])? {
            let member = decode::tuple(member, 2)?;
            let host = host(&member[0])?;
            match decode::integer::<u16>(&member[1], "port") {
                Ok(port) => nodes.push(ClusterNode::new(host, port)),
                Err(DecodeError::Range { .. }) => {
                    warn!("dropping cluster member {host} with port {}", member[1]);
                    in_range = false;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let buffer_kb = match decode::integer::<u32>(&elements[1], "buffer size") {
            Ok(kb) if in_range => kb,
            Ok(_) | Err(DecodeError::Range { .. }) => {
                debug!(
                    "cluster request out of range, using {}KB buffers",
                    self.settings.default_buffer_kb
                );
                self.settings.default_buffer_kb
            }
            Err(e) => return Err(e.into()),
        };

        Ok(ClientConfig::Cluster {
            nodes,
            buffer_kb,
            transport: transport(&elements[2])?,
        })
    }
}

/// `{HostTuple, Port, BufferSizeKb, Transport}`
fn single(payload: &Term) -> Result<ClientConfig, SpawnError> {
    let elements = decode::tuple(payload, 4)?;
    Ok(ClientConfig::Single {
        host: host(&elements[0])?,
        port: decode::integer(&elements[1], "port")?,
        buffer_kb: decode::integer(&elements[2], "buffer size")?,
        transport: transport(&elements[3])?,
    })
}

/// Join the elements of a host tuple with dots, so `{127,0,0,1}` becomes
/// `"127.0.0.1"`.
fn host(term: &Term) -> Result<String, DecodeError> {
    let octets = term
        .as_tuple()
        .ok_or_else(|| DecodeError::expected("a host tuple", term))?;
    Ok(octets
        .iter()
        .map(|o| o.to_string())
        .collect::<Vec<_>>()
        .join("."))
}

fn transport(term: &Term) -> Result<Transport, SpawnError> {
    decode::atom(term)?
        .parse()
        .map_err(SpawnError::Transport)
}
