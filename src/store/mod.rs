use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;
use ringlog::{debug, info};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

mod cluster;
mod rest;
#[cfg(test)]
pub mod memory;
mod pb;

pub use cluster::ClusterClient;
pub use rest::HttpClient;
pub use pb::PbClient;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(String),
    #[error("unexpected status {status} for {method} {path}")]
    Status {
        status: u16,
        method: &'static str,
        path: String,
    },
    #[error("server error: {0}")]
    Server(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transport {0} is not supported for a {1} configuration")]
    UnsupportedTransport(Transport, &'static str),
    #[error("cluster configuration has no nodes")]
    NoNodes,
}

/// An object as returned by a fetch. `vclock` is the store's version
/// marker; writing it back makes the write a conditional update.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoredObject {
    pub bucket: String,
    pub key: String,
    pub value: Option<Bytes>,
    pub vclock: Option<Bytes>,
}

impl StoredObject {
    pub fn new(bucket: &str, key: &str, value: Bytes) -> Self {
        Self {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            value: Some(value),
            vclock: None,
        }
    }

    /// An object with neither a value nor a version marker is as good as
    /// absent.
    pub fn is_missing(object: Option<&StoredObject>) -> bool {
        object.map_or(true, |o| o.value.is_none() && o.vclock.is_none())
    }
}

/// The store capability. A quorum of `0` means "use the store's default".
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn fetch(
        &self,
        bucket: &str,
        key: &str,
        r: u32,
    ) -> Result<Option<StoredObject>, StoreError>;

    async fn store(&self, object: StoredObject, w: u32, dw: u32) -> Result<(), StoreError>;

    async fn delete(&self, bucket: &str, key: &str, rw: u32) -> Result<(), StoreError>;

    async fn set_client_id(&self, id: [u8; 4]) -> Result<(), StoreError>;

    async fn generate_and_set_client_id(&self) -> Result<[u8; 4], StoreError> {
        let mut id = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut id);
        self.set_client_id(id).await?;
        Ok(id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    Pb,
    Http,
    PbCluster,
    HttpCluster,
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pb" => Ok(Self::Pb),
            "http" => Ok(Self::Http),
            "pbcluster" => Ok(Self::PbCluster),
            "httpcluster" => Ok(Self::HttpCluster),
            _ => Err(format!("unknown transport {s}")),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pb => "pb",
            Self::Http => "http",
            Self::PbCluster => "pbcluster",
            Self::HttpCluster => "httpcluster",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClusterNode {
    host: String,
    port: u16,
}

impl ClusterNode {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ClientConfig {
    Single {
        host: String,
        port: u16,
        transport: Transport,
        buffer_kb: u32,
    },
    Cluster {
        nodes: Vec<ClusterNode>,
        buffer_kb: u32,
        transport: Transport,
    },
}

impl fmt::Display for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single {
                host,
                port,
                transport,
                buffer_kb,
            } => write!(f, "{transport}://{host}:{port} (buffer {buffer_kb}KB)"),
            Self::Cluster {
                nodes,
                buffer_kb,
                transport,
            } => {
                write!(f, "{transport}://")?;
                for (i, node) in nodes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}:{}", node.host, node.port)?;
                }
                write!(f, " (buffer {buffer_kb}KB)")
            }
        }
    }
}

#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn new_client(&self, config: &ClientConfig) -> Result<Arc<dyn StoreClient>, StoreError>;
}

/// Builds protocol-buffers and HTTP clients, one fresh client per call.
#[derive(Clone, Copy, Debug, Default)]
pub struct RiakClientFactory;

#[async_trait]
impl ClientFactory for RiakClientFactory {
    async fn new_client(&self, config: &ClientConfig) -> Result<Arc<dyn StoreClient>, StoreError> {
        let client: Arc<dyn StoreClient> = match config {
            ClientConfig::Single {
                host,
                port,
                transport,
                buffer_kb,
            } => match transport {
                Transport::Pb => Arc::new(PbClient::new(host, *port, *buffer_kb)),
                Transport::Http => Arc::new(HttpClient::new(host, *port)),
                other => return Err(StoreError::UnsupportedTransport(*other, "single-node")),
            },
            ClientConfig::Cluster {
                nodes,
                buffer_kb,
                transport,
            } => {
                if nodes.is_empty() {
                    return Err(StoreError::NoNodes);
                }
                let members: Vec<Arc<dyn StoreClient>> = match transport {
                    Transport::Pb | Transport::PbCluster => nodes
                        .iter()
                        .map(|n| {
                            Arc::new(PbClient::new(n.host(), n.port(), *buffer_kb))
                                as Arc<dyn StoreClient>
                        })
                        .collect(),
                    Transport::Http | Transport::HttpCluster => nodes
                        .iter()
                        .map(|n| {
                            Arc::new(HttpClient::new(n.host(), n.port())) as Arc<dyn StoreClient>
                        })
                        .collect(),
                };
                Arc::new(ClusterClient::new(members))
            }
        };

        let id = client.generate_and_set_client_id().await?;
        debug!("client for {config} has id {:02x?}", id);

        Ok(client)
    }
}

/// Hands out one client per distinct [`ClientConfig`], building it with the
/// wrapped factory on first use.
pub struct SharedClientFactory<F> {
    inner: F,
    clients: Mutex<HashMap<ClientConfig, Arc<dyn StoreClient>>>,
}

impl<F: ClientFactory> SharedClientFactory<F> {
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            clients: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<F: ClientFactory> ClientFactory for SharedClientFactory<F> {
    async fn new_client(&self, config: &ClientConfig) -> Result<Arc<dyn StoreClient>, StoreError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(config) {
            return Ok(client.clone());
        }

        let client = self.inner.new_client(config).await?;
        info!("sharing client for {config}");
        clients.insert(config.clone(), client.clone());
        Ok(client)
    }
}
