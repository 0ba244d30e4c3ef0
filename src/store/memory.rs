use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Keeps objects in a map shared by all clones. Every write bumps the
/// object's version, which is handed out as its version marker. The read
/// quorum of every fetch is recorded.
#[derive(Clone, Default)]
pub struct MemoryStore {
    objects: Arc<RwLock<HashMap<(String, String), (Bytes, u64)>>>,
    writes: Arc<AtomicUsize>,
    reads: Arc<std::sync::Mutex<Vec<u32>>>,
    client_id: Arc<std::sync::Mutex<Option<[u8; 4]>>>,
}

impl MemoryStore {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn read_quorums(&self) -> Vec<u32> {
        self.reads.lock().unwrap().clone()
    }

    pub fn client_id(&self) -> Option<[u8; 4]> {
        *self.client_id.lock().unwrap()
    }

    pub async fn value(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_owned(), key.to_owned()))
            .map(|(v, _)| v.clone())
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn fetch(
        &self,
        bucket: &str,
        key: &str,
        r: u32,
    ) -> Result<Option<StoredObject>, StoreError> {
        self.reads.lock().unwrap().push(r);
        let objects = self.objects.read().await;
        Ok(objects
            .get(&(bucket.to_owned(), key.to_owned()))
            .map(|(value, version)| StoredObject {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
                value: Some(value.clone()),
                vclock: Some(Bytes::copy_from_slice(&version.to_be_bytes())),
            }))
    }

    async fn store(&self, object: StoredObject, _w: u32, _dw: u32) -> Result<(), StoreError> {
        let mut objects = self.objects.write().await;
        let entry = objects
            .entry((object.bucket, object.key))
            .or_insert((Bytes::new(), 0));
        entry.0 = object.value.unwrap_or_default();
        entry.1 += 1;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str, _rw: u32) -> Result<(), StoreError> {
        self.objects
            .write()
            .await
            .remove(&(bucket.to_owned(), key.to_owned()));
        Ok(())
    }

    async fn set_client_id(&self, id: [u8; 4]) -> Result<(), StoreError> {
        *self.client_id.lock().unwrap() = Some(id);
        Ok(())
    }
}

pub struct FailingStore;

#[async_trait]
impl StoreClient for FailingStore {
    async fn fetch(&self, _: &str, _: &str, _: u32) -> Result<Option<StoredObject>, StoreError> {
        Err(StoreError::Server("connection reset".into()))
    }

    async fn store(&self, _: StoredObject, _: u32, _: u32) -> Result<(), StoreError> {
        Err(StoreError::Server("connection reset".into()))
    }

    async fn delete(&self, _: &str, _: &str, _: u32) -> Result<(), StoreError> {
        Err(StoreError::Server("connection reset".into()))
    }

    async fn set_client_id(&self, _: [u8; 4]) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Builds [`MemoryStore`] handles over one shared map and records every
/// configuration it was asked for.
#[derive(Default)]
pub struct MemoryFactory {
    pub store: MemoryStore,
    pub refuse: bool,
    built: AtomicUsize,
    configs: std::sync::Mutex<Vec<ClientConfig>>,
}

impl MemoryFactory {
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Default::default()
        }
    }

    pub fn built(&self) -> usize {
        self.built.load(Ordering::Relaxed)
    }

    pub fn configs(&self) -> Vec<ClientConfig> {
        self.configs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientFactory for MemoryFactory {
    async fn new_client(&self, config: &ClientConfig) -> Result<Arc<dyn StoreClient>, StoreError> {
        self.configs.lock().unwrap().push(config.clone());
        if self.refuse {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        self.built.fetch_add(1, Ordering::Relaxed);
        let client = Arc::new(self.store.clone());
        client.generate_and_set_client_id().await?;
        Ok(client)
    }
}
