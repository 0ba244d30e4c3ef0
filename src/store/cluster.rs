use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin over the members. Failures are not retried elsewhere.
pub struct ClusterClient {
    members: Vec<Arc<dyn StoreClient>>,
    next: AtomicUsize,
}

impl ClusterClient {
    pub fn new(members: Vec<Arc<dyn StoreClient>>) -> Self {
        Self {
            members,
            next: AtomicUsize::new(0),
        }
    }

    fn member(&self) -> Result<&Arc<dyn StoreClient>, StoreError> {
        if self.members.is_empty() {
            return Err(StoreError::NoNodes);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.members.len();
        Ok(&self.members[index])
    }
}

#[async_trait]
impl StoreClient for ClusterClient {
    async fn fetch(
        &self,
        bucket: &str,
        key: &str,
        r: u32,
    ) -> Result<Option<StoredObject>, StoreError> {
        self.member()?.fetch(bucket, key, r).await
    }

    async fn store(&self, object: StoredObject, w: u32, dw: u32) -> Result<(), StoreError> {
        self.member()?.store(object, w, dw).await
    }

    async fn delete(&self, bucket: &str, key: &str, rw: u32) -> Result<(), StoreError> {
        self.member()?.delete(bucket, key, rw).await
    }

    async fn set_client_id(&self, id: [u8; 4]) -> Result<(), StoreError> {
        for member in &self.members {
            member.set_client_id(id).await?;
        }
        Ok(())
    }
}
