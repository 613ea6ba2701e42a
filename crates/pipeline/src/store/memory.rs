use std::collections::BTreeMap;
use async_trait::async_trait;
use tokio::sync::RwLock;
use crate::model::StoredItem;
use super::{MetadataStore, StoreError};

/// In-process table, ordered by `(user, sort_key)`
#[derive(Default)]
pub struct MemoryStore {
    items: RwLock<BTreeMap<(String, String), StoredItem>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn put(&self, item: StoredItem) -> Result<(), StoreError> {
        let key = (item.user().to_string(), item.sort_key());
        self.items.write().await.insert(key, item);
        Ok(())
    }

    async fn get(&self, user: &str, sort_key: &str) -> Result<Option<StoredItem>, StoreError> {
        let key = (user.to_string(), sort_key.to_string());
        Ok(self.items.read().await.get(&key).cloned())
    }

    async fn query(&self, user: &str) -> Result<Vec<StoredItem>, StoreError> {
        let items = self.items.read().await;
        Ok(items
            .iter()
            .filter(|((u, _), _)| u == user)
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn scan(&self) -> Result<Vec<StoredItem>, StoreError> {
        Ok(self.items.read().await.values().cloned().collect())
    }

    async fn delete(&self, user: &str, sort_key: &str) -> Result<bool, StoreError> {
        let key = (user.to_string(), sort_key.to_string());
        Ok(self.items.write().await.remove(&key).is_some())
    }
}
