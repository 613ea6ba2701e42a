//! Durable metadata table keyed by `(user, sort_key)`.

pub mod file;
pub mod memory;

use std::path::PathBuf;
use async_trait::async_trait;
use thiserror::Error;
use crate::model::StoredItem;

pub use file::{load_all_items, FileStore};
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt record at {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert or replace the item under its `(user, sort_key)`
    async fn put(&self, item: StoredItem) -> Result<(), StoreError>;

    async fn get(&self, user: &str, sort_key: &str) -> Result<Option<StoredItem>, StoreError>;

    /// Every item belonging to `user`, ordered by sort key
    async fn query(&self, user: &str) -> Result<Vec<StoredItem>, StoreError>;

    /// Every item in the table
    async fn scan(&self) -> Result<Vec<StoredItem>, StoreError>;

    /// Remove an item; returns whether it existed
    async fn delete(&self, user: &str, sort_key: &str) -> Result<bool, StoreError>;
}
