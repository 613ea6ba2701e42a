use std::sync::Arc;
use std::time::Duration;
use log::{debug, warn};
use crate::cache::Cache;
use crate::model::{progress_cache_key, progress_sort_key, ProgressRecord, ProgressStatus, StoredItem};
use crate::store::{MetadataStore, StoreError};

/// Durable progress records with a write-through, read-through cache.
pub struct ProgressStore {
    store: Arc<dyn MetadataStore>,
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl ProgressStore {
    pub fn new(store: Arc<dyn MetadataStore>, cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self { store, cache, ttl }
    }

    /// Create the `0/started` record for a new submission. Errors propagate.
    pub async fn initialize(&self, user: &str, tracking_id: &str) -> Result<ProgressRecord, StoreError> {
        let record = ProgressRecord::new(user, tracking_id, 0, ProgressStatus::Started);
        self.write(record.clone()).await?;
        Ok(record)
    }

    /// Best-effort progress update; failures are logged and swallowed.
    pub async fn record_progress(&self, user: &str, tracking_id: &str, percent: i64, status: ProgressStatus) {
        let record = ProgressRecord::new(user, tracking_id, percent, status);
        debug!("Progress {}: {}% {}", tracking_id, record.percent, record.status);
        if let Err(e) = self.write(record).await {
            warn!("Failed to record progress for {} ({}): {}", tracking_id, status, e);
        }
    }

    /// Cache first, then the durable store. `None` means nothing is known.
    pub async fn read_progress(&self, user: &str, tracking_id: &str) -> Result<Option<ProgressRecord>, StoreError> {
        let key = progress_cache_key(user, tracking_id);
        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<ProgressRecord>(&raw) {
                Ok(record) => return Ok(Some(record)),
                Err(e) => warn!("Discarding unreadable cached progress {}: {}", key, e),
            },
            Ok(None) => {}
            Err(e) => warn!("Progress cache read failed for {}: {}", key, e),
        }

        let record = match self.store.get(user, &progress_sort_key(tracking_id)).await? {
            Some(StoredItem::Progress(record)) => record,
            Some(other) => {
                warn!("Unexpected record kind under {}: {:?}", key, other.sort_key());
                return Ok(None);
            }
            None => return Ok(None),
        };

        self.fill_cache(&key, &record).await;
        Ok(Some(record))
    }

    /// Records not yet `completed` or `error`, across all users
    pub async fn unfinished(&self) -> Result<Vec<ProgressRecord>, StoreError> {
        Ok(self
            .store
            .scan()
            .await?
            .into_iter()
            .filter_map(|item| match item {
                StoredItem::Progress(p) if !p.status.is_terminal() => Some(p),
                _ => None,
            })
            .collect())
    }

    async fn write(&self, record: ProgressRecord) -> Result<(), StoreError> {
        let key = progress_cache_key(&record.username, &record.tracking_id);
        self.store.put(StoredItem::Progress(record.clone())).await?;
        self.fill_cache(&key, &record).await;
        Ok(())
    }

    async fn fill_cache(&self, key: &str, record: &ProgressRecord) {
        let failed = match serde_json::to_string(record) {
            Ok(json) => self.cache.set(key, json, self.ttl).await.err().map(|e| e.to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = failed {
            warn!("Progress cache write failed for {}: {}", key, reason);
            // A stale entry must not outlive a newer durable write
            if let Err(e) = self.cache.delete(key).await {
                warn!("Failed to evict stale progress {}: {}", key, e);
            }
        }
    }
}
