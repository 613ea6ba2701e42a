use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, warn};
use crate::cache::Cache;
use crate::model::{file_sort_key, files_cache_key, ActivityRecord, FileMetadataRecord, StoredItem};
use crate::store::{MetadataStore, StoreError};

/// File metadata records plus the cached per-user listing.
///
/// The `<user>_files` entry is never patched in place: every write or delete
/// re-reads the user's files from the durable store and overwrites it.
pub struct FileCatalog {
    store: Arc<dyn MetadataStore>,
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl FileCatalog {
    pub fn new(store: Arc<dyn MetadataStore>, cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self { store, cache, ttl }
    }

    pub async fn save(&self, record: FileMetadataRecord) -> Result<(), StoreError> {
        let user = record.username.clone();
        self.store.put(StoredItem::File(record)).await?;
        self.refresh(&user).await?;
        Ok(())
    }

    pub async fn get(&self, user: &str, file_name: &str) -> Result<Option<FileMetadataRecord>, StoreError> {
        match self.store.get(user, &file_sort_key(file_name)).await? {
            Some(StoredItem::File(record)) => Ok(Some(record)),
            _ => Ok(None),
        }
    }

    /// Read-modify-write of one record. Returns false when it does not exist.
    pub async fn update<F>(&self, user: &str, file_name: &str, apply: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut FileMetadataRecord) + Send,
    {
        let Some(mut record) = self.get(user, file_name).await? else {
            return Ok(false);
        };
        apply(&mut record);
        self.save(record).await?;
        Ok(true)
    }

    /// Like `update`, but only while the record still belongs to `progress_id`.
    ///
    /// A re-upload under the same name replaces the record with a new
    /// progress id; an older job must not write over it.
    pub async fn update_for<F>(
        &self,
        user: &str,
        file_name: &str,
        progress_id: &str,
        apply: F,
    ) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut FileMetadataRecord) + Send,
    {
        let Some(mut record) = self.get(user, file_name).await? else {
            return Ok(false);
        };
        if record.progress_id != progress_id {
            debug!(
                "Skipping update of {} for {}: record now belongs to {}",
                file_name, progress_id, record.progress_id
            );
            return Ok(false);
        }
        apply(&mut record);
        self.save(record).await?;
        Ok(true)
    }

    /// Files of one user in upload order, served from cache when possible
    pub async fn list(&self, user: &str) -> Result<Vec<FileMetadataRecord>, StoreError> {
        let key = files_cache_key(user);
        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<FileMetadataRecord>>(&raw) {
                Ok(files) => {
                    debug!("Returning cached file metadata for {}", user);
                    return Ok(files);
                }
                Err(e) => warn!("Discarding unreadable cached listing {}: {}", key, e),
            },
            Ok(None) => {}
            Err(e) => warn!("File listing cache read failed for {}: {}", key, e),
        }
        self.refresh(user).await
    }

    /// Every file record in the table (admin view)
    pub async fn all_files(&self) -> Result<Vec<FileMetadataRecord>, StoreError> {
        let mut files: Vec<_> = self
            .store
            .scan()
            .await?
            .into_iter()
            .filter_map(|item| match item {
                StoredItem::File(f) => Some(f),
                _ => None,
            })
            .collect();
        files.sort_by(|a, b| a.upload_time.cmp(&b.upload_time));
        Ok(files)
    }

    pub async fn delete(&self, user: &str, file_name: &str) -> Result<bool, StoreError> {
        let existed = self.store.delete(user, &file_sort_key(file_name)).await?;
        self.refresh(user).await?;
        Ok(existed)
    }

    async fn refresh(&self, user: &str) -> Result<Vec<FileMetadataRecord>, StoreError> {
        let mut files: Vec<_> = self
            .store
            .query(user)
            .await?
            .into_iter()
            .filter_map(|item| match item {
                StoredItem::File(f) => Some(f),
                _ => None,
            })
            .collect();
        files.sort_by(|a, b| a.upload_time.cmp(&b.upload_time));

        let key = files_cache_key(user);
        let failed = match serde_json::to_string(&files) {
            Ok(json) => self.cache.set(&key, json, self.ttl).await.err().map(|e| e.to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = failed {
            warn!("File listing cache write failed for {}: {}", key, reason);
            if let Err(e) = self.cache.delete(&key).await {
                warn!("Failed to evict stale listing {}: {}", key, e);
            }
        }
        Ok(files)
    }
}

/// Append-only user activity trail. Writes are best-effort.
pub struct ActivityLog {
    store: Arc<dyn MetadataStore>,
}

impl ActivityLog {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, user: &str, activity: &str) {
        let entry = ActivityRecord::new(user, activity);
        match self.store.put(StoredItem::Activity(entry)).await {
            Ok(()) => info!("User activity saved: {} for user {}", activity, user),
            Err(e) => warn!("Error saving user activity for {}: {}", user, e),
        }
    }

    /// Activity entries of one user, oldest first
    pub async fn history(&self, user: &str) -> Result<Vec<ActivityRecord>, StoreError> {
        let mut entries: Vec<_> = self
            .store
            .query(user)
            .await?
            .into_iter()
            .filter_map(|item| match item {
                StoredItem::Activity(a) => Some(a),
                _ => None,
            })
            .collect();
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::model::{FileStatus, ProgressRecord, ProgressStatus};
    use crate::store::MemoryStore;

    fn catalog() -> (FileCatalog, Arc<MemoryStore>, Arc<MemoryCache>) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let catalog = FileCatalog::new(store.clone(), cache.clone(), Duration::from_secs(3600));
        (catalog, store, cache)
    }

    #[tokio::test]
    async fn test_listing_excludes_other_record_kinds() {
        let (catalog, store, _) = catalog();
        store
            .put(StoredItem::Progress(ProgressRecord::new("alice", "alice_1", 0, ProgressStatus::Started)))
            .await
            .unwrap();
        catalog
            .save(FileMetadataRecord::uploaded("alice", "clip.mp4", "alice_1"))
            .await
            .unwrap();

        let files = catalog.list("alice").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name, "clip.mp4");
    }

    #[tokio::test]
    async fn test_delete_overwrites_cached_listing() {
        let (catalog, _, cache) = catalog();
        catalog
            .save(FileMetadataRecord::uploaded("alice", "clip.mp4", "alice_1"))
            .await
            .unwrap();
        assert_eq!(catalog.list("alice").await.unwrap().len(), 1);

        assert!(catalog.delete("alice", "clip.mp4").await.unwrap());
        assert!(catalog.list("alice").await.unwrap().is_empty());
        assert_eq!(cache.get("alice_files").await.unwrap().as_deref(), Some("[]"));
    }

    #[tokio::test]
    async fn test_update_refreshes_listing() {
        let (catalog, _, _) = catalog();
        catalog
            .save(FileMetadataRecord::uploaded("alice", "clip.mp4", "alice_1"))
            .await
            .unwrap();
        let updated = catalog
            .update("alice", "clip.mp4", |f| {
                f.status = FileStatus::Completed;
                f.transcoded_file_name = Some("clip_transcoded.mp4".to_string());
            })
            .await
            .unwrap();
        assert!(updated);

        let files = catalog.list("alice").await.unwrap();
        assert_eq!(files[0].status, FileStatus::Completed);
        assert!(!catalog.update("alice", "missing.mp4", |_| {}).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_for_ignores_superseded_submission() {
        let (catalog, _, _) = catalog();
        catalog
            .save(FileMetadataRecord::uploaded("alice", "clip.mp4", "alice_1"))
            .await
            .unwrap();
        catalog
            .save(FileMetadataRecord::uploaded("alice", "clip.mp4", "alice_2"))
            .await
            .unwrap();

        let stale = catalog
            .update_for("alice", "clip.mp4", "alice_1", |f| f.status = FileStatus::Completed)
            .await
            .unwrap();
        assert!(!stale);
        let files = catalog.list("alice").await.unwrap();
        assert_eq!(files[0].status, FileStatus::Uploaded);
        assert_eq!(files[0].progress_id, "alice_2");

        assert!(catalog
            .update_for("alice", "clip.mp4", "alice_2", |f| f.status = FileStatus::Error)
            .await
            .unwrap());
        assert_eq!(catalog.list("alice").await.unwrap()[0].status, FileStatus::Error);
    }

    #[tokio::test]
    async fn test_all_files_spans_users() {
        let (catalog, _, _) = catalog();
        catalog.save(FileMetadataRecord::uploaded("alice", "a.mp4", "alice_1")).await.unwrap();
        catalog.save(FileMetadataRecord::uploaded("bob", "b.mp4", "bob_1")).await.unwrap();
        assert_eq!(catalog.all_files().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_activity_history() {
        let store = Arc::new(MemoryStore::new());
        let log = ActivityLog::new(store);
        log.record("alice", "Started processing file: clip.mp4").await;
        log.record("alice", "Transcoding completed for file: clip.mp4").await;

        let history = log.history("alice").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].activity.starts_with("Started"));
    }
}
