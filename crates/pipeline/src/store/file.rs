use std::path::{Path, PathBuf};
use async_trait::async_trait;
use log::{debug, warn};
use walkdir::WalkDir;
use crate::model::StoredItem;
use super::{MetadataStore, StoreError};

/// Metadata table persisted as one JSON file per item:
/// `<root>/<user>/<sort_key>.json`, both components escaped.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn user_dir(&self, user: &str) -> PathBuf {
        self.root.join(escape_component(user))
    }

    fn item_path(&self, user: &str, sort_key: &str) -> PathBuf {
        self.user_dir(user)
            .join(format!("{}.json", escape_component(sort_key)))
    }
}

/// Escape a key component into a safe single path segment
fn escape_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for (i, b) in raw.bytes().enumerate() {
        let plain = b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'@') || (b == b'.' && i > 0);
        if plain {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn read_item(path: &Path) -> Result<StoredItem, StoreError> {
    let content = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Load every item under a store root, skipping unreadable files
pub fn load_all_items(root: &Path) -> Result<Vec<StoredItem>, StoreError> {
    let mut items = Vec::new();
    if !root.exists() {
        return Ok(items);
    }

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading store entry: {}", e);
                continue;
            }
        };
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        match read_item(path) {
            Ok(item) => items.push(item),
            Err(e) => warn!("Skipping store record: {}", e),
        }
    }

    items.sort_by(|a, b| (a.user(), a.sort_key()).cmp(&(b.user(), b.sort_key())));
    Ok(items)
}

fn run_blocking_error(e: tokio::task::JoinError) -> StoreError {
    StoreError::Backend(format!("store worker failed: {}", e))
}

#[async_trait]
impl MetadataStore for FileStore {
    async fn put(&self, item: StoredItem) -> Result<(), StoreError> {
        let dir = self.user_dir(item.user());
        let path = self.item_path(item.user(), &item.sort_key());
        let body = serde_json::to_vec_pretty(&item).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::Io { path: dir.clone(), source })?;

        // Unique temp name so concurrent writers of one key never share a file
        let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|source| StoreError::Io { path: tmp.clone(), source })?;
        if let Err(source) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::Io { path, source });
        }

        debug!("Stored {} for {}", item.sort_key(), item.user());
        Ok(())
    }

    async fn get(&self, user: &str, sort_key: &str) -> Result<Option<StoredItem>, StoreError> {
        let path = self.item_path(user, sort_key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StoreError::Corrupt { path, source })
    }

    async fn query(&self, user: &str) -> Result<Vec<StoredItem>, StoreError> {
        let dir = self.user_dir(user);
        let user = user.to_string();
        tokio::task::spawn_blocking(move || {
            let items = load_all_items(&dir)?;
            Ok::<Vec<StoredItem>, StoreError>(items.into_iter().filter(|i| i.user() == user).collect())
        })
        .await
        .map_err(run_blocking_error)?
    }

    async fn scan(&self) -> Result<Vec<StoredItem>, StoreError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || load_all_items(&root))
            .await
            .map_err(run_blocking_error)?
    }

    async fn delete(&self, user: &str, sort_key: &str) -> Result<bool, StoreError> {
        let path = self.item_path(user, sort_key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}
