use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use walkdir::WalkDir;
use super::{ObjectBody, ObjectInfo, ObjectStorage, PresignMethod, PresignedUrl, Presigner, StorageError};

const PARTIAL_SUFFIX: &str = ".part";

/// Object storage on a local directory. `alice/clip.mp4` lives at `<root>/alice/clip.mp4`.
#[derive(Debug, Clone)]
pub struct LocalObjectStorage {
    root: PathBuf,
    presigner: Presigner,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>, presigner: Presigner) -> Self {
        Self {
            root: root.into(),
            presigner,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn presigner(&self) -> &Presigner {
        &self.presigner
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let clean = !key.is_empty()
            && !key.ends_with(PARTIAL_SUFFIX)
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        key: key.to_string(),
        source,
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn put(&self, key: &str, mut body: ObjectBody) -> Result<u64, StorageError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error(key))?;
        }

        // Write beside the target and rename so readers never see a torn object
        let partial = path.with_file_name(format!(
            ".{}.{}{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("object"),
            uuid::Uuid::new_v4().simple(),
            PARTIAL_SUFFIX
        ));
        let written = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            let n = tokio::io::copy(&mut body.reader, &mut file).await?;
            file.sync_all().await?;
            Ok::<u64, std::io::Error>(n)
        }
        .await;

        let written = match written {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(io_error(key)(e));
            }
        };
        if let Err(e) = tokio::fs::rename(&partial, &path).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(io_error(key)(e));
        }

        debug!("Stored object {} ({} bytes)", key, written);
        Ok(written)
    }

    async fn get(&self, key: &str) -> Result<ObjectBody, StorageError> {
        let path = self.object_path(key)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => return Err(io_error(key)(e)),
        };
        let len = file.metadata().await.map_err(io_error(key))?.len();
        Ok(ObjectBody::new(Some(len), Box::new(file)))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key)(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let prefix_owned = prefix.clone();
        let listed = tokio::task::spawn_blocking(move || {
            let mut objects = Vec::new();
            if !root.exists() {
                return objects;
            }
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("Error reading object entry: {}", e);
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let hidden = entry.file_name().to_string_lossy().starts_with('.');
                if hidden || !key.starts_with(&prefix) {
                    continue;
                }
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                objects.push(ObjectInfo { key, size });
            }
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            objects
        })
        .await
        .map_err(|e| StorageError::Io {
            key: prefix_owned,
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })?;
        Ok(listed)
    }

    fn presign(&self, key: &str, method: PresignMethod, ttl: Duration) -> Result<PresignedUrl, StorageError> {
        self.object_path(key)?;
        Ok(self.presigner.sign(key, method, ttl, Utc::now())?)
    }
}
