use std::path::{Path, PathBuf};
use std::sync::Arc;
use humansize::{format_size, DECIMAL};
use log::{info, warn};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use crate::objects::{ObjectBody, ObjectStorage, StorageError};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("source object not found: {key}")]
    NotFound { key: String },
    #[error("source object {key} has no content")]
    Empty { key: String },
    #[error("object {key} truncated: expected {expected} bytes, got {got}")]
    Truncated { key: String, expected: u64, got: u64 },
    #[error("local I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("storage error for {key}: {source}")]
    Storage {
        key: String,
        #[source]
        source: StorageError,
    },
    #[error("invalid object name: {0}")]
    InvalidName(String),
}

/// Object key for a user's file: `<user>/<fileName>`
pub fn object_key(user: &str, file_name: &str) -> Result<String, TransferError> {
    let plain = |s: &str| !s.is_empty() && s != "." && s != ".." && !s.contains('/') && !s.contains('\\');
    if !plain(user) || !plain(file_name) {
        return Err(TransferError::InvalidName(format!("{}/{}", user, file_name)));
    }
    Ok(format!("{}/{}", user, file_name))
}

/// Moves media between object storage and the local scratch area.
#[derive(Clone)]
pub struct ObjectTransfer {
    storage: Arc<dyn ObjectStorage>,
}

impl ObjectTransfer {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn ObjectStorage> {
        &self.storage
    }

    /// Download `<user>/<fileName>` to `dest`. Returns bytes written.
    pub async fn fetch(&self, user: &str, file_name: &str, dest: &Path) -> Result<u64, TransferError> {
        let key = object_key(user, file_name)?;
        let mut body = match self.storage.get(&key).await {
            Ok(b) => b,
            Err(StorageError::NotFound(_)) => return Err(TransferError::NotFound { key }),
            Err(source) => return Err(TransferError::Storage { key, source }),
        };

        let expected = match body.content_length {
            Some(n) if n > 0 => n,
            _ => return Err(TransferError::Empty { key }),
        };

        let io_err = |source: std::io::Error| TransferError::Io {
            path: dest.to_path_buf(),
            source,
        };
        let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;
        let got = tokio::io::copy(&mut body.reader, &mut file).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;

        if got != expected {
            return Err(TransferError::Truncated { key, expected, got });
        }

        info!("📥 Downloaded {} ({})", key, format_size(got, DECIMAL));
        Ok(got)
    }

    /// Upload a local file to `<user>/<basename>`. Returns the remote file name.
    pub async fn push(&self, local: &Path, user: &str) -> Result<String, TransferError> {
        let file_name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::InvalidName(local.display().to_string()))?
            .to_string();
        let key = object_key(user, &file_name)?;

        let io_err = |source: std::io::Error| TransferError::Io {
            path: local.to_path_buf(),
            source,
        };
        let file = tokio::fs::File::open(local).await.map_err(io_err)?;
        let len = file.metadata().await.map_err(io_err)?.len();

        match self.storage.put(&key, ObjectBody::new(Some(len), Box::new(file))).await {
            Ok(_) => {}
            Err(source @ StorageError::Partial { .. }) => {
                if let Err(e) = self.storage.delete(&key).await {
                    warn!("Failed to clean up partial upload {}: {}", key, e);
                }
                return Err(TransferError::Storage { key, source });
            }
            Err(source) => return Err(TransferError::Storage { key, source }),
        }

        info!("📤 Uploaded {} ({})", key, format_size(len, DECIMAL));
        Ok(file_name)
    }
}
