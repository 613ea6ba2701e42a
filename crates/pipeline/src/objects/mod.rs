//! Object storage collaborator: keyed blobs plus presigned access.

pub mod local;
pub mod presign;

use std::fmt;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncRead;

pub use local::LocalObjectStorage;
pub use presign::{PresignError, Presigner};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("object I/O error for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    /// The write failed after the target key was touched; it may hold a torn object
    #[error("partial write to {key}: {source}")]
    Partial {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Presign(#[from] PresignError),
}

/// A streamed object body with its advertised length
pub struct ObjectBody {
    pub content_length: Option<u64>,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl ObjectBody {
    pub fn new(content_length: Option<u64>, reader: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self { content_length, reader }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64;
        Self::new(Some(len), Box::new(std::io::Cursor::new(bytes)))
    }
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBody")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PresignMethod {
    Get,
    Put,
}

impl PresignMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresignMethod::Get => "GET",
            PresignMethod::Put => "PUT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "GET" => Some(PresignMethod::Get),
            "PUT" => Some(PresignMethod::Put),
            _ => None,
        }
    }
}

/// Time-boxed, credential-free link to one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresignedUrl {
    pub url: String,
    pub method: PresignMethod,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store a body under `key`, replacing any previous object. Returns bytes written.
    ///
    /// Any error other than `Partial` leaves the previous object untouched.
    async fn put(&self, key: &str, body: ObjectBody) -> Result<u64, StorageError>;

    async fn get(&self, key: &str) -> Result<ObjectBody, StorageError>;

    /// Remove `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError>;

    fn presign(&self, key: &str, method: PresignMethod, ttl: Duration) -> Result<PresignedUrl, StorageError>;
}
