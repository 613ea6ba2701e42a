use std::path::PathBuf;
use thiserror::Error;
use crate::auth::AuthError;
use crate::encoder::EncodeError;
use crate::objects::StorageError;
use crate::store::StoreError;
use crate::transfer::TransferError;

/// Error surfaced by request handlers and by a failed orchestration
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("scratch directory {}: {source}", path.display())]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("job cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Short machine-readable category, used by the CLI exit output
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::Auth(AuthError::Unauthorized(_)) => "unauthorized",
            PipelineError::Auth(AuthError::Forbidden(_)) => "forbidden",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Transfer(_) => "transfer",
            PipelineError::Encode(_) => "encode",
            PipelineError::Store(_) => "store",
            PipelineError::Storage(_) => "storage",
            PipelineError::Scratch { .. } => "scratch",
            PipelineError::Cancelled => "cancelled",
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
