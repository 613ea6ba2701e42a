pub mod app;
pub mod auth;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod encoder;
pub mod error;
pub mod model;
pub mod objects;
pub mod orchestrator;
pub mod probe;
pub mod progress;
pub mod registry;
pub mod sampler;
pub mod scratch;
pub mod service;
pub mod store;
pub mod transfer;
pub mod worker;

pub use app::{App, Collaborators};
pub use auth::{Identity, Role};
pub use config::{EncodeProfile, PipelineConfig};
pub use error::PipelineError;
pub use model::{FileMetadataRecord, FileWithProgress, ProgressRecord, ProgressStatus, ProgressView, SubmitReceipt};
pub use service::TranscodeService;
