use std::sync::Arc;
use anyhow::{Context, Result};
use log::info;
use crate::auth::{parse_bearer, AuthError, Identity, IdentityVerifier, StaticTokenVerifier};
use crate::cache::{Cache, MemoryCache};
use crate::catalog::{ActivityLog, FileCatalog};
use crate::config::PipelineConfig;
use crate::encoder::{Encoder, FfmpegEncoder};
use crate::objects::{LocalObjectStorage, ObjectStorage, Presigner};
use crate::orchestrator::Orchestrator;
use crate::progress::ProgressStore;
use crate::registry::JobRegistry;
use crate::service::TranscodeService;
use crate::store::{FileStore, MetadataStore};
use crate::transfer::ObjectTransfer;
use crate::worker::WorkerPool;

/// External collaborators the pipeline is wired against
pub struct Collaborators {
    pub store: Arc<dyn MetadataStore>,
    pub cache: Arc<dyn Cache>,
    pub storage: Arc<dyn ObjectStorage>,
    pub encoder: Arc<dyn Encoder>,
    pub verifier: Arc<dyn IdentityVerifier>,
}

/// Fully wired pipeline. Built once at startup and shared.
pub struct App {
    config: PipelineConfig,
    service: Arc<TranscodeService>,
    storage: Arc<dyn ObjectStorage>,
    verifier: Arc<dyn IdentityVerifier>,
}

impl App {
    /// Wire the on-disk collaborators described by `cfg`
    pub fn build(cfg: PipelineConfig) -> Result<Self> {
        for dir in [&cfg.state_dir, &cfg.object_root, &cfg.scratch_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }

        let presigner = Presigner::new(&cfg.presign_secret, &cfg.object_base_url)
            .with_context(|| format!("Invalid object_base_url: {}", cfg.object_base_url))?;

        let parts = Collaborators {
            store: Arc::new(FileStore::new(&cfg.state_dir)),
            cache: Arc::new(MemoryCache::new()),
            storage: Arc::new(LocalObjectStorage::new(&cfg.object_root, presigner)),
            encoder: Arc::new(FfmpegEncoder::from_config(&cfg)),
            verifier: Arc::new(StaticTokenVerifier::new(cfg.tokens.clone(), cfg.admin_users.clone())),
        };

        info!("State dir: {}", cfg.state_dir.display());
        info!("Object root: {}", cfg.object_root.display());
        info!("Scratch dir: {}", cfg.scratch_dir.display());
        info!("Max concurrent jobs: {}", cfg.max_concurrent_jobs);

        Ok(Self::with_parts(cfg, parts))
    }

    /// Wire the pipeline around caller-supplied collaborators
    pub fn with_parts(cfg: PipelineConfig, parts: Collaborators) -> Self {
        let progress = Arc::new(ProgressStore::new(
            parts.store.clone(),
            parts.cache.clone(),
            cfg.progress_cache_ttl(),
        ));
        let catalog = Arc::new(FileCatalog::new(
            parts.store.clone(),
            parts.cache.clone(),
            cfg.file_list_cache_ttl(),
        ));
        let activity = Arc::new(ActivityLog::new(parts.store.clone()));
        let registry = Arc::new(JobRegistry::new());

        let orchestrator = Arc::new(Orchestrator::new(
            ObjectTransfer::new(parts.storage.clone()),
            parts.encoder,
            progress.clone(),
            catalog.clone(),
            registry.clone(),
            cfg.scratch_dir.clone(),
            cfg.sampler_interval(),
        ));
        let pool = Arc::new(WorkerPool::new(
            orchestrator,
            registry,
            activity.clone(),
            cfg.max_concurrent_jobs,
        ));
        let service = Arc::new(TranscodeService::new(
            catalog,
            progress,
            activity,
            parts.storage.clone(),
            pool,
            cfg.presign_ttl(),
        ));

        Self {
            config: cfg,
            service,
            storage: parts.storage,
            verifier: parts.verifier,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn service(&self) -> &Arc<TranscodeService> {
        &self.service
    }

    pub fn storage(&self) -> &Arc<dyn ObjectStorage> {
        &self.storage
    }

    pub async fn identify(&self, token: &str) -> Result<Identity, AuthError> {
        self.verifier.verify(token).await
    }

    /// Resolve an `Authorization` header value
    pub async fn identify_header(&self, header: &str) -> Result<Identity, AuthError> {
        let token = parse_bearer(header)?;
        self.verifier.verify(token).await
    }

    /// Cancel in-flight work and wait for every job to record its terminal status
    pub async fn shutdown(&self) {
        self.service.pool().cancel_all();
        self.service.pool().wait_idle().await;
    }
}
