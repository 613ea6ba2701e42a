use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use crate::catalog::FileCatalog;
use crate::encoder::{EncodeError, EncodeRequest, Encoder};
use crate::error::PipelineError;
use crate::model::{FileStatus, ProgressStatus};
use crate::progress::ProgressStore;
use crate::registry::{JobHandle, JobRegistry, JobState};
use crate::sampler::ResourceSampler;
use crate::scratch::ScratchDir;
use crate::transfer::ObjectTransfer;

/// One accepted submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeJob {
    pub tracking_id: String,
    pub user: String,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub transcoded_file_name: String,
    pub source_bytes: u64,
}

/// Drives one job through download, encode and upload.
///
/// It is the only writer of a job's terminal progress status, and it writes
/// that status only after the tick forwarder has drained.
pub struct Orchestrator {
    transfer: ObjectTransfer,
    encoder: Arc<dyn Encoder>,
    progress: Arc<ProgressStore>,
    catalog: Arc<FileCatalog>,
    registry: Arc<JobRegistry>,
    scratch_root: PathBuf,
    sampler_interval: Duration,
}

impl Orchestrator {
    pub fn new(
        transfer: ObjectTransfer,
        encoder: Arc<dyn Encoder>,
        progress: Arc<ProgressStore>,
        catalog: Arc<FileCatalog>,
        registry: Arc<JobRegistry>,
        scratch_root: PathBuf,
        sampler_interval: Duration,
    ) -> Self {
        Self {
            transfer,
            encoder,
            progress,
            catalog,
            registry,
            scratch_root,
            sampler_interval,
        }
    }

    pub async fn run(
        &self,
        job: &TranscodeJob,
        handle: JobHandle,
        cancel: CancellationToken,
    ) -> Result<JobOutcome, PipelineError> {
        let sampler = ResourceSampler::start(job.tracking_id.clone(), self.sampler_interval);
        let result = match ScratchDir::create(&self.scratch_root, &job.tracking_id).await {
            Ok(scratch) => {
                let result = self.stages(job, handle, &cancel, &scratch).await;
                if let Err(e) = scratch.release().await {
                    warn!("Failed to remove scratch for {}: {}", job.tracking_id, e);
                }
                result
            }
            Err(source) => Err(PipelineError::Scratch {
                path: self.scratch_root.join(&job.tracking_id),
                source,
            }),
        };
        sampler.stop();

        match &result {
            Ok(outcome) => {
                self.progress
                    .record_progress(&job.user, &job.tracking_id, 100, ProgressStatus::Completed)
                    .await;
                let transcoded = outcome.transcoded_file_name.clone();
                self.update_file(job, move |f| {
                    f.status = FileStatus::Completed;
                    f.transcoded_file_name = Some(transcoded);
                })
                .await;
                self.registry.set_percent(handle, 100);
                self.registry.set_state(handle, JobState::Done);
                info!("✅ Transcoding completed for {} ({})", job.file_name, job.tracking_id);
            }
            Err(e) => {
                error!("❌ Transcoding failed for {} ({}): {}", job.file_name, job.tracking_id, e);
                self.progress
                    .record_progress(&job.user, &job.tracking_id, 0, ProgressStatus::Error)
                    .await;
                self.update_file(job, |f| f.status = FileStatus::Error).await;
                self.registry.set_state(handle, JobState::Error);
            }
        }
        result
    }

    async fn stages(
        &self,
        job: &TranscodeJob,
        handle: JobHandle,
        cancel: &CancellationToken,
        scratch: &ScratchDir,
    ) -> Result<JobOutcome, PipelineError> {
        ensure_live(cancel)?;
        self.registry.set_state(handle, JobState::Downloading);
        info!("🎬 Started processing {} for {} ({})", job.file_name, job.user, job.tracking_id);

        let input = scratch.input_path(&job.file_name);
        let output = scratch.output_path(&job.file_name);

        let source_bytes = self.transfer.fetch(&job.user, &job.file_name, &input).await?;
        ensure_live(cancel)?;

        let media = match self.encoder.probe(&input).await {
            Ok(media) => Some(media),
            Err(e) => {
                warn!("Could not probe {}: {}", input.display(), e);
                None
            }
        };
        let duration_secs = media.as_ref().and_then(|m| m.duration_secs);
        self.update_file(job, move |f| {
            f.size = Some(source_bytes);
            if let Some(media) = media {
                f.format = Some(media.format_name);
                f.resolution = media.resolution;
            }
            f.status = FileStatus::Transcoding;
        })
        .await;

        self.registry.set_state(handle, JobState::Encoding);
        info!("🔄 Transcoding {} -> {}", input.display(), output.display());
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = self.spawn_forwarder(job, handle, rx);

        let request = EncodeRequest {
            input,
            output: output.clone(),
            duration_secs,
        };
        let encoded = self.encoder.encode(&request, tx, cancel.clone()).await;

        // Every tick lands before a terminal status can be written
        if let Err(e) = forwarder.await {
            warn!("Progress forwarder for {} ended abnormally: {}", job.tracking_id, e);
        }
        encoded.map_err(|e| match e {
            EncodeError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Encode(other),
        })?;
        ensure_live(cancel)?;

        self.registry.set_state(handle, JobState::Uploading);
        let transcoded_file_name = self.transfer.push(&output, &job.user).await?;

        Ok(JobOutcome {
            transcoded_file_name,
            source_bytes,
        })
    }

    fn spawn_forwarder(
        &self,
        job: &TranscodeJob,
        handle: JobHandle,
        mut rx: mpsc::UnboundedReceiver<u8>,
    ) -> tokio::task::JoinHandle<()> {
        let progress = self.progress.clone();
        let registry = self.registry.clone();
        let user = job.user.clone();
        let tracking_id = job.tracking_id.clone();
        tokio::spawn(async move {
            while let Some(pct) = rx.recv().await {
                registry.set_percent(handle, pct);
                progress
                    .record_progress(&user, &tracking_id, i64::from(pct), ProgressStatus::Transcoding)
                    .await;
            }
        })
    }

    async fn update_file<F>(&self, job: &TranscodeJob, apply: F)
    where
        F: FnOnce(&mut crate::model::FileMetadataRecord) + Send,
    {
        match self
            .catalog
            .update_for(&job.user, &job.file_name, &job.tracking_id, apply)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!("Metadata for {} of {} not updated by {}", job.file_name, job.user, job.tracking_id),
            Err(e) => warn!("Failed to update metadata for {}: {}", job.file_name, e),
        }
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}
