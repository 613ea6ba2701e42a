use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use log::{info, warn};
use crate::auth::Identity;
use crate::catalog::{ActivityLog, FileCatalog};
use crate::error::{PipelineError, Result};
use crate::model::{
    ActivityRecord, FileMetadataRecord, FileStatus, FileWithProgress, ProgressStatus, ProgressView, SubmitReceipt,
};
use crate::objects::{ObjectStorage, PresignMethod, PresignedUrl};
use crate::orchestrator::TranscodeJob;
use crate::progress::ProgressStore;
use crate::registry::JobSnapshot;
use crate::transfer::object_key;
use crate::worker::WorkerPool;

/// Issues `<user>_<epochMillis>` ids that never repeat within the process
#[derive(Debug, Default)]
pub struct TrackingIds {
    last_ms: AtomicI64,
}

impl TrackingIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, user: &str) -> String {
        let now = Utc::now().timestamp_millis();
        let mut prev = self.last_ms.load(Ordering::Relaxed);
        let ms = loop {
            let candidate = now.max(prev + 1);
            match self
                .last_ms
                .compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break candidate,
                Err(actual) => prev = actual,
            }
        };
        format!("{}_{}", user, ms)
    }
}

/// A file name must be a single plain path component
pub fn validate_file_name(file_name: &str) -> Result<()> {
    let trimmed = file_name.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::Validation("fileName is required".to_string()));
    }
    if trimmed != file_name || file_name == "." || file_name == ".." || file_name.contains(['/', '\\']) {
        return Err(PipelineError::Validation(format!("fileName must be a plain file name: {:?}", file_name)));
    }
    Ok(())
}

/// The operations callers invoke, each taking an already verified identity.
pub struct TranscodeService {
    catalog: Arc<FileCatalog>,
    progress: Arc<ProgressStore>,
    activity: Arc<ActivityLog>,
    storage: Arc<dyn ObjectStorage>,
    pool: Arc<WorkerPool>,
    presign_ttl: Duration,
    tracking: TrackingIds,
}

impl TranscodeService {
    pub fn new(
        catalog: Arc<FileCatalog>,
        progress: Arc<ProgressStore>,
        activity: Arc<ActivityLog>,
        storage: Arc<dyn ObjectStorage>,
        pool: Arc<WorkerPool>,
        presign_ttl: Duration,
    ) -> Self {
        Self {
            catalog,
            progress,
            activity,
            storage,
            pool,
            presign_ttl,
            tracking: TrackingIds::new(),
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Accept an uploaded file for transcoding and return before any work runs
    pub async fn submit_upload(&self, identity: &Identity, file_name: &str) -> Result<SubmitReceipt> {
        validate_file_name(file_name)?;
        let user = identity.username.as_str();
        let tracking_id = self.tracking.next(user);

        self.activity
            .record(user, &format!("Started processing file: {}", file_name))
            .await;
        self.catalog
            .save(FileMetadataRecord::uploaded(user, file_name, &tracking_id))
            .await?;
        self.progress.initialize(user, &tracking_id).await?;

        self.pool.spawn(TranscodeJob {
            tracking_id: tracking_id.clone(),
            user: user.to_string(),
            file_name: file_name.to_string(),
        });
        info!("📥 Accepted {} from {} as {}", file_name, user, tracking_id);

        Ok(SubmitReceipt {
            file_name: file_name.to_string(),
            tracking_id,
        })
    }

    pub async fn query_progress(&self, identity: &Identity, tracking_id: &str) -> Result<ProgressView> {
        self.progress
            .read_progress(&identity.username, tracking_id)
            .await?
            .map(|record| record.view())
            .ok_or_else(|| PipelineError::NotFound(format!("no progress recorded for {}", tracking_id)))
    }

    /// The caller's files, each with its current progress when known
    pub async fn list_user_files(&self, identity: &Identity) -> Result<Vec<FileWithProgress>> {
        let user = identity.username.as_str();
        let files = self.catalog.list(user).await?;
        let mut listed = Vec::with_capacity(files.len());
        for file in files {
            let progress = match self.progress.read_progress(user, &file.progress_id).await {
                Ok(record) => record.map(|r| r.view()),
                Err(e) => {
                    warn!("Progress unavailable for {}: {}", file.progress_id, e);
                    None
                }
            };
            listed.push(FileWithProgress { file, progress });
        }
        Ok(listed)
    }

    pub async fn user_activity(&self, identity: &Identity) -> Result<Vec<ActivityRecord>> {
        Ok(self.activity.history(&identity.username).await?)
    }

    /// Remove a user's object, then its metadata. Not transactional.
    pub async fn delete_file(&self, admin: &Identity, user: &str, file_name: &str) -> Result<()> {
        admin.require_admin()?;
        validate_file_name(file_name)?;
        let key = object_key(user, file_name)?;

        self.storage.delete(&key).await?;
        match self.catalog.delete(user, file_name).await {
            Ok(existed) => {
                info!("🗑️ {} deleted {} (metadata existed: {})", admin.username, key, existed);
                Ok(())
            }
            Err(e) => {
                warn!("Object {} deleted but its metadata could not be removed; orphaned record: {}", key, e);
                Err(e.into())
            }
        }
    }

    pub async fn list_all_files(&self, admin: &Identity) -> Result<Vec<FileMetadataRecord>> {
        admin.require_admin()?;
        Ok(self.catalog.all_files().await?)
    }

    pub fn upload_url(&self, identity: &Identity, file_name: &str) -> Result<PresignedUrl> {
        self.presign(identity, file_name, PresignMethod::Put)
    }

    pub fn download_url(&self, identity: &Identity, file_name: &str) -> Result<PresignedUrl> {
        self.presign(identity, file_name, PresignMethod::Get)
    }

    fn presign(&self, identity: &Identity, file_name: &str, method: PresignMethod) -> Result<PresignedUrl> {
        validate_file_name(file_name)?;
        let key = object_key(&identity.username, file_name)?;
        Ok(self.storage.presign(&key, method, self.presign_ttl)?)
    }

    /// Mark jobs a previous process left unfinished as failed. Jobs live in
    /// this process are left alone. Returns the tracking ids that were closed.
    pub async fn recover_interrupted(&self, admin: &Identity) -> Result<Vec<String>> {
        admin.require_admin()?;
        let registry = self.pool.registry();
        let stale: Vec<_> = self
            .progress
            .unfinished()
            .await?
            .into_iter()
            .filter(|p| registry.find(&p.tracking_id).is_none())
            .collect();
        if stale.is_empty() {
            info!("✅ No interrupted jobs found");
            return Ok(Vec::new());
        }

        let files = self.catalog.all_files().await?;
        let mut recovered = Vec::with_capacity(stale.len());
        for record in stale {
            warn!("⚠️ Marking interrupted job {} of {} as failed", record.tracking_id, record.username);
            self.progress
                .record_progress(&record.username, &record.tracking_id, 0, ProgressStatus::Error)
                .await;

            let file = files
                .iter()
                .find(|f| f.username == record.username && f.progress_id == record.tracking_id);
            if let Some(file) = file {
                self.catalog
                    .update_for(&record.username, &file.file_name, &record.tracking_id, |f| {
                        f.status = FileStatus::Error
                    })
                    .await?;
                self.activity
                    .record(&record.username, &format!("Transcoding failed for file: {}", file.file_name))
                    .await;
            }
            recovered.push(record.tracking_id);
        }
        Ok(recovered)
    }

    pub fn in_flight_jobs(&self, admin: &Identity) -> Result<Vec<JobSnapshot>> {
        admin.require_admin()?;
        Ok(self.pool.registry().list())
    }

    pub fn cancel_job(&self, admin: &Identity, tracking_id: &str) -> Result<()> {
        admin.require_admin()?;
        if self.pool.registry().cancel(tracking_id) {
            info!("🛑 {} cancelled {}", admin.username, tracking_id);
            Ok(())
        } else {
            Err(PipelineError::NotFound(format!("no in-flight job {}", tracking_id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_file_name_validation() {
        assert!(validate_file_name("clip.mp4").is_ok());
        assert!(validate_file_name("my clip (1).mov").is_ok());
        for bad in ["", "   ", "a/b.mp4", "..", ".", "..\\x", " clip.mp4"] {
            assert!(matches!(validate_file_name(bad), Err(PipelineError::Validation(_))), "{:?}", bad);
        }
    }

    #[test]
    fn test_tracking_ids_differ_within_one_millisecond() {
        let ids = TrackingIds::new();
        let a = ids.next("alice");
        let b = ids.next("alice");
        assert_ne!(a, b);
        assert!(a.starts_with("alice_"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn test_tracking_ids_strictly_increase(user in "[a-z]{1,12}", n in 1usize..200) {
            let ids = TrackingIds::new();
            let mut last = 0i64;
            for _ in 0..n {
                let id = ids.next(&user);
                let (prefix, ms) = id.rsplit_once('_').unwrap();
                prop_assert_eq!(prefix, user.as_str());
                let ms: i64 = ms.parse().unwrap();
                prop_assert!(ms > last);
                last = ms;
            }
        }
    }
}
