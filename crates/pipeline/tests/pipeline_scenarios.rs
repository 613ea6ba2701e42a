use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use pipeline::auth::StaticTokenVerifier;
use pipeline::cache::MemoryCache;
use pipeline::encoder::{EncodeError, EncodeRequest, Encoder};
use pipeline::model::{FileMetadataRecord, FileStatus, ProgressRecord, StoredItem};
use pipeline::objects::{
    LocalObjectStorage, ObjectBody, ObjectInfo, ObjectStorage, PresignMethod, PresignedUrl, Presigner, StorageError,
};
use pipeline::probe::MediaInfo;
use pipeline::registry::JobState;
use pipeline::store::{MemoryStore, MetadataStore};
use pipeline::transfer::{ObjectTransfer, TransferError};
use pipeline::worker::CompletionOutcome;
use pipeline::{App, Collaborators, Identity, PipelineConfig, PipelineError, ProgressStatus, ProgressView, Role};

/// Encoder double: emits fixed ticks, optionally one per released step
struct ScriptedEncoder {
    ticks: Vec<u8>,
    steps: Option<Arc<Semaphore>>,
    fail: bool,
    encodes: AtomicUsize,
}

impl ScriptedEncoder {
    fn new(ticks: Vec<u8>) -> Self {
        Self {
            ticks,
            steps: None,
            fail: false,
            encodes: AtomicUsize::new(0),
        }
    }

    fn gated(ticks: Vec<u8>, steps: Arc<Semaphore>) -> Self {
        Self {
            steps: Some(steps),
            ..Self::new(ticks)
        }
    }

    fn failing(ticks: Vec<u8>) -> Self {
        Self {
            fail: true,
            ..Self::new(ticks)
        }
    }

    async fn step(&self, cancel: &CancellationToken) -> Result<(), EncodeError> {
        let Some(steps) = &self.steps else {
            return Ok(());
        };
        tokio::select! {
            permit = steps.acquire() => {
                permit.map_err(|_| EncodeError::Cancelled)?.forget();
                Ok(())
            }
            _ = cancel.cancelled() => Err(EncodeError::Cancelled),
        }
    }
}

#[async_trait]
impl Encoder for ScriptedEncoder {
    async fn probe(&self, input: &Path) -> Result<MediaInfo, EncodeError> {
        if !input.exists() {
            return Err(EncodeError::InputMissing(input.to_path_buf()));
        }
        Ok(MediaInfo {
            format_name: "mov,mp4,m4a,3gp,3g2,mj2".to_string(),
            duration_secs: Some(10.0),
            resolution: Some("1920x1080".to_string()),
        })
    }

    async fn encode(
        &self,
        req: &EncodeRequest,
        progress: mpsc::UnboundedSender<u8>,
        cancel: CancellationToken,
    ) -> Result<(), EncodeError> {
        self.encodes.fetch_add(1, Ordering::SeqCst);
        let source = tokio::fs::read(&req.input).await?;
        for tick in &self.ticks {
            self.step(&cancel).await?;
            let _ = progress.send(*tick);
        }
        self.step(&cancel).await?;
        if self.fail {
            return Err(EncodeError::Failed {
                code: 1,
                stderr_tail: "scripted failure".to_string(),
            });
        }
        let mut out = b"hevc:".to_vec();
        out.extend_from_slice(&source);
        tokio::fs::write(&req.output, out).await?;
        Ok(())
    }
}

/// Local storage that refuses to store transcoded outputs
struct RejectingOutputs {
    inner: Arc<LocalObjectStorage>,
}

#[async_trait]
impl ObjectStorage for RejectingOutputs {
    async fn put(&self, key: &str, body: ObjectBody) -> Result<u64, StorageError> {
        if key.ends_with("_transcoded.mp4") {
            return Err(StorageError::Io {
                key: key.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "bucket unavailable"),
            });
        }
        self.inner.put(key, body).await
    }

    async fn get(&self, key: &str) -> Result<ObjectBody, StorageError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        self.inner.list(prefix).await
    }

    fn presign(&self, key: &str, method: PresignMethod, ttl: Duration) -> Result<PresignedUrl, StorageError> {
        self.inner.presign(key, method, ttl)
    }
}

struct Harness {
    app: App,
    store: Arc<MemoryStore>,
    storage: Arc<LocalObjectStorage>,
    scratch: tempfile::TempDir,
    _objects: tempfile::TempDir,
}

impl Harness {
    fn scratch_is_empty(&self) -> bool {
        std::fs::read_dir(self.scratch.path()).unwrap().next().is_none()
    }
}

fn harness_with(encoder: Arc<dyn Encoder>, max_concurrent_jobs: usize) -> Harness {
    harness_over(encoder, max_concurrent_jobs, |local| local as Arc<dyn ObjectStorage>)
}

fn harness_over<W>(encoder: Arc<dyn Encoder>, max_concurrent_jobs: usize, wrap: W) -> Harness
where
    W: FnOnce(Arc<LocalObjectStorage>) -> Arc<dyn ObjectStorage>,
{
    let objects = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();

    let cfg = PipelineConfig {
        scratch_dir: scratch.path().to_path_buf(),
        object_root: objects.path().to_path_buf(),
        max_concurrent_jobs,
        ..PipelineConfig::default()
    };

    let store = Arc::new(MemoryStore::new());
    let presigner = Presigner::new(&cfg.presign_secret, &cfg.object_base_url).unwrap();
    let storage = Arc::new(LocalObjectStorage::new(objects.path(), presigner));
    let verifier = StaticTokenVerifier::new(
        HashMap::from([
            ("tok-alice".to_string(), "alice".to_string()),
            ("tok-root".to_string(), "root".to_string()),
        ]),
        vec!["root".to_string()],
    );

    let app = App::with_parts(
        cfg,
        Collaborators {
            store: store.clone(),
            cache: Arc::new(MemoryCache::new()),
            storage: wrap(storage.clone()),
            encoder,
            verifier: Arc::new(verifier),
        },
    );

    Harness {
        app,
        store,
        storage,
        scratch,
        _objects: objects,
    }
}

fn harness(encoder: Arc<dyn Encoder>) -> Harness {
    harness_with(encoder, 2)
}

fn alice() -> Identity {
    Identity::new("alice", Role::User)
}

fn root() -> Identity {
    Identity::new("root", Role::Admin)
}

async fn seed_source(h: &Harness, key: &str, bytes: &[u8]) {
    h.storage
        .put(key, ObjectBody::from_bytes(bytes.to_vec()))
        .await
        .unwrap();
}

async fn wait_for_progress<F>(h: &Harness, who: &Identity, tracking_id: &str, pred: F) -> ProgressView
where
    F: Fn(&ProgressView) -> bool,
{
    let service = h.app.service();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(view) = service.query_progress(who, tracking_id).await {
                if pred(&view) {
                    return view;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("progress never reached the expected state")
}

#[tokio::test]
async fn test_submit_returns_started_before_encoding_runs() {
    let steps = Arc::new(Semaphore::new(0));
    let h = harness(Arc::new(ScriptedEncoder::gated(vec![10, 45, 90], steps.clone())));
    seed_source(&h, "alice/clip.mp4", b"source-bytes").await;

    let receipt = tokio::time::timeout(Duration::from_secs(2), h.app.service().submit_upload(&alice(), "clip.mp4"))
        .await
        .expect("submit blocked on the encode")
        .unwrap();

    assert_eq!(receipt.file_name, "clip.mp4");
    let (user, ms) = receipt.tracking_id.rsplit_once('_').unwrap();
    assert_eq!(user, "alice");
    assert!(ms.parse::<i64>().unwrap() <= Utc::now().timestamp_millis());

    let view = h.app.service().query_progress(&alice(), &receipt.tracking_id).await.unwrap();
    assert_eq!(view, ProgressView { percent: 0, status: ProgressStatus::Started });

    h.app.shutdown().await;
    let view = h.app.service().query_progress(&alice(), &receipt.tracking_id).await.unwrap();
    assert_eq!(view, ProgressView { percent: 0, status: ProgressStatus::Error });
}

#[tokio::test]
async fn test_ticks_are_visible_while_polling() {
    let steps = Arc::new(Semaphore::new(0));
    let h = harness(Arc::new(ScriptedEncoder::gated(vec![10, 45, 90], steps.clone())));
    seed_source(&h, "alice/clip.mp4", b"source-bytes").await;

    let receipt = h.app.service().submit_upload(&alice(), "clip.mp4").await.unwrap();
    let id = receipt.tracking_id.as_str();

    for expected in [10u8, 45, 90] {
        steps.add_permits(1);
        let view = wait_for_progress(&h, &alice(), id, |v| v.percent == expected).await;
        assert_eq!(view.status, ProgressStatus::Transcoding);
        // Stable without further writes
        assert_eq!(h.app.service().query_progress(&alice(), id).await.unwrap(), view);
    }

    steps.add_permits(1);
    let done = wait_for_progress(&h, &alice(), id, |v| v.status.is_terminal()).await;
    assert_eq!(done, ProgressView { percent: 100, status: ProgressStatus::Completed });
    h.app.service().pool().wait_idle().await;
    assert!(h.scratch_is_empty());

    let mut body = h.storage.get("alice/clip_transcoded.mp4").await.unwrap();
    let mut out = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut body.reader, &mut out).await.unwrap();
    assert_eq!(out, b"hevc:source-bytes");

    let files = h.app.service().list_user_files(&alice()).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].file.status, FileStatus::Completed);
    assert_eq!(files[0].file.transcoded_file_name.as_deref(), Some("clip_transcoded.mp4"));
    assert_eq!(files[0].file.size, Some(12));
    assert_eq!(files[0].file.resolution.as_deref(), Some("1920x1080"));
    assert_eq!(files[0].progress, Some(done));

    let history = h.app.service().user_activity(&alice()).await.unwrap();
    let entries: Vec<_> = history.iter().map(|a| a.activity.as_str()).collect();
    assert_eq!(
        entries,
        vec![
            "Started processing file: clip.mp4",
            "Transcoding completed for file: clip.mp4",
        ]
    );
}

#[tokio::test]
async fn test_missing_source_ends_in_error_and_pushes_nothing() {
    let encoder = Arc::new(ScriptedEncoder::new(vec![50]));
    let h = harness(encoder.clone());

    let receipt = h.app.service().submit_upload(&alice(), "missing.mp4").await.unwrap();
    let view = wait_for_progress(&h, &alice(), &receipt.tracking_id, |v| v.status.is_terminal()).await;
    assert_eq!(view, ProgressView { percent: 0, status: ProgressStatus::Error });
    h.app.service().pool().wait_idle().await;

    assert!(h.storage.list("alice/").await.unwrap().is_empty());
    assert_eq!(encoder.encodes.load(Ordering::SeqCst), 0);
    assert!(h.scratch_is_empty());

    let files = h.app.service().list_user_files(&alice()).await.unwrap();
    assert_eq!(files[0].file.status, FileStatus::Error);
    let history = h.app.service().user_activity(&alice()).await.unwrap();
    assert_eq!(
        history.last().map(|a| a.activity.as_str()),
        Some("Transcoding failed for file: missing.mp4")
    );
}

#[tokio::test]
async fn test_admin_delete_removes_object_and_listing() {
    let h = harness(Arc::new(ScriptedEncoder::new(vec![50])));
    seed_source(&h, "alice/clip.mp4", b"source-bytes").await;

    let receipt = h.app.service().submit_upload(&alice(), "clip.mp4").await.unwrap();
    wait_for_progress(&h, &alice(), &receipt.tracking_id, |v| v.status.is_terminal()).await;
    h.app.service().pool().wait_idle().await;

    let denied = h.app.service().delete_file(&alice(), "alice", "clip.mp4").await;
    assert!(matches!(denied, Err(PipelineError::Auth(_))));

    h.app.service().delete_file(&root(), "alice", "clip.mp4").await.unwrap();

    let files = h.app.service().list_user_files(&alice()).await.unwrap();
    assert!(files.iter().all(|f| f.file.file_name != "clip.mp4"));

    let dest = tempfile::tempdir().unwrap();
    let transfer = ObjectTransfer::new(h.storage.clone());
    let err = transfer
        .fetch("alice", "clip.mp4", &dest.path().join("clip.mp4"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::NotFound { .. }));
}

#[tokio::test]
async fn test_invalid_file_name_creates_no_records() {
    let h = harness(Arc::new(ScriptedEncoder::new(vec![])));

    for bad in ["", "../etc/passwd", "nested/clip.mp4"] {
        let err = h.app.service().submit_upload(&alice(), bad).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)), "{:?}", bad);
    }

    assert!(h.store.query("alice").await.unwrap().is_empty());
    assert!(h.app.service().in_flight_jobs(&root()).unwrap().is_empty());
}

#[tokio::test]
async fn test_no_late_tick_overwrites_terminal_status() {
    let ticks: Vec<u8> = (1..100).collect();
    let h = harness(Arc::new(ScriptedEncoder::new(ticks)));
    seed_source(&h, "alice/clip.mp4", b"source-bytes").await;
    let mut completions = h.app.service().pool().subscribe();

    let receipt = h.app.service().submit_upload(&alice(), "clip.mp4").await.unwrap();
    let completion = tokio::time::timeout(Duration::from_secs(10), completions.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completion.tracking_id, receipt.tracking_id);
    assert!(matches!(completion.outcome, CompletionOutcome::Completed(_)));

    h.app.service().pool().wait_idle().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let view = h.app.service().query_progress(&alice(), &receipt.tracking_id).await.unwrap();
    assert_eq!(view, ProgressView { percent: 100, status: ProgressStatus::Completed });
    assert!(completions.try_recv().is_err());
}

#[tokio::test]
async fn test_encoder_failure_is_the_only_terminal_status() {
    let h = harness(Arc::new(ScriptedEncoder::failing(vec![20, 60])));
    seed_source(&h, "alice/clip.mp4", b"source-bytes").await;
    let mut completions = h.app.service().pool().subscribe();

    let receipt = h.app.service().submit_upload(&alice(), "clip.mp4").await.unwrap();
    let completion = tokio::time::timeout(Duration::from_secs(10), completions.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(completion.outcome, CompletionOutcome::Failed { .. }));
    h.app.service().pool().wait_idle().await;

    let view = h.app.service().query_progress(&alice(), &receipt.tracking_id).await.unwrap();
    assert_eq!(view, ProgressView { percent: 0, status: ProgressStatus::Error });
    assert!(h.storage.list("alice/clip_transcoded").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_upload_failure_ends_in_error_and_cleans_scratch() {
    let h = harness_over(Arc::new(ScriptedEncoder::new(vec![30, 80])), 2, |local| {
        Arc::new(RejectingOutputs { inner: local }) as Arc<dyn ObjectStorage>
    });
    seed_source(&h, "alice/clip.mp4", b"source-bytes").await;
    let mut completions = h.app.service().pool().subscribe();

    let receipt = h.app.service().submit_upload(&alice(), "clip.mp4").await.unwrap();
    let completion = tokio::time::timeout(Duration::from_secs(10), completions.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completion.tracking_id, receipt.tracking_id);
    assert!(matches!(completion.outcome, CompletionOutcome::Failed { .. }));
    h.app.service().pool().wait_idle().await;

    let view = h.app.service().query_progress(&alice(), &receipt.tracking_id).await.unwrap();
    assert_eq!(view, ProgressView { percent: 0, status: ProgressStatus::Error });
    assert!(completions.try_recv().is_err());

    let files = h.app.service().list_user_files(&alice()).await.unwrap();
    assert_eq!(files[0].file.status, FileStatus::Error);
    assert_eq!(files[0].file.transcoded_file_name, None);
    assert!(h.storage.list("alice/clip_transcoded").await.unwrap().is_empty());
    assert!(h.scratch_is_empty());
}

#[tokio::test]
async fn test_resubmitted_name_tracks_the_latest_job_only() {
    let steps = Arc::new(Semaphore::new(0));
    let h = harness(Arc::new(ScriptedEncoder::gated(vec![50], steps.clone())));
    seed_source(&h, "alice/clip.mp4", b"source-bytes").await;

    let first = h.app.service().submit_upload(&alice(), "clip.mp4").await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let jobs = h.app.service().in_flight_jobs(&root()).unwrap();
            if jobs.iter().any(|j| j.tracking_id == first.tracking_id && j.state == JobState::Encoding) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let second = h.app.service().submit_upload(&alice(), "clip.mp4").await.unwrap();
    assert_ne!(first.tracking_id, second.tracking_id);

    h.app.service().cancel_job(&root(), &second.tracking_id).unwrap();
    let failed = wait_for_progress(&h, &alice(), &second.tracking_id, |v| v.status.is_terminal()).await;
    assert_eq!(failed.status, ProgressStatus::Error);

    steps.add_permits(2);
    let done = wait_for_progress(&h, &alice(), &first.tracking_id, |v| v.status.is_terminal()).await;
    assert_eq!(done.status, ProgressStatus::Completed);
    h.app.service().pool().wait_idle().await;

    let files = h.app.service().list_user_files(&alice()).await.unwrap();
    assert_eq!(files.len(), 1);
    let listed = &files[0];
    assert_eq!(listed.file.progress_id, second.tracking_id);
    assert_eq!(listed.file.status, FileStatus::Error);
    assert_eq!(listed.file.transcoded_file_name, None);
    assert_eq!(listed.progress, Some(ProgressView { percent: 0, status: ProgressStatus::Error }));
    assert!(h.scratch_is_empty());
}

#[tokio::test]
async fn test_admin_can_cancel_an_in_flight_job() {
    let steps = Arc::new(Semaphore::new(0));
    let h = harness(Arc::new(ScriptedEncoder::gated(vec![10], steps.clone())));
    seed_source(&h, "alice/clip.mp4", b"source-bytes").await;

    let receipt = h.app.service().submit_upload(&alice(), "clip.mp4").await.unwrap();
    let jobs = h.app.service().in_flight_jobs(&root()).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].tracking_id, receipt.tracking_id);
    assert!(h.app.service().in_flight_jobs(&alice()).is_err());

    h.app.service().cancel_job(&root(), &receipt.tracking_id).unwrap();
    let view = wait_for_progress(&h, &alice(), &receipt.tracking_id, |v| v.status.is_terminal()).await;
    assert_eq!(view.status, ProgressStatus::Error);
    h.app.service().pool().wait_idle().await;

    assert!(h.app.service().in_flight_jobs(&root()).unwrap().is_empty());
    assert!(matches!(
        h.app.service().cancel_job(&root(), &receipt.tracking_id),
        Err(PipelineError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_worker_limit_holds_extra_jobs_pending() {
    let steps = Arc::new(Semaphore::new(0));
    let h = harness_with(Arc::new(ScriptedEncoder::gated(vec![50], steps.clone())), 1);
    seed_source(&h, "alice/a.mp4", b"aaaa").await;
    seed_source(&h, "alice/b.mp4", b"bbbb").await;

    let first = h.app.service().submit_upload(&alice(), "a.mp4").await.unwrap();
    let second = h.app.service().submit_upload(&alice(), "b.mp4").await.unwrap();
    assert_ne!(first.tracking_id, second.tracking_id);

    let state_of = |id: &str| {
        h.app
            .service()
            .in_flight_jobs(&root())
            .unwrap()
            .into_iter()
            .find(|j| j.tracking_id == id)
            .map(|j| j.state)
    };

    tokio::time::timeout(Duration::from_secs(10), async {
        while state_of(first.tracking_id.as_str()) != Some(JobState::Encoding) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(state_of(second.tracking_id.as_str()), Some(JobState::Pending));

    steps.add_permits(4);
    h.app.service().pool().wait_idle().await;
    for id in [&first.tracking_id, &second.tracking_id] {
        let view = h.app.service().query_progress(&alice(), id).await.unwrap();
        assert_eq!(view.status, ProgressStatus::Completed);
    }
}

#[tokio::test]
async fn test_recover_marks_abandoned_jobs_failed() {
    let h = harness(Arc::new(ScriptedEncoder::new(vec![])));
    h.store
        .put(StoredItem::Progress(ProgressRecord::new(
            "alice",
            "alice_1",
            40,
            ProgressStatus::Transcoding,
        )))
        .await
        .unwrap();
    let mut file = FileMetadataRecord::uploaded("alice", "old.mp4", "alice_1");
    file.status = FileStatus::Transcoding;
    h.store.put(StoredItem::File(file)).await.unwrap();

    assert!(h.app.service().recover_interrupted(&alice()).await.is_err());
    let recovered = h.app.service().recover_interrupted(&root()).await.unwrap();
    assert_eq!(recovered, vec!["alice_1".to_string()]);

    let view = h.app.service().query_progress(&alice(), "alice_1").await.unwrap();
    assert_eq!(view, ProgressView { percent: 0, status: ProgressStatus::Error });
    let files = h.app.service().list_user_files(&alice()).await.unwrap();
    assert_eq!(files[0].file.status, FileStatus::Error);

    assert!(h.app.service().recover_interrupted(&root()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_presigned_urls_are_scoped_to_the_caller() {
    let h = harness(Arc::new(ScriptedEncoder::new(vec![])));

    let put = h.app.service().upload_url(&alice(), "clip.mp4").unwrap();
    let (method, key) = h.storage.presigner().verify(&put.url, Utc::now()).unwrap();
    assert_eq!(method, PresignMethod::Put);
    assert_eq!(key, "alice/clip.mp4");

    let get = h.app.service().download_url(&alice(), "clip.mp4").unwrap();
    assert_eq!(get.method, PresignMethod::Get);
    assert!(get.expires_at > Utc::now() + chrono::Duration::minutes(59));

    assert!(h.app.service().download_url(&alice(), "../bob/clip.mp4").is_err());
}

#[tokio::test]
async fn test_tokens_resolve_through_the_app() {
    let h = harness(Arc::new(ScriptedEncoder::new(vec![])));
    assert_eq!(h.app.identify("tok-alice").await.unwrap(), alice());
    assert!(h.app.identify_header("Bearer tok-root").await.unwrap().is_admin());
    assert!(h.app.identify("nope").await.is_err());
}
