use std::sync::{Arc, Mutex};
use log::{error, info};
use serde::Serialize;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use crate::catalog::ActivityLog;
use crate::orchestrator::{JobOutcome, Orchestrator, TranscodeJob};
use crate::registry::{JobHandle, JobRegistry};

const COMPLETION_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum CompletionOutcome {
    Completed(JobOutcome),
    Failed { reason: String },
}

/// Broadcast once per job after its terminal status is stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCompletion {
    pub tracking_id: String,
    pub user: String,
    pub file_name: String,
    pub outcome: CompletionOutcome,
}

/// Runs orchestrations detached from the submitter, at most `max_concurrent` at a time.
pub struct WorkerPool {
    orchestrator: Arc<Orchestrator>,
    registry: Arc<JobRegistry>,
    activity: Arc<ActivityLog>,
    permits: Arc<Semaphore>,
    completions: broadcast::Sender<JobCompletion>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        registry: Arc<JobRegistry>,
        activity: Arc<ActivityLog>,
        max_concurrent: usize,
    ) -> Self {
        let (completions, _) = broadcast::channel(COMPLETION_CAPACITY);
        Self {
            orchestrator,
            registry,
            activity,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            completions,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register the job and start it in the background
    pub fn spawn(&self, job: TranscodeJob) -> JobHandle {
        let (handle, cancel) = self.registry.insert(&job.tracking_id, &job.user, &job.file_name);

        let orchestrator = self.orchestrator.clone();
        let registry = self.registry.clone();
        let activity = self.activity.clone();
        let permits = self.permits.clone();
        let completions = self.completions.clone();

        let task = tokio::spawn(async move {
            let permit = tokio::select! {
                permit = permits.acquire_owned() => permit.ok(),
                _ = cancel.cancelled() => None,
            };
            let result = orchestrator.run(&job, handle, cancel).await;
            drop(permit);

            let outcome = match result {
                Ok(outcome) => {
                    info!("Worker finished {} for {}", job.tracking_id, job.user);
                    activity
                        .record(&job.user, &format!("Transcoding completed for file: {}", job.file_name))
                        .await;
                    CompletionOutcome::Completed(outcome)
                }
                Err(e) => {
                    error!("Worker failed {} for {}: {}", job.tracking_id, job.user, e);
                    activity
                        .record(&job.user, &format!("Transcoding failed for file: {}", job.file_name))
                        .await;
                    CompletionOutcome::Failed { reason: e.to_string() }
                }
            };

            registry.remove(handle);
            // No subscribers is fine
            let _ = completions.send(JobCompletion {
                tracking_id: job.tracking_id,
                user: job.user,
                file_name: job.file_name,
                outcome,
            });
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
        handle
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobCompletion> {
        self.completions.subscribe()
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Wait until every spawned job has finished, including ones spawned meanwhile
    pub async fn wait_idle(&self) {
        loop {
            let pending: Vec<_> = {
                let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
                tasks.drain(..).collect()
            };
            if pending.is_empty() {
                return;
            }
            for task in pending {
                if let Err(e) = task.await {
                    error!("Worker task panicked or was aborted: {}", e);
                }
            }
        }
    }

    /// Cancel every live job; returns how many were signalled
    pub fn cancel_all(&self) -> usize {
        let n = self.registry.cancel_all();
        if n > 0 {
            info!("🛑 Cancelling {} in-flight job(s)", n);
        }
        n
    }
}
