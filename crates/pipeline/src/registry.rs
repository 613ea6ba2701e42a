//! In-flight job table.
//!
//! Slots live in a `Vec` and are recycled through a free list. A handle carries
//! the slot generation it was issued for, so a handle kept past `remove` reads
//! as absent instead of aliasing whatever job reused the slot.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Downloading,
    Encoding,
    Uploading,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle {
    index: usize,
    generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub tracking_id: String,
    pub user: String,
    pub file_name: String,
    pub state: JobState,
    pub percent: u8,
    pub started_at: DateTime<Utc>,
}

struct Entry {
    snapshot: JobSnapshot,
    cancel: CancellationToken,
}

struct Slot {
    generation: u64,
    entry: Option<Entry>,
}

#[derive(Default)]
struct Inner {
    slots: Vec<Slot>,
    free: Vec<usize>,
    by_tracking: HashMap<String, JobHandle>,
}

impl Inner {
    fn entry(&self, handle: JobHandle) -> Option<&Entry> {
        self.slots
            .get(handle.index)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.entry.as_ref())
    }

    fn entry_mut(&mut self, handle: JobHandle) -> Option<&mut Entry> {
        self.slots
            .get_mut(handle.index)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.entry.as_mut())
    }
}

#[derive(Default)]
pub struct JobRegistry {
    inner: RwLock<Inner>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a pending job and hand back its handle and cancellation token
    pub fn insert(&self, tracking_id: &str, user: &str, file_name: &str) -> (JobHandle, CancellationToken) {
        let cancel = CancellationToken::new();
        let entry = Entry {
            snapshot: JobSnapshot {
                tracking_id: tracking_id.to_string(),
                user: user.to_string(),
                file_name: file_name.to_string(),
                state: JobState::Pending,
                percent: 0,
                started_at: Utc::now(),
            },
            cancel: cancel.clone(),
        };

        let mut inner = self.write();
        let handle = match inner.free.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index];
                slot.entry = Some(entry);
                JobHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                inner.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                JobHandle {
                    index: inner.slots.len() - 1,
                    generation: 0,
                }
            }
        };
        inner.by_tracking.insert(tracking_id.to_string(), handle);
        (handle, cancel)
    }

    pub fn set_state(&self, handle: JobHandle, state: JobState) -> bool {
        match self.write().entry_mut(handle) {
            Some(entry) => {
                entry.snapshot.state = state;
                true
            }
            None => false,
        }
    }

    pub fn set_percent(&self, handle: JobHandle, percent: u8) -> bool {
        match self.write().entry_mut(handle) {
            Some(entry) => {
                entry.snapshot.percent = percent.min(100);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self, handle: JobHandle) -> Option<JobSnapshot> {
        self.read().entry(handle).map(|e| e.snapshot.clone())
    }

    pub fn find(&self, tracking_id: &str) -> Option<JobHandle> {
        self.read().by_tracking.get(tracking_id).copied()
    }

    /// Every live job, oldest first
    pub fn list(&self) -> Vec<JobSnapshot> {
        let inner = self.read();
        let mut jobs: Vec<_> = inner
            .slots
            .iter()
            .filter_map(|s| s.entry.as_ref().map(|e| e.snapshot.clone()))
            .collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        jobs
    }

    /// Fire the job's cancellation token. False when no such job is live.
    pub fn cancel(&self, tracking_id: &str) -> bool {
        let inner = self.read();
        let Some(handle) = inner.by_tracking.get(tracking_id).copied() else {
            return false;
        };
        match inner.entry(handle) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let inner = self.read();
        let mut cancelled = 0;
        for entry in inner.slots.iter().filter_map(|s| s.entry.as_ref()) {
            entry.cancel.cancel();
            cancelled += 1;
        }
        cancelled
    }

    /// Drop a finished job. Its handle and slot generation are retired.
    pub fn remove(&self, handle: JobHandle) -> Option<JobSnapshot> {
        let mut inner = self.write();
        let slot = inner
            .slots
            .get_mut(handle.index)
            .filter(|s| s.generation == handle.generation)?;
        let entry = slot.entry.take()?;
        slot.generation += 1;
        inner.free.push(handle.index);
        if inner.by_tracking.get(&entry.snapshot.tracking_id) == Some(&handle) {
            inner.by_tracking.remove(&entry.snapshot.tracking_id);
        }
        Some(entry.snapshot)
    }

    pub fn len(&self) -> usize {
        self.read().by_tracking.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
