use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sort-key prefixes of the single logical metadata table
pub const PROGRESS_PREFIX: &str = "PROGRESS#";
pub const FILE_PREFIX: &str = "FILE#";
pub const ACTIVITY_PREFIX: &str = "ACTIVITY#";

/// Status of a transcode as seen by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Started,
    Transcoding,
    Completed,
    Error,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressStatus::Completed | ProgressStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Started => "started",
            ProgressStatus::Transcoding => "transcoding",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Error => "error",
        }
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable progress of one submission, keyed by user + tracking id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub username: String,
    pub tracking_id: String,
    pub percent: u8,
    pub status: ProgressStatus,
    pub last_updated: DateTime<Utc>,
}

impl ProgressRecord {
    /// Build a record, normalising percent for the status.
    ///
    /// `completed` always carries 100 and `error` always carries 0; anything
    /// else is clamped into 0..=100.
    pub fn new(username: &str, tracking_id: &str, percent: i64, status: ProgressStatus) -> Self {
        let percent = match status {
            ProgressStatus::Completed => 100,
            ProgressStatus::Error => 0,
            _ => percent.clamp(0, 100) as u8,
        };
        Self {
            username: username.to_string(),
            tracking_id: tracking_id.to_string(),
            percent,
            status,
            last_updated: Utc::now(),
        }
    }

    pub fn sort_key(&self) -> String {
        progress_sort_key(&self.tracking_id)
    }

    pub fn view(&self) -> ProgressView {
        ProgressView {
            percent: self.percent,
            status: self.status,
        }
    }
}

/// The `{percent, status}` pair returned to progress pollers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressView {
    pub percent: u8,
    pub status: ProgressStatus,
}

/// Lifecycle of an uploaded file's metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Uploaded,
    Transcoding,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadataRecord {
    pub username: String,
    pub file_name: String,
    pub size: Option<u64>,
    pub format: Option<String>,
    pub resolution: Option<String>,
    pub upload_time: DateTime<Utc>,
    pub status: FileStatus,
    pub progress_id: String,
    #[serde(default)]
    pub transcoded_file_name: Option<String>,
}

impl FileMetadataRecord {
    /// Metadata for a freshly submitted file
    pub fn uploaded(username: &str, file_name: &str, progress_id: &str) -> Self {
        Self {
            username: username.to_string(),
            file_name: file_name.to_string(),
            size: None,
            format: None,
            resolution: None,
            upload_time: Utc::now(),
            status: FileStatus::Uploaded,
            progress_id: progress_id.to_string(),
            transcoded_file_name: None,
        }
    }

    pub fn sort_key(&self) -> String {
        file_sort_key(&self.file_name)
    }
}

/// Audit trail entry for a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub username: String,
    pub activity_id: String,
    pub activity: String,
    pub timestamp: DateTime<Utc>,
}

impl ActivityRecord {
    pub fn new(username: &str, activity: &str) -> Self {
        let timestamp = Utc::now();
        let activity_id = format!(
            "{}{}#{}",
            ACTIVITY_PREFIX,
            timestamp.timestamp_millis(),
            uuid::Uuid::new_v4().simple()
        );
        Self {
            username: username.to_string(),
            activity_id,
            activity: activity.to_string(),
            timestamp,
        }
    }
}

/// One row of the metadata table. The `kind` tag is the record discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoredItem {
    Progress(ProgressRecord),
    File(FileMetadataRecord),
    Activity(ActivityRecord),
}

impl StoredItem {
    pub fn user(&self) -> &str {
        match self {
            StoredItem::Progress(p) => &p.username,
            StoredItem::File(f) => &f.username,
            StoredItem::Activity(a) => &a.username,
        }
    }

    pub fn sort_key(&self) -> String {
        match self {
            StoredItem::Progress(p) => p.sort_key(),
            StoredItem::File(f) => f.sort_key(),
            StoredItem::Activity(a) => a.activity_id.clone(),
        }
    }
}

/// A file listing entry with its progress attached
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileWithProgress {
    #[serde(flatten)]
    pub file: FileMetadataRecord,
    pub progress: Option<ProgressView>,
}

/// What `submitUpload` hands back: accepted for processing, not done
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub file_name: String,
    pub tracking_id: String,
}

pub fn progress_sort_key(tracking_id: &str) -> String {
    format!("{}{}", PROGRESS_PREFIX, tracking_id)
}

pub fn file_sort_key(file_name: &str) -> String {
    format!("{}{}", FILE_PREFIX, file_name)
}

pub fn progress_cache_key(username: &str, tracking_id: &str) -> String {
    format!("progress:{}:{}", username, tracking_id)
}

pub fn files_cache_key(username: &str) -> String {
    format!("{}_files", username)
}
