use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Seven days, the longest-lived presigned link issued
pub const MAX_PRESIGN_TTL_SECS: u64 = 7 * 24 * 3600;

/// Fixed output profile handed to the encoder for every job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeProfile {
    pub video_codec: String,
    /// Target frame size, `WIDTHxHEIGHT`
    pub resolution: String,
    pub video_bitrate: String,
    pub audio_bitrate: String,
    pub preset: String,
    pub crf: u8,
    /// 0 lets the encoder use every available core
    pub threads: u32,
}

impl Default for EncodeProfile {
    fn default() -> Self {
        Self {
            video_codec: "libx265".to_string(),
            resolution: "3840x2160".to_string(),
            video_bitrate: "8000k".to_string(),
            audio_bitrate: "320k".to_string(),
            preset: "slow".to_string(),
            crf: 18,
            threads: 0,
        }
    }
}

/// Configuration for the transcoding pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root of the durable metadata store (one JSON file per record)
    pub state_dir: PathBuf,
    /// Root directory backing the object storage
    pub object_root: PathBuf,
    /// Local scratch space; every job gets its own subdirectory
    pub scratch_dir: PathBuf,
    /// Number of orchestrations allowed to run at once
    pub max_concurrent_jobs: usize,
    /// Interval between CPU/memory samples while a job runs
    pub sampler_interval_secs: u64,
    pub progress_cache_ttl_secs: u64,
    pub file_list_cache_ttl_secs: u64,
    pub presign_ttl_secs: u64,
    /// HMAC key for presigned object URLs
    pub presign_secret: String,
    /// Base URL presigned links are issued against
    pub object_base_url: String,
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    pub profile: EncodeProfile,
    /// Usernames granted the admin role
    pub admin_users: Vec<String>,
    /// Bearer token -> username table for the static verifier
    pub tokens: HashMap<String, String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl PipelineConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/hevcd/state"),
            object_root: PathBuf::from("/var/lib/hevcd/objects"),
            scratch_dir: PathBuf::from("/tmp/hevcd-scratch"),
            max_concurrent_jobs: 2,
            sampler_interval_secs: 2,
            progress_cache_ttl_secs: 3600,
            file_list_cache_ttl_secs: 3600,
            presign_ttl_secs: 3600,
            presign_secret: "change-me".to_string(),
            object_base_url: "http://localhost:3000/objects".to_string(),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            profile: EncodeProfile::default(),
            admin_users: Vec::new(),
            tokens: HashMap::new(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                config = Self::parse(&content, config_path)?;
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn parse(content: &str, config_path: &Path) -> Result<Self> {
        if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::from_str(content)
                .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))
        } else {
            serde_json::from_str(content)
                .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            bail!("max_concurrent_jobs must be at least 1");
        }
        if self.sampler_interval_secs == 0 {
            bail!("sampler_interval_secs must be greater than zero");
        }
        if self.presign_secret.is_empty() {
            bail!("presign_secret must not be empty");
        }
        if self.presign_ttl_secs == 0 || self.presign_ttl_secs > MAX_PRESIGN_TTL_SECS {
            bail!(
                "presign_ttl_secs must be between 1 and {} (got {})",
                MAX_PRESIGN_TTL_SECS,
                self.presign_ttl_secs
            );
        }
        Ok(())
    }

    pub fn sampler_interval(&self) -> Duration {
        Duration::from_secs(self.sampler_interval_secs)
    }

    pub fn progress_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.progress_cache_ttl_secs)
    }

    pub fn file_list_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.file_list_cache_ttl_secs)
    }

    pub fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.presign_ttl_secs)
    }
}
