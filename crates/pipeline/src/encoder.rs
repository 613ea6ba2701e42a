use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use async_trait::async_trait;
use log::{debug, info};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use crate::config::{EncodeProfile, PipelineConfig};
use crate::probe::{probe_file, MediaInfo, ProbeError};

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("input file does not exist: {}", .0.display())]
    InputMissing(PathBuf),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ffmpeg exited with code {code}: {stderr_tail}")]
    Failed { code: i32, stderr_tail: String },
    #[error("encoder produced no output at {}", .0.display())]
    OutputMissing(PathBuf),
    #[error("encode cancelled")]
    Cancelled,
    #[error("encoder I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Probe(#[from] ProbeError),
}

#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Source duration, used to turn encoder timestamps into a percentage
    pub duration_secs: Option<f64>,
}

/// Media conversion seam. Exactly one result per `encode` call.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn probe(&self, input: &Path) -> Result<MediaInfo, EncodeError>;

    /// Encode `req.input` to `req.output`, sending whole-number percentages as
    /// they increase. The work is killed when `cancel` fires.
    async fn encode(
        &self,
        req: &EncodeRequest,
        progress: mpsc::UnboundedSender<u8>,
        cancel: CancellationToken,
    ) -> Result<(), EncodeError>;
}

/// Turns `-progress pipe:1` key=value lines into monotonic percentages
#[derive(Debug, Clone)]
pub struct ProgressParser {
    duration_us: Option<f64>,
    last: Option<u8>,
}

impl ProgressParser {
    pub fn new(duration_secs: Option<f64>) -> Self {
        Self {
            duration_us: duration_secs
                .filter(|d| d.is_finite() && *d > 0.0)
                .map(|d| d * 1_000_000.0),
            last: None,
        }
    }

    /// Feed one line; returns a percentage only when it went up
    pub fn feed(&mut self, line: &str) -> Option<u8> {
        let (key, value) = line.trim().split_once('=')?;
        let out_us = match key {
            // out_time_ms is microseconds as well
            "out_time_us" | "out_time_ms" => value.trim().parse::<i64>().ok()? as f64,
            "out_time" => parse_timestamp_us(value.trim())?,
            _ => return None,
        };
        self.observe(out_us)
    }

    fn observe(&mut self, out_us: f64) -> Option<u8> {
        let total = self.duration_us?;
        if out_us < 0.0 {
            return None;
        }
        let pct = (out_us / total * 100.0).floor().clamp(0.0, 100.0) as u8;
        match self.last {
            Some(prev) if pct <= prev => None,
            _ => {
                self.last = Some(pct);
                Some(pct)
            }
        }
    }
}

/// `HH:MM:SS.micro` to microseconds
fn parse_timestamp_us(raw: &str) -> Option<f64> {
    let mut parts = raw.split(':');
    let h = parts.next()?.parse::<f64>().ok()?;
    let m = parts.next()?.parse::<f64>().ok()?;
    let s = parts.next()?.parse::<f64>().ok()?;
    if parts.next().is_some() || h < 0.0 {
        return None;
    }
    Some((h * 3600.0 + m * 60.0 + s) * 1_000_000.0)
}

/// ffmpeg/ffprobe on the local machine
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg_bin: PathBuf,
    ffprobe_bin: PathBuf,
    profile: EncodeProfile,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg_bin: impl Into<PathBuf>, ffprobe_bin: impl Into<PathBuf>, profile: EncodeProfile) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
            profile,
        }
    }

    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self::new(cfg.ffmpeg_bin.clone(), cfg.ffprobe_bin.clone(), cfg.profile.clone())
    }

    /// Full ffmpeg argument list for one encode
    pub fn build_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let p = &self.profile;
        let mut args: Vec<String> = ["-hide_banner", "-y", "-nostats", "-progress", "pipe:1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push("-i".to_string());
        args.push(input.to_string_lossy().to_string());
        args.extend([
            "-c:v".to_string(),
            p.video_codec.clone(),
            "-s".to_string(),
            p.resolution.clone(),
            "-b:v".to_string(),
            p.video_bitrate.clone(),
            "-b:a".to_string(),
            p.audio_bitrate.clone(),
            "-preset".to_string(),
            p.preset.clone(),
            "-crf".to_string(),
            p.crf.to_string(),
            "-threads".to_string(),
            p.threads.to_string(),
        ]);
        args.push(output.to_string_lossy().to_string());
        args
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn probe(&self, input: &Path) -> Result<MediaInfo, EncodeError> {
        if !input.exists() {
            return Err(EncodeError::InputMissing(input.to_path_buf()));
        }
        Ok(probe_file(&self.ffprobe_bin, input).await?)
    }

    async fn encode(
        &self,
        req: &EncodeRequest,
        progress: mpsc::UnboundedSender<u8>,
        cancel: CancellationToken,
    ) -> Result<(), EncodeError> {
        if !req.input.exists() {
            return Err(EncodeError::InputMissing(req.input.clone()));
        }

        let args = self.build_args(&req.input, &req.output);
        debug!("Executing FFmpeg: {} {}", self.ffmpeg_bin.display(), args.join(" "));

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EncodeError::Spawn {
                program: self.ffmpeg_bin.display().to_string(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "ffmpeg stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "ffmpeg stderr not captured"))?;

        let mut parser = ProgressParser::new(req.duration_secs);
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(pct) = parser.feed(&line) {
                    // Receiver gone just means nobody is listening any more
                    let _ = progress.send(pct);
                }
            }
        });
        let stderr_task = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let status = match waited {
            Some(status) => status?,
            None => {
                info!("🛑 Cancelling encode of {}", req.input.display());
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(EncodeError::Cancelled);
            }
        };

        let _ = stdout_task.await;
        let stderr_tail = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(EncodeError::Failed {
                code: status.code().unwrap_or(-1),
                stderr_tail,
            });
        }

        let produced = tokio::fs::metadata(&req.output)
            .await
            .map(|m| m.len() > 0)
            .unwrap_or(false);
        if !produced {
            return Err(EncodeError::OutputMissing(req.output.clone()));
        }

        info!("FFmpeg execution completed successfully: {}", req.output.display());
        Ok(())
    }
}
