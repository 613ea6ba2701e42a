use std::path::Path;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ffprobe failed (exit code {code}) for {path}: {stderr}")]
    Failed { code: i32, path: String, stderr: String },
    #[error("unreadable ffprobe output for {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Subset of ffprobe's JSON report this pipeline reads
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: FFProbeFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: String,
    pub duration: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub codec_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Container facts recorded on the file metadata and used for progress maths
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaInfo {
    pub format_name: String,
    pub duration_secs: Option<f64>,
    pub resolution: Option<String>,
}

impl From<FFProbeData> for MediaInfo {
    fn from(data: FFProbeData) -> Self {
        let duration_secs = data
            .format
            .duration
            .as_deref()
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d > 0.0);
        let resolution = data
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .and_then(|s| match (s.width, s.height) {
                (Some(w), Some(h)) => Some(format!("{}x{}", w, h)),
                _ => None,
            });
        MediaInfo {
            format_name: data.format.format_name,
            duration_secs,
            resolution,
        }
    }
}

pub fn parse_probe_output(path: &Path, json: &[u8]) -> Result<MediaInfo, ProbeError> {
    let data: FFProbeData = serde_json::from_slice(json).map_err(|source| ProbeError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    Ok(data.into())
}

/// Run ffprobe and parse the JSON output
pub async fn probe_file(ffprobe_bin: &Path, file_path: &Path) -> Result<MediaInfo, ProbeError> {
    let mut cmd = Command::new(ffprobe_bin);
    cmd.arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg(file_path)
        .kill_on_drop(true);

    debug!("ffprobe command: {} -v error -print_format json -show_format -show_streams {}",
           ffprobe_bin.display(), file_path.display());

    let output = cmd.output().await.map_err(|source| ProbeError::Spawn {
        program: ffprobe_bin.display().to_string(),
        source,
    })?;

    if !output.status.success() {
        return Err(ProbeError::Failed {
            code: output.status.code().unwrap_or(-1),
            path: file_path.display().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    parse_probe_output(file_path, &output.stdout)
}
