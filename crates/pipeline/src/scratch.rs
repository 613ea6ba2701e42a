use std::path::{Path, PathBuf};
use log::{debug, warn};

/// Per-job working directory at `<root>/<trackingId>/`, removed when released or dropped.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    released: bool,
}

impl ScratchDir {
    pub async fn create(root: &Path, tracking_id: &str) -> std::io::Result<Self> {
        let path = root.join(tracking_id);
        tokio::fs::create_dir_all(&path).await?;
        debug!("Created scratch directory {}", path.display());
        Ok(Self { path, released: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the downloaded source lands
    pub fn input_path(&self, file_name: &str) -> PathBuf {
        self.path.join(file_name)
    }

    /// `<stem>_transcoded.mp4` next to the input
    pub fn output_path(&self, file_name: &str) -> PathBuf {
        self.path.join(transcoded_name(file_name))
    }

    pub async fn release(mut self) -> std::io::Result<()> {
        self.released = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || remove_quietly(&path));
            }
            Err(_) => remove_quietly(&path),
        }
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove scratch directory {}: {}", path.display(), e);
        }
    }
}

/// Output name for a source file
pub fn transcoded_name(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    format!("{}_transcoded.mp4", stem)
}
