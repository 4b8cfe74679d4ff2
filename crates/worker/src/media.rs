//! Input media acquisition.
//!
//! Turns a [`MediaSource`] into a file path the engine can read. Inline
//! and remote sources are written under the scratch directory as
//! `<task_id>_<role>.<ext>`; local paths pass through untouched. Files this
//! module creates are tracked in a [`ScratchFiles`] set and removed when the
//! request finishes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine as _;
use vidgen_core::request::MediaSource;

/// Extension used when the source does not reveal one.
const DEFAULT_IMAGE_EXT: &str = "jpg";

/// Upper bound on one image download, body included.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("Invalid base64 data for {role}: {source}")]
    Decode {
        role: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("Failed to download {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("Input file not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Fetches and decodes request images into the scratch directory.
#[derive(Debug, Clone)]
pub struct MediaFetcher {
    http: reqwest::Client,
    scratch_dir: PathBuf,
    download_timeout: Duration,
}

/// Files written during one request, removed by [`ScratchFiles::release`].
#[derive(Debug, Default)]
pub struct ScratchFiles {
    paths: Vec<PathBuf>,
}

impl ScratchFiles {
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Best-effort removal of every tracked file.
    pub async fn release(self) {
        for path in self.paths {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove scratch file");
                }
            }
        }
    }
}

impl MediaFetcher {
    pub fn new(http: reqwest::Client, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            http,
            scratch_dir: scratch_dir.into(),
            download_timeout: DOWNLOAD_TIMEOUT,
        }
    }

    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    /// Make `source` available on disk and return its path.
    ///
    /// `role` names the image (`start`, `end`) in the scratch file name.
    pub async fn acquire(
        &self,
        source: &MediaSource,
        task_id: &str,
        role: &str,
        scratch: &mut ScratchFiles,
    ) -> Result<PathBuf, MediaError> {
        match source {
            MediaSource::Path(path) => {
                if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                    return Err(MediaError::Missing(path.clone()));
                }
                Ok(path.clone())
            }
            MediaSource::Base64(data) => {
                let (mime, payload) = split_data_uri(data);
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(payload.trim())
                    .map_err(|source| MediaError::Decode {
                        role: role.to_string(),
                        source,
                    })?;
                let ext = mime.and_then(ext_for_mime).unwrap_or(DEFAULT_IMAGE_EXT);
                self.write(task_id, role, ext, &bytes, scratch).await
            }
            MediaSource::Url(url) => {
                let bytes = self.download(url).await?;
                let ext = ext_from_url(url).unwrap_or(DEFAULT_IMAGE_EXT);
                self.write(task_id, role, ext, &bytes, scratch).await
            }
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, MediaError> {
        let failed = |reason: String| MediaError::Download {
            url: url.to_string(),
            reason,
        };

        let response = self
            .http
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {status}")));
        }
        let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;

        tracing::debug!(url, bytes = bytes.len(), "Downloaded input image");
        Ok(bytes.to_vec())
    }

    async fn write(
        &self,
        task_id: &str,
        role: &str,
        ext: &str,
        bytes: &[u8],
        scratch: &mut ScratchFiles,
    ) -> Result<PathBuf, MediaError> {
        let path = self.scratch_dir.join(format!("{task_id}_{role}.{ext}"));
        let write_err = |source| MediaError::Write {
            path: path.clone(),
            source,
        };

        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(write_err)?;
        tokio::fs::write(&path, bytes).await.map_err(write_err)?;
        scratch.paths.push(path.clone());

        tracing::debug!(path = %path.display(), bytes = bytes.len(), role, "Wrote input image");
        Ok(path)
    }
}

/// Split an optional `data:<mime>;base64,` prefix off `data`.
fn split_data_uri(data: &str) -> (Option<&str>, &str) {
    let Some(rest) = data.strip_prefix("data:") else {
        return (None, data);
    };
    match rest.split_once(',') {
        Some((header, payload)) => {
            let mime = header.split(';').next().filter(|m| !m.is_empty());
            (mime, payload)
        }
        None => (None, data),
    }
}

fn ext_for_mime(mime: &str) -> Option<&'static str> {
    match mime.to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "image/bmp" => Some("bmp"),
        _ => None,
    }
}

fn ext_from_url(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("jpg"),
        "png" => Some("png"),
        "webp" => Some("webp"),
        "gif" => Some("gif"),
        "bmp" => Some("bmp"),
        _ => None,
    }
}
