//! Hand a resolved artifact back to the caller.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use vidgen_comfyui::resolver::Artifact;

use crate::config::PublishMode;

/// Extension given to copies whose source has none.
const DEFAULT_VIDEO_EXT: &str = "mp4";

/// Result of publishing, one variant per [`PublishMode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Published {
    /// Copied into the shared output directory.
    Copied(PathBuf),
    /// The engine's own path, unchanged.
    InPlace(PathBuf),
    /// `data:<mime>;base64,<payload>`.
    Inline(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The artifact vanished between resolution and publishing.
    #[error("Output file is not readable: {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to copy output to {}: {source}", dest.display())]
    Copy {
        dest: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct OutputPublisher {
    mode: PublishMode,
    output_dir: PathBuf,
}

impl OutputPublisher {
    pub fn new(mode: PublishMode, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            output_dir: output_dir.into(),
        }
    }

    pub fn mode(&self) -> PublishMode {
        self.mode
    }

    /// Publish `artifact` for request `task_id`.
    pub async fn publish(&self, artifact: &Artifact, task_id: &str) -> Result<Published, PublishError> {
        let source = &artifact.path;
        let unreadable = |e| PublishError::Unreadable {
            path: source.clone(),
            source: e,
        };

        let meta = tokio::fs::metadata(source).await.map_err(unreadable)?;
        if !meta.is_file() {
            return Err(unreadable(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "not a regular file",
            )));
        }

        match self.mode {
            PublishMode::Path => Ok(Published::InPlace(source.clone())),
            PublishMode::Copy => {
                let ext = source
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or(DEFAULT_VIDEO_EXT);
                let dest = self.output_dir.join(format!("{task_id}.{ext}"));
                let copy_err = |e| PublishError::Copy {
                    dest: dest.clone(),
                    source: e,
                };

                tokio::fs::create_dir_all(&self.output_dir)
                    .await
                    .map_err(copy_err)?;
                let bytes = tokio::fs::copy(source, &dest).await.map_err(copy_err)?;

                tracing::info!(
                    from = %source.display(),
                    to = %dest.display(),
                    bytes,
                    "Copied output to shared volume",
                );
                Ok(Published::Copied(dest))
            }
            PublishMode::Base64 => {
                let bytes = tokio::fs::read(source).await.map_err(unreadable)?;
                let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
                tracing::info!(path = %source.display(), bytes = bytes.len(), "Inlined output");
                Ok(Published::Inline(format!(
                    "data:{};base64,{encoded}",
                    mime_for(source)
                )))
            }
        }
    }
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}
