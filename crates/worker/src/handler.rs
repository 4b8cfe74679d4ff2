//! Job handler: one request in, one JSON response out.
//!
//! The pipeline is strictly sequential: validate, acquire input media,
//! select and bind the template, submit and wait, resolve the artifact,
//! publish. Every failure is converted into `{"error": "..."}` at
//! [`Handler::handle`]; nothing here terminates the process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vidgen_comfyui::api::ComfyUIApi;
use vidgen_comfyui::client::{ClientId, ComfyUIClient};
use vidgen_comfyui::resolver::resolve;
use vidgen_comfyui::watcher::{CompletionWatcher, WatchError};
use vidgen_core::binding::{bind, BindingDescriptor};
use vidgen_core::error::CoreError;
use vidgen_core::request::{BindingRequest, GenerationRequest, JobInput};
use vidgen_core::template::TemplateStore;

use crate::config::WorkerConfig;
use crate::media::{MediaError, MediaFetcher, ScratchFiles};
use crate::publish::{OutputPublisher, PublishError, Published};

/// Prefix of generated task IDs.
const TASK_PREFIX: &str = "wan22";

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

/// A job document: `{"id"?: "...", "input": {...}}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub input: JobInput,
}

/// Handler response. Exactly one key is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobResponse {
    VideoPath { video_path: String },
    FilePath { file_path: String },
    Video { video: String },
    Error { error: String },
}

impl JobResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl From<Published> for JobResponse {
    fn from(published: Published) -> Self {
        match published {
            Published::Copied(path) => Self::VideoPath {
                video_path: path.to_string_lossy().into_owned(),
            },
            Published::InPlace(path) => Self::FilePath {
                file_path: path.to_string_lossy().into_owned(),
            },
            Published::Inline(video) => Self::Video { video },
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Validation, template, or binding failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    /// The prompt finished but no output node matched a known shape.
    #[error("Video not generated: prompt {prompt_id} produced no recognised output")]
    ArtifactNotProduced { prompt_id: String },

    #[error("Video not readable at {}: {source}", path.display())]
    ArtifactUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Publish(PublishError),
}

impl From<PublishError> for HandlerError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::Unreadable { path, source } => Self::ArtifactUnreadable { path, source },
            other => Self::Publish(other),
        }
    }
}

impl HandlerError {
    /// Stable class name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Core(CoreError::Input(_)) => "InputError",
            Self::Core(CoreError::Binding(_)) => "BindingError",
            Self::Core(_) => "TemplateError",
            Self::Media(_) => "InputError",
            Self::Watch(WatchError::Unreachable { .. }) => "EngineUnreachable",
            Self::Watch(WatchError::Timeout { .. }) => "CompletionTimeout",
            Self::Watch(WatchError::Cancelled) => "Cancelled",
            Self::Watch(WatchError::Execution { .. }) => "ExecutionError",
            Self::Watch(_) => "EngineError",
            Self::ArtifactNotProduced { .. } => "ArtifactNotProduced",
            Self::ArtifactUnreadable { .. } => "ArtifactUnreadable",
            Self::Publish(_) => "PublishError",
        }
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// New task ID of the form `wan22_<32 hex chars>`.
pub fn new_task_id() -> String {
    format!("{TASK_PREFIX}_{}", uuid::Uuid::new_v4().simple())
}

/// Runs jobs against one engine instance.
///
/// Shares only the read-only [`TemplateStore`]; every call to
/// [`handle`](Self::handle) uses its own client ID, connection, and
/// template copy, so concurrent jobs do not interfere.
pub struct Handler {
    templates: Arc<TemplateStore>,
    watcher: CompletionWatcher,
    media: MediaFetcher,
    publisher: OutputPublisher,
    engine_output_dir: PathBuf,
    completion_timeout: Duration,
}

impl Handler {
    pub fn new(config: &WorkerConfig, templates: Arc<TemplateStore>) -> Self {
        let http = reqwest::Client::new();
        let watcher = CompletionWatcher::new(
            ComfyUIApi::with_client(http.clone(), config.engine.http_url()),
            ComfyUIClient::for_address(&config.engine),
            config.connect_retry,
        );
        Self::with_watcher(config, templates, watcher, http)
    }

    /// Build around an existing watcher, e.g. one whose REST and event
    /// endpoints live on different addresses.
    pub fn with_watcher(
        config: &WorkerConfig,
        templates: Arc<TemplateStore>,
        watcher: CompletionWatcher,
        http: reqwest::Client,
    ) -> Self {
        Self {
            templates,
            watcher,
            media: MediaFetcher::new(http, &config.scratch_dir),
            publisher: OutputPublisher::new(config.publish_mode, &config.output_dir),
            engine_output_dir: config.engine_output_dir.clone(),
            completion_timeout: config.completion_timeout,
        }
    }

    /// Run one job to completion. Never fails; errors become
    /// [`JobResponse::Error`].
    pub async fn handle(&self, job: Job, cancel: &CancellationToken) -> JobResponse {
        let task_id = new_task_id();
        let job_id = job.id.as_deref().unwrap_or("-").to_string();
        tracing::info!(task_id = %task_id, job_id = %job_id, "Job received");

        match self.process(job.input, &task_id, cancel).await {
            Ok(published) => {
                tracing::info!(task_id = %task_id, mode = self.publisher.mode().as_str(), "Job completed");
                published.into()
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, job_id = %job_id, kind = e.kind(), error = %e, "Job failed");
                JobResponse::error(e.to_string())
            }
        }
    }

    async fn process(
        &self,
        input: JobInput,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Published, HandlerError> {
        let request = GenerationRequest::from_input(input)?;

        let mut scratch = ScratchFiles::default();
        let outcome = self.generate(&request, task_id, &mut scratch, cancel).await;
        scratch.release().await;
        outcome
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        task_id: &str,
        scratch: &mut ScratchFiles,
        cancel: &CancellationToken,
    ) -> Result<Published, HandlerError> {
        let image = self.media.acquire(&request.image, task_id, "start", scratch).await?;
        let end_image = match &request.end_image {
            Some(source) => Some(self.media.acquire(source, task_id, "end", scratch).await?),
            None => None,
        };

        let template = self
            .templates
            .select(request.engine, end_image.is_some())
            .await?;
        let variant = template.variant();
        let bound = bind(
            &template,
            &BindingRequest {
                image: image.to_string_lossy().into_owned(),
                end_image: end_image.map(|p| p.to_string_lossy().into_owned()),
                params: request.params.clone(),
            },
        )?;

        let client_id = ClientId::generate();
        tracing::info!(
            task_id,
            variant = %variant,
            client_id = %client_id,
            image_source = request.image.kind(),
            "Submitting graph",
        );

        let deadline = Instant::now() + self.completion_timeout;
        let record = self
            .watcher
            .run(&bound.to_prompt(), &client_id, deadline, cancel)
            .await?;

        let shapes = BindingDescriptor::for_variant(variant).outputs;
        let artifact = resolve(&record, shapes, &self.engine_output_dir).ok_or_else(|| {
            HandlerError::ArtifactNotProduced {
                prompt_id: record.prompt_id.clone(),
            }
        })?;

        Ok(self.publisher.publish(&artifact, task_id).await?)
    }
}
