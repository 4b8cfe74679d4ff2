//! ComfyUI WebSocket event types and parser.
//!
//! ComfyUI sends JSON text frames shaped `{"type": "<kind>", "data": {...}}`.
//! Only the kinds the watcher acts on get typed payloads; everything else
//! (custom-node monitors, preview metadata, ...) parses to
//! [`EngineEvent::Other`] so a new server-side event type never breaks a
//! running watch.

use serde::Deserialize;

/// One frame from the event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Server status broadcast (queue depth).
    Status(StatusData),
    /// A prompt has started executing.
    ExecutionStart(PromptRef),
    /// Some nodes were served from cache.
    ExecutionCached(CachedData),
    /// A node is executing, or the prompt finished when `node` is `None`.
    Executing(ExecutingData),
    /// Step-level progress from a long-running node.
    Progress(ProgressData),
    /// A node finished and produced output.
    Executed(ExecutedData),
    /// Newer servers announce success separately from `executing: null`.
    ExecutionSuccess(PromptRef),
    /// Execution failed.
    ExecutionError(ErrorData),
    /// Execution was interrupted on the server.
    ExecutionInterrupted(InterruptedData),
    /// Any other event type, by name.
    Other(String),
}

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PromptRef {
    pub prompt_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CachedData {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload for `executing`. A missing `prompt_id` means the frame is not
/// addressed to any submission.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressData {
    pub value: i64,
    pub max: i64,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    #[serde(default)]
    pub output: serde_json::Value,
    pub prompt_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InterruptedData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

impl EngineEvent {
    /// Submission the event belongs to, if any.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            Self::ExecutionStart(d) | Self::ExecutionSuccess(d) => Some(&d.prompt_id),
            Self::ExecutionCached(d) => Some(&d.prompt_id),
            Self::Executing(d) => d.prompt_id.as_deref(),
            Self::Progress(d) => d.prompt_id.as_deref(),
            Self::Executed(d) => Some(&d.prompt_id),
            Self::ExecutionError(d) => Some(&d.prompt_id),
            Self::ExecutionInterrupted(d) => Some(&d.prompt_id),
            Self::Status(_) | Self::Other(_) => None,
        }
    }

    /// The terminal signal: `executing` with a null node for `prompt_id`.
    pub fn is_completion_of(&self, prompt_id: &str) -> bool {
        matches!(
            self,
            Self::Executing(ExecutingData { node: None, prompt_id: Some(id) }) if id == prompt_id
        )
    }
}

/// Parse one text frame.
///
/// Returns `Err` only for malformed JSON or a known event type whose
/// payload does not match; unknown types become [`EngineEvent::Other`].
pub fn parse_event(text: &str) -> Result<EngineEvent, serde_json::Error> {
    let frame: Frame = serde_json::from_str(text)?;
    let event = match frame.kind.as_str() {
        "status" => EngineEvent::Status(serde_json::from_value(frame.data)?),
        "execution_start" => EngineEvent::ExecutionStart(serde_json::from_value(frame.data)?),
        "execution_cached" => EngineEvent::ExecutionCached(serde_json::from_value(frame.data)?),
        "executing" => EngineEvent::Executing(serde_json::from_value(frame.data)?),
        "progress" => EngineEvent::Progress(serde_json::from_value(frame.data)?),
        "executed" => EngineEvent::Executed(serde_json::from_value(frame.data)?),
        "execution_success" => EngineEvent::ExecutionSuccess(serde_json::from_value(frame.data)?),
        "execution_error" => EngineEvent::ExecutionError(serde_json::from_value(frame.data)?),
        "execution_interrupted" => {
            EngineEvent::ExecutionInterrupted(serde_json::from_value(frame.data)?)
        }
        _ => EngineEvent::Other(frame.kind),
    };
    Ok(event)
}
