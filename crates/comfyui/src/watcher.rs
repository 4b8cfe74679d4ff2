//! Submission and completion watching.
//!
//! [`CompletionWatcher::run`] drives one generation end to end:
//!
//! 1. open the event stream as the request's [`ClientId`] (bounded retry),
//! 2. submit the graph under the same client ID,
//! 3. read events until `executing` with a null node arrives for *this*
//!    prompt, the deadline passes, or the token is cancelled,
//! 4. fetch the history record.
//!
//! One deadline bounds all four steps and the cancellation token can end
//! any of them. The socket is closed on every path out of step 2-4. Events
//! addressed to other prompts are skipped; with a fresh client ID per request they
//! should not occur, but the engine broadcasts some events and a shared
//! identity must never complete the wrong request.

use std::future::Future;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, ComfyUIApiError, EngineApi};
use crate::client::{ClientId, ComfyUIClient};
use crate::history::ResultRecord;
use crate::messages::{parse_event, EngineEvent};
use crate::reconnect::{connect_with_retry, ConnectFailure, RetryPolicy};

/// Errors that end a watch.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The event stream could not be opened within the retry policy.
    #[error("Engine unreachable after {attempts} connection attempts: {last_error}")]
    Unreachable { attempts: u32, last_error: String },

    #[error("Submission failed: {0}")]
    Submit(#[source] ComfyUIApiError),

    #[error("Event stream error: {0}")]
    Stream(String),

    #[error("Event stream closed before prompt {prompt_id} completed")]
    StreamClosed { prompt_id: String },

    /// The engine reported an execution error or interruption.
    #[error("Execution of prompt {prompt_id} failed at node {node}: {message}")]
    Execution {
        prompt_id: String,
        node: String,
        message: String,
    },

    /// The deadline passed during `stage`. A submission already made is
    /// abandoned on the engine, not cancelled.
    #[error(
        "Timed out after {}ms waiting for {stage}{}",
        .waited.as_millis(),
        of_prompt(.prompt_id)
    )]
    Timeout {
        stage: WatchStage,
        prompt_id: Option<String>,
        waited: Duration,
    },

    #[error("Watch cancelled")]
    Cancelled,

    #[error("History lookup failed: {0}")]
    History(#[source] ComfyUIApiError),

    #[error("History has no entry for prompt {prompt_id}")]
    HistoryMissing { prompt_id: String },
}

fn of_prompt(prompt_id: &Option<String>) -> String {
    prompt_id
        .as_deref()
        .map(|id| format!(" of prompt {id}"))
        .unwrap_or_default()
}

/// Step of a watch, as reported by [`WatchError::Timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStage {
    Connect,
    Submit,
    Completion,
    History,
}

impl std::fmt::Display for WatchStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Connect => "the event stream",
            Self::Submit => "submission",
            Self::Completion => "completion",
            Self::History => "the history record",
        })
    }
}

/// Deadline and cancellation shared by every step of one watch.
#[derive(Clone, Copy)]
struct Budget<'a> {
    started: Instant,
    deadline: Instant,
    cancel: &'a CancellationToken,
}

impl<'a> Budget<'a> {
    fn new(deadline: Instant, cancel: &'a CancellationToken) -> Self {
        Self {
            started: Instant::now(),
            deadline,
            cancel,
        }
    }

    /// Run `step` unless the deadline passes or the token fires first.
    async fn run<T>(
        &self,
        stage: WatchStage,
        prompt_id: Option<&str>,
        step: impl Future<Output = Result<T, WatchError>>,
    ) -> Result<T, WatchError> {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                tracing::info!(%stage, prompt_id, "Watch cancelled");
                Err(WatchError::Cancelled)
            }
            result = tokio::time::timeout_at(self.deadline, step) => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(WatchError::Timeout {
                    stage,
                    prompt_id: prompt_id.map(str::to_string),
                    waited: self.started.elapsed(),
                }),
            },
        }
    }
}

impl From<ConnectFailure> for WatchError {
    fn from(failure: ConnectFailure) -> Self {
        match failure {
            ConnectFailure::Exhausted {
                attempts,
                last_error,
            } => Self::Unreachable {
                attempts,
                last_error,
            },
            ConnectFailure::Cancelled => Self::Cancelled,
        }
    }
}

/// Drives submissions against one engine instance.
pub struct CompletionWatcher<A = ComfyUIApi> {
    api: A,
    client: ComfyUIClient,
    retry: RetryPolicy,
}

impl<A: EngineApi> CompletionWatcher<A> {
    pub fn new(api: A, client: ComfyUIClient, retry: RetryPolicy) -> Self {
        Self { api, client, retry }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Submit `graph` as `client_id` and wait for its result record.
    ///
    /// `deadline` bounds the whole call, connection retries included.
    pub async fn run(
        &self,
        graph: &serde_json::Value,
        client_id: &ClientId,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<ResultRecord, WatchError> {
        let budget = Budget::new(deadline, cancel);

        let mut conn = budget
            .run(WatchStage::Connect, None, async {
                connect_with_retry(&self.client, client_id, &self.retry, cancel)
                    .await
                    .map_err(WatchError::from)
            })
            .await?;

        let outcome = submit_and_wait_within(&self.api, &mut conn.ws_stream, graph, client_id, budget).await;

        conn.close().await;
        outcome
    }
}

/// Steps 2-4 of a watch over an already-open event stream.
pub async fn submit_and_wait<A, S>(
    api: &A,
    stream: &mut S,
    graph: &serde_json::Value,
    client_id: &ClientId,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<ResultRecord, WatchError>
where
    A: EngineApi + ?Sized,
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    submit_and_wait_within(api, stream, graph, client_id, Budget::new(deadline, cancel)).await
}

async fn submit_and_wait_within<A, S>(
    api: &A,
    stream: &mut S,
    graph: &serde_json::Value,
    client_id: &ClientId,
    budget: Budget<'_>,
) -> Result<ResultRecord, WatchError>
where
    A: EngineApi + ?Sized,
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let submitted = budget
        .run(WatchStage::Submit, None, async {
            api.submit_prompt(graph, client_id.as_str())
                .await
                .map_err(WatchError::Submit)
        })
        .await?;
    let prompt_id = submitted.prompt_id;

    tracing::info!(
        client_id = %client_id,
        prompt_id = %prompt_id,
        queue_number = submitted.number,
        "Graph submitted",
    );
    if submitted.node_errors.as_object().is_some_and(|errs| !errs.is_empty()) {
        tracing::warn!(prompt_id = %prompt_id, node_errors = %submitted.node_errors, "Engine reported node errors");
    }

    budget
        .run(WatchStage::Completion, Some(&prompt_id), read_until_complete(stream, &prompt_id))
        .await?;

    let history = budget
        .run(WatchStage::History, Some(&prompt_id), async {
            api.get_history(&prompt_id).await.map_err(WatchError::History)
        })
        .await?;
    ResultRecord::from_history(&prompt_id, history).ok_or(WatchError::HistoryMissing { prompt_id })
}

/// Read events until the terminal event for `prompt_id`.
///
/// Bounded by `deadline` and `cancel`; never waits on the socket
/// past either.
pub async fn wait_for_completion<S>(
    stream: &mut S,
    prompt_id: &str,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<(), WatchError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    Budget::new(deadline, cancel)
        .run(WatchStage::Completion, Some(prompt_id), read_until_complete(stream, prompt_id))
        .await
}

async fn read_until_complete<S>(stream: &mut S, prompt_id: &str) -> Result<(), WatchError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match parse_event(&text) {
                Ok(event) => match observe(&event, prompt_id) {
                    Step::Continue => {}
                    Step::Done => return Ok(()),
                    Step::Failed(e) => return Err(e),
                },
                Err(e) => {
                    tracing::warn!(
                        prompt_id,
                        error = %e,
                        raw_message = %text,
                        "Failed to parse engine event",
                    );
                }
            },
            Ok(Message::Binary(_)) => {
                // Preview frames.
                tracing::trace!(prompt_id, "Ignoring binary frame");
            }
            Ok(Message::Close(frame)) => {
                tracing::info!(prompt_id, ?frame, "Engine closed the event stream");
                break;
            }
            Ok(_) => {}
            Err(e) => return Err(WatchError::Stream(e.to_string())),
        }
    }
    Err(WatchError::StreamClosed {
        prompt_id: prompt_id.to_string(),
    })
}

enum Step {
    Continue,
    Done,
    Failed(WatchError),
}

fn observe(event: &EngineEvent, prompt_id: &str) -> Step {
    if let EngineEvent::Status(data) = event {
        tracing::debug!(
            queue_remaining = data.status.exec_info.queue_remaining,
            "Engine queue status",
        );
        return Step::Continue;
    }

    match event.prompt_id() {
        Some(id) if id == prompt_id => {}
        Some(other) => {
            tracing::debug!(prompt_id, other_prompt_id = other, "Ignoring event for another prompt");
            return Step::Continue;
        }
        None => {
            tracing::trace!(prompt_id, ?event, "Ignoring unaddressed event");
            return Step::Continue;
        }
    }

    if event.is_completion_of(prompt_id) {
        tracing::info!(prompt_id, "Execution completed (all nodes done)");
        return Step::Done;
    }

    match event {
        EngineEvent::ExecutionStart(_) => {
            tracing::info!(prompt_id, "Execution started");
        }
        EngineEvent::ExecutionCached(data) => {
            tracing::debug!(prompt_id, cached = data.nodes.len(), "Execution used cache");
        }
        EngineEvent::Executing(data) => {
            tracing::debug!(prompt_id, node = ?data.node, "Executing node");
        }
        EngineEvent::Progress(data) => {
            let percent = if data.max > 0 {
                data.value * 100 / data.max
            } else {
                0
            };
            tracing::debug!(prompt_id, value = data.value, max = data.max, percent, "Generation progress");
        }
        EngineEvent::Executed(data) => {
            tracing::debug!(prompt_id, node = %data.node, "Node executed with output");
        }
        EngineEvent::ExecutionSuccess(_) => {
            tracing::debug!(prompt_id, "Engine reported success");
        }
        EngineEvent::ExecutionError(data) => {
            tracing::error!(
                prompt_id,
                node_id = ?data.node_id,
                error_type = %data.exception_type,
                error_message = %data.exception_message,
                "Execution error",
            );
            let message = if data.exception_type.is_empty() {
                data.exception_message.clone()
            } else {
                format!("{}: {}", data.exception_type, data.exception_message)
            };
            return Step::Failed(WatchError::Execution {
                prompt_id: prompt_id.to_string(),
                node: data.node_id.clone().unwrap_or_else(|| "?".to_string()),
                message,
            });
        }
        EngineEvent::ExecutionInterrupted(data) => {
            return Step::Failed(WatchError::Execution {
                prompt_id: prompt_id.to_string(),
                node: data.node_id.clone().unwrap_or_else(|| "?".to_string()),
                message: "execution interrupted".to_string(),
            });
        }
        EngineEvent::Status(_) | EngineEvent::Other(_) => {}
    }
    Step::Continue
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use super::*;
    use crate::api::SubmitResponse;

    /// Engine fake: hands out a fixed prompt ID and history document.
    struct FakeApi {
        prompt_id: String,
        history: serde_json::Value,
        submissions: Mutex<Vec<String>>,
        history_calls: Mutex<u32>,
    }

    impl FakeApi {
        fn new(prompt_id: &str, history: serde_json::Value) -> Self {
            Self {
                prompt_id: prompt_id.to_string(),
                history,
                submissions: Mutex::new(Vec::new()),
                history_calls: Mutex::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl EngineApi for FakeApi {
        async fn submit_prompt(
            &self,
            _graph: &serde_json::Value,
            client_id: &str,
        ) -> Result<SubmitResponse, ComfyUIApiError> {
            self.submissions.lock().unwrap().push(client_id.to_string());
            Ok(SubmitResponse {
                prompt_id: self.prompt_id.clone(),
                number: 0,
                node_errors: serde_json::json!({}),
            })
        }

        async fn get_history(&self, _prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
            *self.history_calls.lock().unwrap() += 1;
            Ok(self.history.clone())
        }
    }

    fn text(json: serde_json::Value) -> Result<Message, WsError> {
        Ok(Message::text(json.to_string()))
    }

    fn executing(node: Option<&str>, prompt_id: &str) -> Result<Message, WsError> {
        text(serde_json::json!({"type": "executing", "data": {"node": node, "prompt_id": prompt_id}}))
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn foreign_terminal_event_is_ignored() {
        let api = FakeApi::new(
            "mine",
            serde_json::json!({"mine": {"outputs": {"131": {"gifs": [{"fullpath": "/v.mp4"}]}}}}),
        );
        let mut stream = futures::stream::iter(vec![
            executing(None, "theirs"),
            executing(None, "mine"),
        ]);
        let client_id = ClientId::generate();

        let record = submit_and_wait(
            &api,
            &mut stream,
            &serde_json::json!({}),
            &client_id,
            far_deadline(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(record.prompt_id, "mine");
        assert_eq!(record.outputs.len(), 1);
        assert_eq!(*api.submissions.lock().unwrap(), vec![client_id.to_string()]);
        assert_eq!(*api.history_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn progress_and_noise_do_not_complete() {
        let mut stream = futures::stream::iter(vec![
            text(serde_json::json!({"type": "status", "data": {"status": {"exec_info": {"queue_remaining": 1}}}})),
            text(serde_json::json!({"type": "execution_start", "data": {"prompt_id": "p"}})),
            executing(Some("540"), "p"),
            text(serde_json::json!({"type": "progress", "data": {"value": 3, "max": 10, "prompt_id": "p"}})),
            Ok(Message::binary(vec![0u8, 1, 2])),
            Ok(Message::text("{ garbage")),
            text(serde_json::json!({"type": "crystools.monitor", "data": {}})),
            executing(Some("131"), "p"),
        ]);

        let err = wait_for_completion(&mut stream, "p", far_deadline(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, WatchError::StreamClosed { prompt_id } if prompt_id == "p");
    }

    #[tokio::test]
    async fn deadline_is_enforced_on_silent_stream() {
        let mut stream = futures::stream::pending::<Result<Message, WsError>>();
        let deadline = Instant::now() + Duration::from_millis(50);

        let err = wait_for_completion(&mut stream, "p", deadline, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(
            err,
            WatchError::Timeout { stage: WatchStage::Completion, ref prompt_id, .. }
                if prompt_id.as_deref() == Some("p")
        );
        assert!(err.to_string().ends_with("ms waiting for completion of prompt p"), "{err}");
        assert!(!err.to_string().starts_with("Timed out after 0ms"), "{err}");
    }

    /// Engine fake whose REST calls never answer.
    struct StalledApi;

    #[async_trait::async_trait]
    impl EngineApi for StalledApi {
        async fn submit_prompt(
            &self,
            _graph: &serde_json::Value,
            _client_id: &str,
        ) -> Result<SubmitResponse, ComfyUIApiError> {
            std::future::pending().await
        }

        async fn get_history(&self, _prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn deadline_bounds_a_stalled_submission() {
        let mut stream = futures::stream::pending::<Result<Message, WsError>>();
        let deadline = Instant::now() + Duration::from_millis(50);

        let err = submit_and_wait(
            &StalledApi,
            &mut stream,
            &serde_json::json!({}),
            &ClientId::generate(),
            deadline,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_matches!(err, WatchError::Timeout { stage: WatchStage::Submit, prompt_id: None, .. });
        assert!(err.to_string().contains("waiting for submission"), "{err}");
    }

    #[tokio::test]
    async fn cancellation_ends_a_stalled_submission() {
        let mut stream = futures::stream::pending::<Result<Message, WsError>>();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = submit_and_wait(
            &StalledApi,
            &mut stream,
            &serde_json::json!({}),
            &ClientId::generate(),
            far_deadline(),
            &cancel,
        )
        .await
        .unwrap_err();
        assert_matches!(err, WatchError::Cancelled);
    }

    #[tokio::test]
    async fn cancellation_ends_wait() {
        let mut stream = futures::stream::pending::<Result<Message, WsError>>();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = wait_for_completion(&mut stream, "p", far_deadline(), &cancel)
            .await
            .unwrap_err();
        assert_matches!(err, WatchError::Cancelled);
    }

    #[tokio::test]
    async fn execution_error_for_our_prompt_fails_fast() {
        let mut stream = futures::stream::iter(vec![
            text(serde_json::json!({"type": "execution_error", "data": {
                "prompt_id": "other", "node_id": "1", "exception_message": "x", "exception_type": "E"
            }})),
            text(serde_json::json!({"type": "execution_error", "data": {
                "prompt_id": "p", "node_id": "540", "exception_message": "out of memory", "exception_type": "OutOfMemoryError"
            }})),
            executing(None, "p"),
        ]);

        let err = wait_for_completion(&mut stream, "p", far_deadline(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(
            err,
            WatchError::Execution { ref node, ref message, .. }
                if node == "540" && message == "OutOfMemoryError: out of memory"
        );
    }

    #[tokio::test]
    async fn close_frame_ends_stream() {
        let mut stream = futures::stream::iter(vec![Ok(Message::Close(None)), executing(None, "p")]);
        let err = wait_for_completion(&mut stream, "p", far_deadline(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, WatchError::StreamClosed { .. });
    }

    #[tokio::test]
    async fn transport_error_is_stream_error() {
        let mut stream = futures::stream::iter(vec![Err(WsError::ConnectionClosed)]);
        let err = wait_for_completion(&mut stream, "p", far_deadline(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, WatchError::Stream(_));
    }

    #[tokio::test]
    async fn missing_history_entry() {
        let api = FakeApi::new("p", serde_json::json!({}));
        let mut stream = futures::stream::iter(vec![executing(None, "p")]);

        let err = submit_and_wait(
            &api,
            &mut stream,
            &serde_json::json!({}),
            &ClientId::generate(),
            far_deadline(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_matches!(err, WatchError::HistoryMissing { prompt_id } if prompt_id == "p");
    }

    #[test]
    fn connect_failure_maps_to_unreachable() {
        let err: WatchError = ConnectFailure::Exhausted {
            attempts: 3,
            last_error: "refused".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Engine unreachable after 3 connection attempts: refused"
        );
    }
}
