//! Shared fixtures for worker integration tests: a fake engine made of a
//! `wiremock` REST server plus a one-shot `tokio-tungstenite` event stream.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use vidgen_comfyui::api::ComfyUIApi;
use vidgen_comfyui::client::ComfyUIClient;
use vidgen_comfyui::reconnect::RetryPolicy;
use vidgen_comfyui::watcher::CompletionWatcher;
use vidgen_core::template::TemplateStore;
use vidgen_worker::config::{PublishMode, WorkerConfig};
use vidgen_worker::handler::Handler;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub fn workflows_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../workflows")
}

/// Directories a test worker reads from and writes to.
pub struct Dirs {
    pub engine_output: tempfile::TempDir,
    pub shared_output: tempfile::TempDir,
    pub scratch: tempfile::TempDir,
}

impl Dirs {
    pub fn new() -> Self {
        Self {
            engine_output: tempfile::tempdir().unwrap(),
            shared_output: tempfile::tempdir().unwrap(),
            scratch: tempfile::tempdir().unwrap(),
        }
    }

    pub fn config(&self, mode: PublishMode) -> WorkerConfig {
        WorkerConfig {
            template_dir: workflows_dir(),
            engine_output_dir: self.engine_output.path().to_path_buf(),
            output_dir: self.shared_output.path().to_path_buf(),
            publish_mode: mode,
            scratch_dir: self.scratch.path().to_path_buf(),
            completion_timeout: Duration::from_secs(10),
            connect_retry: RetryPolicy {
                attempts: 2,
                delay: Duration::from_millis(10),
            },
            ..WorkerConfig::default()
        }
    }
}

/// A fake engine: REST on `http`, events on `ws_url`.
pub struct FakeEngine {
    pub http: MockServer,
    pub ws_url: String,
    /// Resolves with `true` once the worker closes the event stream.
    pub closed_by_client: oneshot::Receiver<bool>,
}

impl FakeEngine {
    /// Engine that accepts one prompt as `prompt_id`, reports it finished,
    /// and answers history with `outputs`.
    pub async fn start(prompt_id: &str, outputs: serde_json::Value) -> Self {
        let http = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "prompt_id": prompt_id,
                "number": 1,
                "node_errors": {},
            })))
            .mount(&http)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/history/{prompt_id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                prompt_id: {"outputs": outputs, "status": {"status_str": "success"}},
            })))
            .mount(&http)
            .await;

        let frames = vec![
            serde_json::json!({"type": "execution_start", "data": {"prompt_id": prompt_id}}),
            serde_json::json!({"type": "executing", "data": {"node": "540", "prompt_id": prompt_id}}),
            serde_json::json!({"type": "executing", "data": {"node": null, "prompt_id": prompt_id}}),
        ];
        let (ws_url, closed_by_client) = spawn_event_stream(frames).await;

        Self {
            http,
            ws_url,
            closed_by_client,
        }
    }

    pub fn handler(&self, config: &WorkerConfig) -> Handler {
        let http = reqwest::Client::new();
        let watcher = CompletionWatcher::new(
            ComfyUIApi::with_client(http.clone(), self.http.uri()),
            ComfyUIClient::new(self.ws_url.clone()),
            config.connect_retry,
        );
        let templates = Arc::new(TemplateStore::new(&config.template_dir));
        Handler::with_watcher(config, templates, watcher, http)
    }

    /// Graphs submitted to `/prompt`, in order.
    pub async fn submitted_graphs(&self) -> Vec<serde_json::Value> {
        self.http
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|req| req.url.path() == "/prompt")
            .map(|req| {
                let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
                body["prompt"].clone()
            })
            .collect()
    }
}

/// Accept one WebSocket client, send `frames`, and report whether the
/// client sent a close frame before hanging up.
async fn spawn_event_stream(frames: Vec<serde_json::Value>) -> (String, oneshot::Receiver<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_url = format!("ws://{}", listener.local_addr().unwrap());
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let Ok((tcp, _)) = listener.accept().await else {
            return;
        };
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        for frame in frames {
            ws.send(Message::text(frame.to_string())).await.unwrap();
        }

        let mut closed = false;
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Close(_)) => {
                    closed = true;
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        let _ = tx.send(closed);
    });

    (ws_url, rx)
}
