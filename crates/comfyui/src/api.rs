//! Engine REST endpoints.
//!
//! A generation needs two calls: `POST /prompt` to queue a bound graph and
//! `GET /history/{prompt_id}` to read what it produced. The watcher is
//! written against [`EngineApi`] rather than [`ComfyUIApi`] so tests can
//! plug in a fake engine.

use serde::de::DeserializeOwned;
use serde::Deserialize;

/// REST client bound to one engine instance.
#[derive(Clone)]
pub struct ComfyUIApi {
    http: reqwest::Client,
    api_url: String,
}

/// Answer to `POST /prompt`.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
    /// Queue position at the time of submission.
    #[serde(default)]
    pub number: i64,
    /// Node validation problems the engine accepted anyway.
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// Transport failure: connect, DNS, TLS, or an undecodable body.
    #[error("Engine request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The engine answered with a non-2xx status.
    #[error("Engine rejected request ({status}): {body}")]
    ApiError { status: u16, body: String },
}

/// Engine operations the completion watcher depends on.
#[async_trait::async_trait]
pub trait EngineApi: Send + Sync {
    /// Queue a graph for execution on behalf of `client_id`.
    ///
    /// Every call creates a new submission; nothing is deduplicated and
    /// nothing is retried here.
    async fn submit_prompt(
        &self,
        graph: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError>;

    /// Fetch the raw history document for a prompt.
    async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError>;
}

impl ComfyUIApi {
    /// `api_url` is the engine's base URL, e.g. `http://127.0.0.1:8188`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Same as [`new`](Self::new), sharing the pool of `http`.
    pub fn with_client(http: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.api_url.trim_end_matches('/'))
    }

    /// Decode a 2xx JSON body; anything else becomes
    /// [`ComfyUIApiError::ApiError`] with the body text attached.
    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ComfyUIApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body = match response.text().await {
            Ok(text) => text,
            Err(e) => format!("<body unavailable: {e}>"),
        };
        Err(ComfyUIApiError::ApiError {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait::async_trait]
impl EngineApi for ComfyUIApi {
    async fn submit_prompt(
        &self,
        graph: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let response = self
            .http
            .post(self.endpoint("prompt"))
            .json(&serde_json::json!({ "prompt": graph, "client_id": client_id }))
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .http
            .get(self.endpoint(&format!("history/{prompt_id}")))
            .send()
            .await?;
        Self::decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn submit_posts_prompt_and_client_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .and(body_partial_json(serde_json::json!({
                "client_id": "client-1",
                "prompt": {"1": {"class_type": "LoadImage"}},
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "prompt_id": "abc-123",
                "number": 4,
                "node_errors": {},
            })))
            .expect(1)
            .mount(&server)
            .await;

        let api = ComfyUIApi::new(server.uri());
        let graph = serde_json::json!({"1": {"class_type": "LoadImage", "inputs": {}}});
        let response = api.submit_prompt(&graph, "client-1").await.unwrap();

        assert_eq!(response.prompt_id, "abc-123");
        assert_eq!(response.number, 4);
    }

    #[tokio::test]
    async fn submit_rejection_carries_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid prompt"}"#),
            )
            .mount(&server)
            .await;

        let api = ComfyUIApi::new(server.uri());
        let err = api
            .submit_prompt(&serde_json::json!({}), "client-1")
            .await
            .unwrap_err();

        assert_matches!(
            err,
            ComfyUIApiError::ApiError { status: 400, ref body } if body.contains("invalid prompt")
        );
    }

    #[tokio::test]
    async fn history_is_fetched_by_prompt_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history/abc-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "abc-123": {"outputs": {}},
            })))
            .mount(&server)
            .await;

        let api = ComfyUIApi::new(server.uri());
        let history = api.get_history("abc-123").await.unwrap();
        assert!(history["abc-123"]["outputs"].is_object());
    }

    #[tokio::test]
    async fn unreachable_engine_is_request_error() {
        let api = ComfyUIApi::new("http://127.0.0.1:1");
        let err = api.get_history("x").await.unwrap_err();
        assert_matches!(err, ComfyUIApiError::Request(_));
    }
}
