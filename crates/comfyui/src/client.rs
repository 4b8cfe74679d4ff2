//! WebSocket client for a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the connection configuration. Call
//! [`ComfyUIClient::connect`] with a [`ClientId`] to open a live
//! [`ComfyUIConnection`]; ComfyUI addresses events for submissions made
//! under that client ID to this socket.

use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// The raw stream type produced by [`ComfyUIClient::connect`].
pub type EngineStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Identity under which a request submits and listens.
///
/// One is generated per request and threaded through submission and the
/// event stream, so concurrent requests never see each other's events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    /// Fresh random identity (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ClientId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Host and port of an engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineAddress {
    pub host: String,
    pub port: u16,
}

impl EngineAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// HTTP base URL, e.g. `http://127.0.0.1:8188`.
    pub fn http_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// WebSocket base URL, e.g. `ws://127.0.0.1:8188`.
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// Configuration handle for the event-stream endpoint of one instance.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
}

/// Open event stream for one client ID.
pub struct ComfyUIConnection {
    pub client_id: ClientId,
    pub ws_stream: EngineStream,
}

impl ComfyUIClient {
    /// * `ws_url` - WebSocket base URL, e.g. `ws://host:8188`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }

    pub fn for_address(address: &EngineAddress) -> Self {
        Self::new(address.ws_url())
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Connect to the event-stream endpoint as `client_id`.
    pub async fn connect(&self, client_id: &ClientId) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let endpoint = format!("{}/ws?clientId={client_id}", self.ws_url);

        let (ws_stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| ComfyUIClientError::Connection(format!("{}: {e}", self.ws_url)))?;

        tracing::info!(client_id = %client_id, url = %self.ws_url, "Event stream connected");

        Ok(ComfyUIConnection {
            client_id: client_id.clone(),
            ws_stream,
        })
    }
}

impl ComfyUIConnection {
    /// Send a close frame and drop the socket.
    ///
    /// Errors are logged only; the connection is gone either way.
    pub async fn close(mut self) {
        if let Err(e) = self.ws_stream.close(None).await {
            tracing::debug!(client_id = %self.client_id, error = %e, "WebSocket close failed");
        } else {
            tracing::debug!(client_id = %self.client_id, "WebSocket closed");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// The WebSocket handshake with the engine failed.
    #[error("Event stream connect failed: {0}")]
    Connection(String),
}
