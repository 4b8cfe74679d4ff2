//! Bounded, fixed-delay connection establishment.
//!
//! The engine is often still starting when the first request arrives, so
//! the watcher keeps retrying the event-stream handshake for a while
//! before giving up. Each attempt is followed by a fixed pause; the loop
//! ends after [`RetryPolicy::attempts`] failures or when the
//! [`CancellationToken`] fires.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{ClientId, ComfyUIClient, ComfyUIConnection};

/// Retry parameters for establishing the event-stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total connection attempts before giving up (at least one is made).
    pub attempts: u32,
    /// Pause between consecutive attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 180,
            delay: Duration::from_secs(1),
        }
    }
}

/// Why [`connect_with_retry`] gave up.
#[derive(Debug)]
pub enum ConnectFailure {
    /// Every attempt failed; carries the count and the last error text.
    Exhausted { attempts: u32, last_error: String },
    /// The cancellation token fired first.
    Cancelled,
}

/// Connect as `client_id`, retrying with a fixed delay.
pub async fn connect_with_retry(
    client: &ComfyUIClient,
    client_id: &ClientId,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<ComfyUIConnection, ConnectFailure> {
    let attempts = policy.attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(client_id = %client_id, "Connect cancelled");
                return Err(ConnectFailure::Cancelled);
            }
            result = client.connect(client_id) => {
                match result {
                    Ok(conn) => {
                        if attempt > 1 {
                            tracing::info!(client_id = %client_id, attempt, "Engine reachable after retry");
                        }
                        return Ok(conn);
                    }
                    Err(e) => {
                        tracing::warn!(
                            client_id = %client_id,
                            attempt,
                            max_attempts = attempts,
                            error = %e,
                            "Connect attempt failed",
                        );
                        last_error = e.to_string();
                    }
                }
            }
        }

        if attempt == attempts {
            break;
        }

        // Wait before the next attempt, respecting cancellation.
        tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectFailure::Cancelled),
            _ = tokio::time::sleep(policy.delay) => {}
        }
    }

    Err(ConnectFailure::Exhausted {
        attempts,
        last_error,
    })
}
