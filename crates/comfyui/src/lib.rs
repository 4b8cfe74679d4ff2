//! ComfyUI WebSocket and REST client library.
//!
//! Submits bound graphs over HTTP, watches the per-client WebSocket
//! event stream until the submission finishes, and pulls the produced
//! artifact out of the history record.

pub mod api;
pub mod client;
pub mod history;
pub mod messages;
pub mod reconnect;
pub mod resolver;
pub mod watcher;
