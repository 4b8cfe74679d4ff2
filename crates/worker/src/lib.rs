//! `vidgen-worker` library crate.
//!
//! Re-exports internal modules for integration testing. The binary
//! entrypoint lives in `main.rs`.

pub mod config;
pub mod handler;
pub mod media;
pub mod publish;
