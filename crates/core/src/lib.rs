//! Domain layer for the video generation worker.
//!
//! Holds the engine variants, graph templates and their on-disk store,
//! declarative binding descriptors, the parameter binder, and the
//! request schema. Nothing in this crate talks to the network.

pub mod binding;
pub mod error;
pub mod request;
pub mod template;
pub mod variant;
