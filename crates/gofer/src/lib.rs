//! Core library for the Gofer job orchestrator.
//!
//! Gofer executes pipelines (DAGs of containerized tasks) as runs, either on
//! demand or in response to events emitted by long-running extension
//! containers. This crate holds everything except the HTTP surface: storage,
//! the event bus, object and secret stores, the container scheduler
//! abstraction, the extension registry, the pipeline service, and the run
//! engine. The `gofer-server` crate wires these together behind axum.

pub mod auth;
pub mod conf;
pub mod events;
pub mod extensions;
pub mod object_store;
pub mod pipelines;
pub mod run_engine;
pub mod runs;
pub mod scheduler;
pub mod secret_store;
pub mod storage;
pub mod variables;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as epoch milliseconds. All persisted timestamps use this.
pub fn epoch_milli() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
