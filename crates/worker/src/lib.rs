//! Queue workers, run dispatch and the caller-facing execution service.
//!
//! The binary in `main.rs` wires a [`worker_pool::WorkerPool`] and a
//! [`reaper::StaleClaimReaper`] to Postgres and the configured artifact
//! backend. Embedders that expose execution over their own transport use
//! [`service::ExecutionService`].

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod reaper;
pub mod service;
pub mod worker_pool;
