//! # Taskgate Core
//!
//! Task execution engine built on the `taskgate-common` primitives.
//!
//! This crate contains:
//! - The task model and per-task options
//! - The [`TaskHandler`] port the engine drives
//! - Observer hooks and the optional [`TaskStore`] persistence port
//! - The [`Engine`] orchestrator and caller-facing [`TaskHandle`]
//!
//! ## Pipeline
//! queue → concurrency permit → rate-limit token → circuit-guarded retries.
//! See [`engine`] for the full contract.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod hooks;
pub mod store;
pub mod task;

pub use config::{ConcurrencyConfig, EngineConfig, EngineConfigError};
pub use engine::{Engine, EngineBuilder, EngineMetrics, TaskCanceller, TaskHandle};
pub use error::{EngineError, EngineResult};
pub use handler::{FnHandler, TaskHandler};
pub use hooks::{EngineObserver, NoOpObserver, OutcomeKind, TracingObserver};
pub use store::{InMemoryTaskStore, StoredTask, TaskRecord, TaskStore};
pub use task::{TaskContext, TaskId, TaskOptions};

// Types callers need to configure tasks and read errors
pub use taskgate_common::collections::{BackpressurePolicy, Priority};
pub use taskgate_common::resilience::{
    policies, AttemptRecord, CircuitState, HalfOpenPolicy, RetryDecision, RetryPolicy, TaskError,
};
