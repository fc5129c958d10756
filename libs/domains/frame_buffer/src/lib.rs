//! Frame Buffer Orchestrator: a persistent, at-least-once, per-processor
//! routing layer over a log-structured stream store, with backpressure,
//! circuit breaking, priority-aware queuing, and processor lifecycle
//! management.
//!
//! Module layout mirrors the component table: [`stream_store`] is the
//! store adapter (C1), [`registry`] the processor registry (C2),
//! [`priority_queue`] the overflow buffer (C3), [`breaker`] the circuit
//! breaker manager (C4), [`backpressure`] the backpressure controller
//! (C5), [`router`] the orchestrator core (C6), and [`client`] the
//! processor client library (C7). [`monitor`] holds the two background
//! sweeps (registry liveness, backpressure sampling) that keep C2 and C5
//! current without the router's read loop having to drive them.

pub mod backpressure;
pub mod breaker;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod model;
pub mod monitor;
pub mod priority_queue;
pub mod registry;
pub mod router;
pub mod stream_store;

pub use client::{ProcessFrameFn, ProcessResult, ProcessorClient};
pub use config::{
    BackpressureConfig, CircuitBreakerManagerConfig, OrchestratorConfig, PriorityQueueConfig,
    ProcessorClientConfig, RegistryConfig,
};
pub use error::{ErrorCategory, OrchestratorError, OrchestratorResult, RetryStrategy};
pub use health::HealthState;
pub use model::{FrameRef, HealthStatus, OrchestratorState, PressureLevel, ProcessorRegistration};
pub use router::Router;
pub use stream_store::{RedisStreamStore, StreamStore};
