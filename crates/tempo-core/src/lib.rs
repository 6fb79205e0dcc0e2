//! Core load-generation engine.
//!
//! This crate owns the hard engineering described in the system spec: the
//! per-run supervisor, the paced virtual users, the ramp scheduler, the
//! error-rate circuit breaker, the metrics aggregator, the SSRF-aware host
//! validator, the admission controller, and the durable sample store.
//!
//! Everything outside that boundary — HTTP routing, JSON framing at the
//! edge, static assets, PDF rendering, a UI — is a narrow collaborator
//! consumed through the types in [`control`] and built by a thin adapter
//! such as the `tempo-server` binary.
pub mod admission;
pub mod control;
pub mod engine;
pub mod error;
pub mod host;
pub mod http;
pub mod model;
pub mod registry;
pub mod results;
pub mod store;

pub use error::TempoError;
