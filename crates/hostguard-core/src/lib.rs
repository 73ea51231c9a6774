//! # hostguard-core
//!
//! The request runtime of the HOSTGUARD privileged agent.
//!
//! This crate provides:
//! - The seam traits (`PolicyEngine`, `ArgumentVerifier`, `AuditWriter`,
//!   `HostActions`, `UpdateService`, `ServiceControl`, `HealthProbe`)
//! - The `Dispatcher` that drives every request through validation,
//!   idempotency, guardrails, execution and audit in that order
//! - The guardrail pieces it relies on: the exclusive lock, the per-class
//!   confirmation state machine, the idempotency cache and rate limiting
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hostguard_core::{Dispatcher, DispatcherConfig, Handlers};
//! ```

pub mod dispatcher;
pub mod exclusive;
pub mod guardrail;
pub mod idempotency;
pub mod rate_limit;
pub mod traits;

pub use dispatcher::{Dispatcher, DispatcherConfig, Handlers};
pub use guardrail::GuardrailConfig;
