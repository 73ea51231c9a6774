//! # hostguard-contracts
//!
//! Shared types, wire contracts, and the error taxonomy for the HOSTGUARD
//! privileged operations agent.
//!
//! All crates in the workspace import from here. No business logic lives in
//! this crate, only data definitions and error types.

pub mod audit;
pub mod error;
pub mod guardrail;
pub mod policy;
pub mod release;
pub mod request;
pub mod result;
pub mod verify;
