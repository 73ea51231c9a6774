//! # hostguard-agentd
//!
//! Assembly of the HOSTGUARD agent: configuration loading and the wiring
//! that turns a config file into a bound, serving agent. The `agentd`
//! binary is a thin CLI over this crate.

pub mod agent;
pub mod config;

pub use agent::{load_catalogue, open_updater, Agent, Seams};
pub use config::{AgentConfig, DEFAULT_CONFIG_PATH};
