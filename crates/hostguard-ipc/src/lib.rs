//! # hostguard-ipc
//!
//! The local transport between the front end and the agent: a Unix socket
//! carrying 4-byte big-endian length-prefixed JSON frames, one
//! `OperationRequest` in and one `OperationResult` out per frame.
//!
//! - [`IpcServer`] binds the socket, authenticates peers by `SO_PEERCRED`
//!   and hands requests to a [`RequestHandler`] (the dispatcher)
//! - [`IpcClient`] speaks the same framing from the other side

pub mod client;
pub mod error;
pub mod frame;
pub mod server;

pub use client::IpcClient;
pub use error::{ProtocolError, ProtocolResult, MAX_FRAME_SIZE};
pub use server::{IpcServer, IpcServerConfig, RequestHandler};
