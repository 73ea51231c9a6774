//! Transport errors.

use std::{io, time::Duration};

use thiserror::Error;

use hostguard_contracts::error::AgentError;

/// Largest frame body either side accepts (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Size of the big-endian length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The length prefix announced more than the limit. Detected before
    /// any body allocation.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    /// The peer went away in the middle of a frame.
    #[error("connection closed mid-frame")]
    Truncated,

    #[error("connection closed by peer")]
    Closed,

    /// No new request arrived within the idle timeout.
    #[error("connection idle for {0:?}")]
    Idle(Duration),

    /// A frame was started but not finished in time.
    #[error("timed out after {0:?} reading a frame")]
    Timeout(Duration),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        ProtocolError::InvalidFrame { reason: reason.into() }
    }

    /// Errors caused by what the peer sent (or failed to finish sending)
    /// while the connection itself still works. These get an error reply.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            ProtocolError::FrameTooLarge { .. }
                | ProtocolError::InvalidFrame { .. }
                | ProtocolError::Serialization(_)
                | ProtocolError::Timeout(_)
        )
    }
}

impl From<ProtocolError> for AgentError {
    fn from(err: ProtocolError) -> Self {
        AgentError::IpcProtocol { detail: err.to_string() }
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
