//! Client side of the socket protocol, used by the front end and by
//! `agentd call`.

use std::{path::Path, time::Duration};

use tokio::{net::UnixStream, time::timeout};

use hostguard_contracts::{request::OperationRequest, result::OperationResult};

use crate::{
    error::{ProtocolError, ProtocolResult, MAX_FRAME_SIZE},
    frame::{decode, read_frame, write_message},
};

/// One connection to the agent. Requests on a connection are answered in
/// order.
#[derive(Debug)]
pub struct IpcClient {
    stream: UnixStream,
    max_frame_bytes: usize,
    response_timeout: Option<Duration>,
}

impl IpcClient {
    pub async fn connect(path: impl AsRef<Path>) -> ProtocolResult<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).await.map_err(|e| {
            std::io::Error::new(e.kind(), format!("cannot connect to {}: {e}", path.display()))
        })?;
        Ok(Self { stream, max_frame_bytes: MAX_FRAME_SIZE, response_timeout: None })
    }

    /// Give up on a response after `limit`. Two-phase operations answer as
    /// soon as they are scheduled, but `self_update` waits for its health
    /// check, so leave room for that.
    pub fn with_response_timeout(mut self, limit: Duration) -> Self {
        self.response_timeout = Some(limit);
        self
    }

    pub async fn call(&mut self, request: &OperationRequest) -> ProtocolResult<OperationResult> {
        write_message(&mut self.stream, request, self.max_frame_bytes).await?;

        let read = read_frame(&mut self.stream, self.max_frame_bytes);
        let body = match self.response_timeout {
            Some(limit) => timeout(limit, read).await.map_err(|_| ProtocolError::Timeout(limit))??,
            None => read.await?,
        };
        match body {
            Some(body) => decode(&body),
            None => Err(ProtocolError::Closed),
        }
    }
}
