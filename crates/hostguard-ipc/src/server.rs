//! The agent's Unix socket server.
//!
//! - The socket directory is created `0700` if absent; an existing
//!   directory's permissions are left alone. Symlinks are refused.
//! - A stale socket at the path is removed before binding; any other kind
//!   of file there is refused.
//! - Every accepted peer is checked via `SO_PEERCRED`.
//! - A semaphore caps concurrent connections. Each connection runs on its
//!   own task, and each request is dispatched on another, so a client that
//!   hangs up mid-request cannot abort a half-executed operation.

use std::{
    io,
    os::unix::fs::{FileTypeExt, PermissionsExt},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    net::{UnixListener, UnixStream},
    sync::Semaphore,
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use hostguard_contracts::{
    error::AgentError,
    request::{CallerIdentity, OperationRequest},
    result::OperationResult,
};
use hostguard_core::Dispatcher;

use crate::{
    error::{ProtocolError, ProtocolResult, MAX_FRAME_SIZE},
    frame::{decode, read_frame_timed, write_message},
};

const DIRECTORY_MODE: u32 = 0o700;

/// What the server hands decoded requests to.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, caller: CallerIdentity, request: OperationRequest) -> OperationResult;
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, caller: CallerIdentity, request: OperationRequest) -> OperationResult {
        self.dispatch(caller, request).await
    }
}

#[derive(Debug, Clone)]
pub struct IpcServerConfig {
    pub socket_path: PathBuf,
    pub socket_mode: u32,
    /// Peers allowed in addition to the agent's own uid. When both lists
    /// are empty the socket's file permissions are the only gate.
    pub allowed_uids: Vec<u32>,
    pub allowed_gids: Vec<u32>,
    pub max_connections: usize,
    pub max_frame_bytes: usize,
    pub request_read_timeout: Duration,
    pub idle_timeout: Duration,
    /// How long shutdown waits for in-flight connections.
    pub shutdown_grace: Duration,
}

impl Default for IpcServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/hostguard/agent.sock"),
            socket_mode: 0o660,
            allowed_uids: Vec::new(),
            allowed_gids: Vec::new(),
            max_connections: 32,
            max_frame_bytes: MAX_FRAME_SIZE,
            request_read_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl IpcServerConfig {
    /// Whether a peer with `uid`/`gid` may talk to an agent running as
    /// `own_uid`.
    pub fn permits(&self, own_uid: u32, uid: u32, gid: u32) -> bool {
        if uid == own_uid {
            return true;
        }
        if self.allowed_uids.is_empty() && self.allowed_gids.is_empty() {
            return true;
        }
        self.allowed_uids.contains(&uid) || self.allowed_gids.contains(&gid)
    }
}

pub struct IpcServer {
    config: Arc<IpcServerConfig>,
    listener: UnixListener,
    connections: Arc<Semaphore>,
    own_uid: u32,
}

impl IpcServer {
    /// Prepare the directory, clear a stale socket, bind and set the
    /// socket's mode. Must run inside a tokio runtime.
    pub fn bind(config: IpcServerConfig) -> ProtocolResult<Self> {
        let path = config.socket_path.clone();
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_directory(dir)?;
        }
        remove_stale_socket(&path)?;

        let listener = UnixListener::bind(&path).map_err(|e| {
            io::Error::new(e.kind(), format!("failed to bind {}: {e}", path.display()))
        })?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(config.socket_mode))
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("failed to set socket permissions on {}: {e}", path.display()),
                )
            })?;

        info!(
            path = %path.display(),
            mode = %format!("{:o}", config.socket_mode),
            max_connections = config.max_connections,
            "IPC socket bound"
        );
        Ok(Self {
            connections: Arc::new(Semaphore::new(config.max_connections.max(1))),
            config: Arc::new(config),
            listener,
            own_uid: nix::unistd::getuid().as_raw(),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Accept connections until `shutdown` fires, then wait up to the
    /// grace period for in-flight work. The socket file is removed when the
    /// server is dropped at the end.
    pub async fn serve(
        self,
        handler: Arc<dyn RequestHandler>,
        shutdown: CancellationToken,
    ) -> ProtocolResult<()> {
        let tracker = TaskTracker::new();

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.connections.clone().acquire_owned() => permit
                    .map_err(|_| io::Error::other("connection semaphore closed"))?,
            };
            let stream = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => stream,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let connection = Connection {
                config: self.config.clone(),
                handler: handler.clone(),
                tracker: tracker.clone(),
                shutdown: shutdown.clone(),
                own_uid: self.own_uid,
            };
            tracker.spawn(async move {
                connection.run(stream).await;
                drop(permit);
            });
        }

        info!("IPC server stopping");
        tracker.close();
        if timeout(self.config.shutdown_grace, tracker.wait()).await.is_err() {
            warn!(
                grace = ?self.config.shutdown_grace,
                "connections still open after the shutdown grace period"
            );
        }
        Ok(())
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.config.socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.config.socket_path.display(), error = %e, "failed to remove socket");
            }
        }
    }
}

struct Connection {
    config: Arc<IpcServerConfig>,
    handler: Arc<dyn RequestHandler>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    own_uid: u32,
}

impl Connection {
    async fn run(self, mut stream: UnixStream) {
        let caller = match stream.peer_cred() {
            Ok(cred) => CallerIdentity::new(cred.uid(), cred.gid(), cred.pid()),
            Err(e) => {
                warn!(error = %e, "cannot read peer credentials, closing");
                return;
            }
        };

        if !self.config.permits(self.own_uid, caller.uid, caller.gid) {
            warn!(uid = caller.uid, gid = caller.gid, pid = ?caller.pid, "peer not permitted");
            let err = AgentError::Authorization {
                detail: format!("uid {} / gid {} may not use this socket", caller.uid, caller.gid),
            };
            self.reply(&mut stream, &OperationResult::from_error(&err)).await;
            return;
        }
        debug!(uid = caller.uid, gid = caller.gid, pid = ?caller.pid, "connection accepted");

        loop {
            let read = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                read = read_frame_timed(
                    &mut stream,
                    self.config.max_frame_bytes,
                    self.config.idle_timeout,
                    self.config.request_read_timeout,
                ) => read,
            };

            let decoded = read.and_then(|body| body.map(|b| decode::<OperationRequest>(&b)).transpose());
            let request = match decoded {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(ProtocolError::Idle(after)) => {
                    debug!(uid = caller.uid, idle = ?after, "idle connection closed");
                    break;
                }
                Err(e) if e.is_peer_fault() => {
                    warn!(uid = caller.uid, error = %e, "protocol error, closing connection");
                    self.reply(&mut stream, &OperationResult::from_error(&AgentError::from(e))).await;
                    break;
                }
                Err(e) => {
                    debug!(uid = caller.uid, error = %e, "connection lost");
                    break;
                }
            };

            let handler = self.handler.clone();
            let request_caller = caller;
            let task = self
                .tracker
                .spawn(async move { handler.handle(request_caller, request).await });
            let result = match task.await {
                Ok(result) => result,
                Err(e) => OperationResult::from_error(&AgentError::execution(format!(
                    "request task failed: {e}"
                ))),
            };

            if !self.reply(&mut stream, &result).await {
                break;
            }
        }
    }

    /// Best-effort write; `false` when the peer is gone.
    async fn reply(&self, stream: &mut UnixStream, result: &OperationResult) -> bool {
        match write_message(stream, result, self.config.max_frame_bytes).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "cannot write response");
                false
            }
        }
    }
}

fn ensure_directory(path: &Path) -> ProtocolResult<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is a symlink, refusing to use it as socket directory", path.display()),
        )
        .into()),
        Ok(meta) if !meta.is_dir() => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists but is not a directory", path.display()),
        )
        .into()),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            std::fs::create_dir_all(path).map_err(|e| {
                io::Error::new(e.kind(), format!("failed to create {}: {e}", path.display()))
            })?;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(DIRECTORY_MODE))?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn remove_stale_socket(path: &Path) -> ProtocolResult<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            std::fs::remove_file(path)?;
            debug!(path = %path.display(), "removed stale socket");
            Ok(())
        }
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists but is not a socket", path.display()),
        )
        .into()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
