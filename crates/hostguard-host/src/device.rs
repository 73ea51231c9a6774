//! sysfs-style device attributes under a fixed root.
//!
//! Device names are relative paths such as `gpio17/value`. Only plain
//! components are accepted, so a name can never leave the root.

use std::path::{Component, Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::info;

use hostguard_contracts::error::{AgentError, AgentResult, ValidationCode};

/// Longest value accepted for a write.
pub const MAX_DEVICE_VALUE: usize = 4096;

pub fn resolve_device(root: &Path, device: &str) -> AgentResult<PathBuf> {
    let relative = Path::new(device);
    let plain = !device.is_empty()
        && relative.components().all(|c| matches!(c, Component::Normal(_)));
    if !plain {
        return Err(AgentError::validation(
            ValidationCode::BadArguments,
            format!("device '{device}' must be a relative path without '.' or '..'"),
        ));
    }
    Ok(root.join(relative))
}

pub async fn read_device(root: &Path, device: &str) -> AgentResult<String> {
    let path = resolve_device(root, device)?;
    let raw = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| AgentError::execution(format!("cannot read device '{device}': {e}")))?;
    Ok(raw.trim_end().to_string())
}

pub async fn write_device(root: &Path, device: &str, value: &str) -> AgentResult<()> {
    if value.len() > MAX_DEVICE_VALUE {
        return Err(AgentError::validation(
            ValidationCode::BadArguments,
            format!("value for '{device}' exceeds {MAX_DEVICE_VALUE} bytes"),
        ));
    }
    let path = resolve_device(root, device)?;
    // sysfs attributes exist already; never create files under the root.
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(&path)
        .await
        .map_err(|e| AgentError::execution(format!("cannot open device '{device}': {e}")))?;
    let written = match file.write_all(value.as_bytes()).await {
        Ok(()) => file.flush().await,
        Err(e) => Err(e),
    };
    written.map_err(|e| AgentError::execution(format!("cannot write device '{device}': {e}")))?;

    info!(device = %device, "device attribute written");
    Ok(())
}
