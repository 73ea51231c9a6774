//! Bounded external command execution.

use std::{process::Stdio, time::Duration};

use tokio::{process::Command, time::timeout};
use tracing::debug;

use hostguard_contracts::error::{AgentError, AgentResult};

/// Run `argv` to completion within `limit`. A non-zero exit is an
/// execution error carrying stderr. The child is killed if the limit
/// expires.
pub async fn run_command(argv: &[String], envs: &[(&str, &str)], limit: Duration) -> AgentResult<String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| AgentError::Config { reason: "empty command".to_string() })?;

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(envs.iter().copied())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(program = %program, ?args, "running command");
    let output = timeout(limit, command.output())
        .await
        .map_err(|_| AgentError::execution(format!("'{program}' timed out after {limit:?}")))?
        .map_err(|e| AgentError::execution(format!("cannot run '{program}': {e}")))?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(AgentError::execution(format!(
        "'{program}' exited with {}: {}",
        output.status,
        stderr.trim()
    )))
}
