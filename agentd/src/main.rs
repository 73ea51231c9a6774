//! HOSTGUARD agent daemon and operator CLI.
//!
//! `agentd serve` runs the agent. The other subcommands are operator tools
//! that either talk to a running agent over its socket (`call`) or work on
//! the files it owns (`bootstrap`, `checksum`, `verify-audit`,
//! `check-config`).
//!
//! Usage:
//!   agentd serve
//!   agentd call status
//!   agentd call reboot --token <token>
//!   agentd call self_update --args '{"version":"0.2.0","source":"/tmp/r","checksum":"…"}'
//!   agentd bootstrap --version 0.1.0 --source /tmp/release --checksum <hex>

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hostguard_agentd::{load_catalogue, open_updater, Agent, AgentConfig, Seams, DEFAULT_CONFIG_PATH};
use hostguard_audit::verify_file;
use hostguard_contracts::{release::ReleaseManifest, request::OperationRequest};
use hostguard_core::traits::PolicyEngine;
use hostguard_ipc::IpcClient;
use hostguard_release::compute_checksum;

// ── CLI definition ────────────────────────────────────────────────────────────

/// HOSTGUARD: privileged operations agent.
///
/// Exposes a fixed catalogue of host operations to unprivileged local
/// clients over a Unix socket, with two-phase confirmation for destructive
/// actions and health-checked self-update with automatic rollback.
#[derive(Parser)]
#[command(name = "agentd", version, about = "HOSTGUARD privileged operations agent")]
struct Cli {
    /// Agent configuration file.
    #[arg(long, global = true, env = "HOSTGUARD_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent until SIGINT or SIGTERM.
    Serve,
    /// Send one request to a running agent and print the result.
    Call {
        /// Catalogue operation id, e.g. `status` or `reboot`.
        operation: String,
        /// Operation arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
        /// Idempotency key. A fresh one is generated when omitted.
        #[arg(long)]
        key: Option<String>,
        /// Confirmation token from an earlier `confirmation_required` reply.
        #[arg(long)]
        token: Option<String>,
        /// Socket path; defaults to the one in the config file.
        #[arg(long)]
        socket: Option<PathBuf>,
        /// Seconds to wait for the reply.
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },
    /// Install the first release. Refused once any release is active.
    Bootstrap {
        /// Release version, e.g. `0.1.0`.
        #[arg(long = "version", value_name = "VERSION")]
        release: String,
        /// Directory holding the unpacked release.
        #[arg(long)]
        source: PathBuf,
        /// Expected SHA-256 of the release contents (hex).
        #[arg(long)]
        checksum: String,
    },
    /// Print the checksum of a release directory.
    Checksum { dir: PathBuf },
    /// Verify the audit log hash chain.
    VerifyAudit {
        /// Log file; defaults to the one in the config file.
        path: Option<PathBuf>,
    },
    /// Load and validate the configuration and catalogue.
    CheckConfig,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve => serve(&cli.config).await,
        Command::Call { operation, args, key, token, socket, timeout } => {
            call(&cli.config, operation, &args, key, token, socket, timeout).await
        }
        Command::Bootstrap { release, source, checksum } => {
            bootstrap(&cli.config, release, &source, checksum)
        }
        Command::Checksum { dir } => checksum(&dir),
        Command::VerifyAudit { path } => verify_audit(&cli.config, path),
        Command::CheckConfig => check_config(&cli.config),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("agentd: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins; otherwise `fallback`.
fn init_logging(fallback: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_target(false)
        .compact()
        .init();
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn serve(config_path: &Path) -> Result<ExitCode> {
    let config = AgentConfig::load(config_path)?;
    init_logging(&config.log_filter);
    info!(config = %config_path.display(), "starting agent");

    // Install handlers before binding so an early SIGTERM is not lost.
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let shutdown = CancellationToken::new();

    let agent = Agent::assemble(&config, Seams::system(&config)?)?;

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };
        info!(signal = name, "shutdown requested");
        trigger.cancel();
    });

    agent.run(shutdown).await?;
    Ok(ExitCode::SUCCESS)
}

async fn call(
    config_path: &Path,
    operation: String,
    args: &str,
    key: Option<String>,
    token: Option<String>,
    socket: Option<PathBuf>,
    timeout_secs: u64,
) -> Result<ExitCode> {
    init_logging("warn");

    let arguments: Value = serde_json::from_str(args).context("--args is not valid JSON")?;
    let socket = match socket {
        Some(path) => path,
        None => AgentConfig::load(config_path)?.ipc.socket_path,
    };

    let key = key.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut request = OperationRequest::new(operation, arguments, key);
    if let Some(token) = token {
        request = request.with_confirmation(token);
    }

    let mut client = IpcClient::connect(&socket)
        .await
        .with_context(|| format!("failed to connect to {}", socket.display()))?
        .with_response_timeout(Duration::from_secs(timeout_secs));
    let result = client.call(&request).await.context("request failed")?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(if result.is_ok() { ExitCode::SUCCESS } else { ExitCode::from(2) })
}

fn bootstrap(config_path: &Path, version: String, source: &Path, checksum: String) -> Result<ExitCode> {
    let config = AgentConfig::load(config_path)?;
    init_logging(&config.log_filter);

    let seams = Seams::system(&config)?;
    let updater = open_updater(&config, seams.service, seams.probe)?;
    let manifest = ReleaseManifest { version, checksum };
    let installed = updater
        .bootstrap(&manifest, source)
        .with_context(|| format!("failed to install release {}", manifest.version))?;

    println!("{}", serde_json::to_string_pretty(&installed)?);
    Ok(ExitCode::SUCCESS)
}

fn checksum(dir: &Path) -> Result<ExitCode> {
    let sum = compute_checksum(dir)
        .with_context(|| format!("failed to checksum {}", dir.display()))?;
    println!("{sum}");
    Ok(ExitCode::SUCCESS)
}

fn verify_audit(config_path: &Path, path: Option<PathBuf>) -> Result<ExitCode> {
    let path = match path {
        Some(path) => path,
        None => AgentConfig::load(config_path)?.audit.path,
    };
    let verified = verify_file(&path)
        .with_context(|| format!("audit log {} failed verification", path.display()))?;
    println!(
        "{}: {} entries, chain intact, terminal hash {}",
        path.display(),
        verified.entries,
        verified.terminal_hash
    );
    Ok(ExitCode::SUCCESS)
}

fn check_config(config_path: &Path) -> Result<ExitCode> {
    let config = AgentConfig::load(config_path)?;
    let catalogue = load_catalogue(&config.catalogue)?;
    Seams::system(&config)?;

    println!("config:    {}", config_path.display());
    println!("catalogue: {}", config.catalogue.display());
    println!("socket:    {} (mode {:o})", config.ipc.socket_path.display(), config.ipc.socket_mode);
    println!();
    println!("{:<20} {:<16} {:<10} {:<10}", "OPERATION", "HANDLER", "CONFIRM", "EXCLUSIVE");
    for op in catalogue.operations() {
        let confirmation = serde_json::to_value(op.confirmation)?;
        println!(
            "{:<20} {:<16} {:<10} {:<10}",
            op.operation_id,
            op.handler.as_str(),
            confirmation.as_str().unwrap_or_default(),
            op.exclusive
        );
    }
    Ok(ExitCode::SUCCESS)
}
