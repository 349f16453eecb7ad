//! mcp-fleet launcher.
//!
//! Loads server definitions from a YAML file and/or environment variables,
//! registers them with a [`ServerRegistry`], connects every enabled server,
//! and keeps the fleet up until interrupted. Ctrl-C triggers an orderly
//! shutdown.
//!
//! Exit codes: 0 on clean shutdown, 1 on configuration error or unhandled
//! runtime error.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mcp_fleet::audit::FileAuditStorage;
use mcp_fleet::{AuditLogger, ConfigLoader, InMemoryAuditStorage, ServerRegistry};

/// Host-side MCP client runtime.
///
/// Manages a fleet of MCP server subprocesses and exposes their tools as
/// one logical catalog.
#[derive(Parser, Debug)]
#[command(name = "mcp-fleet")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML server configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<std::path::PathBuf>,

    /// Prefix for environment-variable server discovery
    #[arg(long, default_value = "MCP_")]
    env_prefix: String,

    /// Append audit events to this JSON-Lines file instead of keeping
    /// them in memory
    #[arg(long, value_name = "FILE")]
    audit_log: Option<std::path::PathBuf>,

    /// Maximum reconnection attempts per server
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Initial reconnection backoff in seconds (doubled per attempt)
    #[arg(long, default_value_t = 1)]
    retry_delay: u64,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting mcp-fleet");

    let loader = ConfigLoader::new(&args.env_prefix);
    let mut definitions = Vec::new();
    if let Some(path) = &args.config {
        definitions.extend(loader.load_from_file(path, false)?);
    }
    definitions.extend(loader.load_from_env());

    if definitions.is_empty() {
        anyhow::bail!(
            "no server definitions found; pass --config or set {}SERVER_* variables",
            args.env_prefix
        );
    }

    let audit = match &args.audit_log {
        Some(path) => AuditLogger::new(Arc::new(FileAuditStorage::new(path))),
        None => AuditLogger::new(Arc::new(InMemoryAuditStorage::default())),
    };

    let registry = ServerRegistry::new(args.max_retries, Duration::from_secs(args.retry_delay))
        .with_audit(audit);

    for definition in &definitions {
        if !registry.register(definition.to_registered_server(), false).await {
            warn!(server = %definition.name, "registration failed");
        }
    }

    let results = registry.connect_all().await;
    let connected = results.values().filter(|ok| **ok).count();
    info!(
        connected,
        registered = results.len(),
        "fleet startup complete"
    );
    for (name, ok) in &results {
        if !ok {
            if let Some(server) = registry.get_server(name) {
                if server.enabled {
                    warn!(server = %name, error = ?server.last_error, "server failed to connect");
                }
            }
        }
    }

    info!("running; press Ctrl-C to shut down");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    registry.shutdown().await;
    Ok(())
}
