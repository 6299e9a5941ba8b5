//! QueryLab - throwaway PostgreSQL sandboxes per browser session.
//!
//! Usage:
//!   querylab serve [--port 8080] [--admin-user ...]   # Start HTTP server
//!   querylab purge                                     # Drop leftover sandboxes

mod config;
mod connection;
mod error;
mod http_server;
mod identity;
mod provisioner;
mod query;
mod registry;
mod state;
mod sweeper;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{ManagerConfig, ServeArgs};
use crate::provisioner::{PgProvisioner, Provisioner};
use crate::query::TenantQueries;
use crate::registry::SandboxRegistry;
use crate::state::AppState;

#[derive(Parser)]
#[command(name = "querylab")]
#[command(about = "Per-session PostgreSQL sandboxes with an HTTP API")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Log output format
    #[arg(long, global = true, env = "LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
    /// Drop every sandbox database on the server and exit
    Purge(ServeArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Read before parsing so `.env` entries act as clap env fallbacks.
    let env_file = config::load_env_file();
    let args = Args::parse();
    init_tracing(args.log_format);
    match env_file {
        Ok(Some(path)) => debug!(path = %path.display(), "loaded environment file"),
        Ok(None) => debug!("no .env file found, using environment variables"),
        Err(e) => warn!(error = %e, "ignoring unreadable .env file"),
    }

    match args.command {
        Commands::Serve(serve) => serve_http(serve).await,
        Commands::Purge(serve) => purge(serve).await,
    }
}

async fn serve_http(args: ServeArgs) -> anyhow::Result<()> {
    let config = ManagerConfig::try_from(&args).context("invalid configuration")?;
    info!(
        host = %config.host,
        port = config.port,
        base_db = %config.base_db,
        timeout_secs = config.session_timeout.as_secs(),
        "initializing sandbox manager"
    );

    let provisioner: Arc<dyn Provisioner> = Arc::new(PgProvisioner::new(&config));
    let registry = SandboxRegistry::start(provisioner, config.session_timeout, config.sweep_interval);
    let state = AppState::new(registry.clone(), TenantQueries::new(&config));
    let app = http_server::router(state, &args.frontend_dir);

    http_server::run_server(args.port, app, shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("shutdown signal received, cleaning up");
    registry.shutdown(args.drop_on_shutdown).await;
    info!("server shutdown complete");
    Ok(())
}

async fn purge(args: ServeArgs) -> anyhow::Result<()> {
    let config = ManagerConfig::try_from(&args).context("invalid configuration")?;
    let provisioner = PgProvisioner::new(&config);
    let leftovers = provisioner
        .list_sandbox_databases()
        .await
        .context("listing sandbox databases")?;
    info!(count = leftovers.len(), "dropping sandbox databases");
    for database in &leftovers {
        provisioner
            .drop_database(database)
            .await
            .with_context(|| format!("dropping {}", database))?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
