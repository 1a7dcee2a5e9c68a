use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use forgegate::backend::FsBackend;
use forgegate::config;
use forgegate::git::GitBinary;
use forgegate::ssh::{load_or_generate_host_key, SshServer};
use forgegate::AppState;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Parser, Debug)]
#[command(name = "forgegate", about = "SSH gateway for git repositories")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/forgegate/config.yaml")]
    config: String,

    /// Log output format.
    #[arg(long, value_enum, default_value = "json")]
    log_format: LogFormat,
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = Arc::new(config::load_config(&cli.config)?);

    // ---- Tracing ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    tracing::info!(config_path = %cli.config, "starting forgegate");

    // ---- Repository store ----
    let repos_path = config.repos_path();
    tokio::fs::create_dir_all(&repos_path)
        .await
        .with_context(|| format!("failed to create repository store: {}", repos_path.display()))?;
    let backend = Arc::new(FsBackend::new(&repos_path, &config.access)?);
    tracing::info!(path = %repos_path.display(), "repository store ready");

    // ---- Host key ----
    let host_key = load_or_generate_host_key(&config.host_key_path())?;

    // ---- App state ----
    let state = AppState::new(Arc::clone(&config), backend, Arc::new(GitBinary::default()));
    let server = Arc::new(SshServer::new(state, host_key));

    // ---- Serve until signalled ----
    let mut serving = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.listen_and_serve().await }
    });

    tokio::select! {
        () = shutdown_signal() => {}
        res = &mut serving => {
            // The accept loop only ends on its own when it fails to start.
            return res.context("SSH server task panicked")?;
        }
    }

    let result = server.shutdown(config.ssh.shutdown_grace()).await;
    serving
        .await
        .context("SSH server task panicked")?
        .context("SSH server exited with error")?;
    result?;

    tracing::info!("forgegate shut down cleanly");
    Ok(())
}
