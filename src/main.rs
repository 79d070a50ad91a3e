use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use tollgate::{config, http, ssh, Gateway};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "tollgate", about = "Worker Registration Gateway")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/tollgate/config.yaml")]
    config: String,
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
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<Gateway>, shutdown: CancellationToken) -> Result<()> {
    let app = http::create_router(Arc::clone(&state));

    let listen_addr: std::net::SocketAddr = state
        .config
        .http
        .listen_addr
        .parse()
        .context("invalid http listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let config = Arc::new(config::load_config(&cli.config)?);
    tracing::info!(config_path = %cli.config, "starting tollgate");

    // ---- Gateway state ----
    let state = Arc::new(Gateway::new(Arc::clone(&config))?);
    tracing::info!(
        authorized_keys = state.authorized_keys.len(),
        forward_host = %config.forward_host,
        "gateway state assembled"
    );

    // ---- SSH server ----
    let host_key = ssh::load_host_key(&config.ssh.host_key_path)?;
    let ssh_server = ssh::Server::bind(Arc::clone(&state), host_key).await?;

    // ---- Shutdown plumbing ----
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    // ---- Spawn services ----
    let http_handle = tokio::spawn({
        let state = Arc::clone(&state);
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = run_http_server(state, shutdown).await {
                tracing::error!(error = %e, "HTTP server failed");
            }
        }
    });

    let ssh_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = ssh_server.run(shutdown.clone()).await {
                tracing::error!(error = %e, "SSH server failed");
                // An accept failure is fatal; take the rest of the process
                // down with it.
                shutdown.cancel();
            }
        }
    });

    let _ = tokio::try_join!(http_handle, ssh_handle);

    tracing::info!("tollgate shut down cleanly");
    Ok(())
}
