//! SSH server bootstrap: the accept loop and per-connection supervision.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server;
use russh::MethodSet;
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::process::ProcessSet;
use crate::ssh::session::WorkerSession;
use crate::Gateway;

/// Load the host key from disk (OpenSSH format).
pub fn load_host_key(path: &str) -> Result<KeyPair> {
    russh_keys::load_secret_key(path, None)
        .with_context(|| format!("failed to load host key from {path}"))
}

/// The gateway's SSH listener.  Binding is split from serving so callers
/// (and tests) can learn the bound address before connections flow.
pub struct Server {
    state: Arc<Gateway>,
    config: Arc<server::Config>,
    listener: TcpListener,
}

impl Server {
    pub async fn bind(state: Arc<Gateway>, host_key: KeyPair) -> Result<Self> {
        let config = Arc::new(server::Config {
            keys: vec![host_key],
            methods: MethodSet::PUBLICKEY,
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            ..Default::default()
        });

        let listen_addr = &state.config.ssh.listen_addr;
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("failed to bind SSH listener on {listen_addr}"))?;

        info!(address = %listener.local_addr()?, "SSH server listening");
        state.ssh_listener_up.store(true, Ordering::SeqCst);

        Ok(Self {
            state,
            config,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to read SSH listener address")
    }

    /// Accept connections until shut down.  Handshake and session failures
    /// are logged and the loop continues; only an accept failure is fatal.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("SSH server shutting down");
                    self.state.ssh_listener_up.store(false, Ordering::SeqCst);
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            self.state.ssh_listener_up.store(false, Ordering::SeqCst);
                            return Err(e).context("SSH listener accept failed");
                        }
                    };

                    let state = Arc::clone(&self.state);
                    let config = Arc::clone(&self.config);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_connection(state, config, stream, peer_addr, shutdown).await;
                    });
                }
            }
        }
    }
}

/// Drive one connection from handshake to cleanup.  Whatever happens to the
/// session, every subordinate task it spawned is cancelled and joined before
/// this returns.
async fn handle_connection(
    state: Arc<Gateway>,
    config: Arc<server::Config>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    shutdown: CancellationToken,
) {
    info!(%peer_addr, "new connection");
    state.metrics.metrics.connections_total.inc();
    state.metrics.metrics.active_connections.inc();

    let procs = ProcessSet::new();
    let conn_cancel = CancellationToken::new();
    let handler = WorkerSession::new(
        Arc::clone(&state),
        procs.clone(),
        conn_cancel.clone(),
        Some(peer_addr),
    );

    match server::run_stream(config, stream, handler).await {
        Ok(session) => {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(%peer_addr, "dropping connection for shutdown");
                }
                _ = conn_cancel.cancelled() => {
                    info!(%peer_addr, "connection terminated by session");
                }
                result = session => match result {
                    Ok(_) => info!(%peer_addr, "connection closed"),
                    Err(e) => info!(%peer_addr, error = %e, "connection closed with error"),
                },
            }
        }
        Err(e) => {
            state.metrics.metrics.handshake_failures_total.inc();
            warn!(%peer_addr, error = %e, "handshake failed");
        }
    }

    procs.shutdown().await;
    state.metrics.metrics.active_connections.dec();
    info!(%peer_addr, "connection cleaned up");
}
