//! Reverse-tunnel dispatchers.
//!
//! For each accepted `tcpip-forward` request the gateway opens a local
//! listener and runs one dispatcher: every TCP connection accepted on the
//! listener is injected into the SSH connection as a `forwarded-tcpip`
//! channel and piped bidirectionally until either side goes away.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use russh::server::Handle;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// One established reverse tunnel, as seen by the session handler.
///
/// `bind_addr` is the client-declared `bindIP:bindPort`, used only to
/// correlate the tunnel with the addresses named in a `forward-worker`
/// command.  `bound_port` is the port the gateway actually listens on.
#[derive(Debug, Clone)]
pub struct ForwardedTcpIp {
    pub bind_addr: String,
    pub bound_port: u16,
}

/// Accept local connections until cancelled, handing each to an independent
/// piping task.  `forward_ip`/`forward_port` are the client-requested bind
/// address, echoed in every `forwarded-tcpip` channel-open so the worker can
/// tell which forward the traffic belongs to.
pub async fn dispatch(
    listener: TcpListener,
    handle: Handle,
    forward_ip: String,
    forward_port: u32,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(forward_port, "forward dispatcher stopped");
                return Ok(());
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((local, peer)) => {
                        let handle = handle.clone();
                        let forward_ip = forward_ip.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                pipe_local_conn(local, peer, handle, forward_ip, forward_port).await
                            {
                                warn!(%peer, error = %e, "forwarded connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(forward_port, error = %e, "failed to accept forwarded connection");
                        return Err(e).context("forward listener accept failed");
                    }
                }
            }
        }
    }
}

/// Open a `forwarded-tcpip` channel toward the worker and pump bytes both
/// ways.  When either direction reaches EOF or errors, both ends are closed
/// so the other pump unblocks.
async fn pipe_local_conn(
    mut local: TcpStream,
    peer: SocketAddr,
    handle: Handle,
    forward_ip: String,
    forward_port: u32,
) -> Result<()> {
    let channel = handle
        .channel_open_forwarded_tcpip(
            forward_ip,
            forward_port,
            peer.ip().to_string(),
            peer.port() as u32,
        )
        .await
        .map_err(|e| anyhow::anyhow!("failed to open forwarded-tcpip channel: {e}"))?;

    let mut stream = channel.into_stream();

    match tokio::io::copy_bidirectional(&mut local, &mut stream).await {
        Ok((to_worker, to_local)) => {
            debug!(%peer, to_worker, to_local, "forwarded connection closed");
            Ok(())
        }
        // Dropped peers surface as errors here; the tunnel itself is fine.
        Err(e) => {
            debug!(%peer, error = %e, "forwarded connection closed");
            Ok(())
        }
    }
}
