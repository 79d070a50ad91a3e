//! Per-connection SSH session handler implementing the `russh` 0.46
//! [`Handler`] trait.
//!
//! Each inbound connection is served by a dedicated [`WorkerSession`].  The
//! handler authenticates the worker's public key, consumes `tcpip-forward`
//! global requests into a bounded queue, and on the worker's `exec` spawns a
//! registrar task that correlates tunnels, decodes the worker descriptor,
//! and starts the heartbeater.  Everything the handler spawns is recorded in
//! the connection's [`ProcessSet`] and joined when the connection ends.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use russh_keys::key::PublicKey;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{fingerprint_of, Identity};
use crate::command::{self, ForwardRequest, WorkerCommand};
use crate::heartbeat::Heartbeater;
use crate::process::ProcessSet;
use crate::ssh::forward::{self, ForwardedTcpIp};
use crate::{atc, garden, Gateway};

/// A connection accepts at most this many `tcpip-forward` requests; one for
/// Garden, one for Baggageclaim.
const MAX_FORWARDS: u32 = 2;

/// How long the registrar waits for each expected forward to arrive.
const FORWARD_COLLECT_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Per-connection SSH session state.
pub struct WorkerSession {
    state: Arc<Gateway>,
    procs: ProcessSet,
    /// Cancelling this tears down the whole connection; the registrar pulls
    /// it on fatal client errors, matching a server-side hangup.
    conn_cancel: CancellationToken,
    peer_addr: Option<SocketAddr>,

    /// Identity resolved at public-key auth.
    identity: Option<Identity>,

    /// Established forwards, in arrival order, consumed by the registrar.
    forwards_tx: mpsc::Sender<ForwardedTcpIp>,
    forwards_rx: Option<mpsc::Receiver<ForwardedTcpIp>>,
    /// Count of `tcpip-forward` requests seen, accepted or not.
    forward_count: u32,

    /// Byte queues feeding descriptor decode, one per channel with an
    /// accepted `exec`.
    data_txs: HashMap<ChannelId, mpsc::Sender<Vec<u8>>>,
    /// Set once a registration has been started; a connection gets one.
    registered: bool,
}

impl WorkerSession {
    pub fn new(
        state: Arc<Gateway>,
        procs: ProcessSet,
        conn_cancel: CancellationToken,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        let (forwards_tx, forwards_rx) = mpsc::channel(MAX_FORWARDS as usize);
        Self {
            state,
            procs,
            conn_cancel,
            peer_addr,
            identity: None,
            forwards_tx,
            forwards_rx: Some(forwards_rx),
            forward_count: 0,
            data_txs: HashMap::new(),
            registered: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Handler for WorkerSession {
    type Error = anyhow::Error;

    /// Authenticate a worker by public key.  The fingerprint must resolve to
    /// an identity in the authorized-keys store; nothing else is accepted.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let fingerprint = fingerprint_of(key);

        match self.state.authorized_keys.resolve(&fingerprint) {
            Some(identity) => {
                info!(
                    peer = ?self.peer_addr,
                    user = %user,
                    %fingerprint,
                    team = ?identity.team,
                    "worker key authenticated"
                );
                self.identity = Some(identity.clone());
                Ok(Auth::Accept)
            }
            None => {
                warn!(
                    peer = ?self.peer_addr,
                    user = %user,
                    %fingerprint,
                    "rejecting unknown worker key"
                );
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    /// Accept session channels; all other channel types are refused with
    /// "unknown channel type" by the library defaults.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(peer = ?self.peer_addr, channel = ?channel.id(), "session channel opened");
        Ok(true)
    }

    /// Only `exec` is served on a session channel.
    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = ?self.peer_addr, "rejecting shell request");
        session.channel_failure(channel_id);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = ?self.peer_addr, "rejecting pty request");
        session.channel_failure(channel_id);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel_id: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel_id);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = ?self.peer_addr, subsystem = %name, "rejecting subsystem request");
        session.channel_failure(channel_id);
        Ok(())
    }

    /// The worker's registration command.
    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw = String::from_utf8_lossy(data);
        info!(peer = ?self.peer_addr, command = %raw, "exec request");

        let Some(identity) = self.identity.clone() else {
            session.channel_failure(channel_id);
            return Ok(());
        };

        let cmd = match command::parse(&raw) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(peer = ?self.peer_addr, command = %raw, error = %e, "invalid command");
                session.data(
                    channel_id,
                    CryptoVec::from_slice(format!("invalid command: {e:#}\n").as_bytes()),
                );
                session.channel_failure(channel_id);
                return Ok(());
            }
        };

        // One registration per connection; repeat execs are refused.
        if self.registered {
            warn!(peer = ?self.peer_addr, "rejecting second registration on one connection");
            session.channel_failure(channel_id);
            return Ok(());
        }
        self.registered = true;

        let (data_tx, data_rx) = mpsc::channel(64);
        self.data_txs.insert(channel_id, data_tx);
        session.channel_success(channel_id);

        let registrar = Registrar {
            state: Arc::clone(&self.state),
            procs: self.procs.clone(),
            handle: session.handle(),
            channel_id,
            identity,
            conn_cancel: self.conn_cancel.clone(),
            data_rx,
        };

        match cmd {
            WorkerCommand::Register => {
                self.procs
                    .spawn("register-worker", move |cancel| registrar.run_direct(cancel))
                    .await;
            }
            WorkerCommand::Forward(request) => {
                // The queue receiver moves to the registrar; a second
                // forward-worker exec cannot happen (guarded above).
                let forwards_rx = self
                    .forwards_rx
                    .take()
                    .context("forwards queue already consumed")?;
                self.procs
                    .spawn("forward-worker", move |cancel| {
                        registrar.run_forwarded(request, forwards_rx, cancel)
                    })
                    .await;
            }
        }

        Ok(())
    }

    /// Channel data is the worker descriptor; route it to the registrar.
    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let send_failed = match self.data_txs.get(&channel_id) {
            Some(tx) => tx.send(data.to_vec()).await.is_err(),
            None => false,
        };
        if send_failed {
            // Registrar finished decoding; later bytes are uninteresting.
            self.data_txs.remove(&channel_id);
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = ?self.peer_addr, channel = ?channel_id, "channel eof");
        self.data_txs.remove(&channel_id);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = ?self.peer_addr, channel = ?channel_id, "channel closed");
        self.data_txs.remove(&channel_id);
        Ok(())
    }

    /// Reverse-tunnel setup.  The gateway always listens on an OS-assigned
    /// port; the client's requested bind address is only recorded as the
    /// correlation key for the follow-on `forward-worker` command.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.forward_count += 1;
        if self.forward_count > MAX_FORWARDS {
            info!(peer = ?self.peer_addr, "rejecting extra forward request");
            self.state.metrics.metrics.forward_rejections_total.inc();
            return Ok(false);
        }

        let requested_port = *port;

        let listener = match TcpListener::bind("0.0.0.0:0").await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(peer = ?self.peer_addr, error = %e, "failed to open forward listener");
                return Ok(false);
            }
        };

        let bound_port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                warn!(peer = ?self.peer_addr, error = %e, "failed to read forward listener address");
                return Ok(false);
            }
        };

        // The port echoed on forwarded channels: the client's requested
        // port, unless it asked the gateway to pick one.
        let for_port = if requested_port == 0 {
            bound_port as u32
        } else {
            requested_port
        };

        info!(
            peer = ?self.peer_addr,
            requested_bind_addr = %format!("{address}:{requested_port}"),
            bound_port,
            "forwarding tcpip"
        );
        self.state.metrics.metrics.forwards_opened_total.inc();

        let handle = session.handle();
        let forward_ip = address.to_string();
        self.procs
            .spawn("forward-dispatcher", move |cancel| {
                forward::dispatch(listener, handle, forward_ip, for_port, cancel)
            })
            .await;

        let record = ForwardedTcpIp {
            bind_addr: format!("{address}:{requested_port}"),
            bound_port,
        };
        if self.forwards_tx.try_send(record).is_err() {
            // Capacity matches MAX_FORWARDS, so this cannot fire for a
            // well-behaved client.
            warn!(peer = ?self.peer_addr, "forwards queue full, dropping record");
        }

        *port = bound_port as u32;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Registrar
// ---------------------------------------------------------------------------

/// The supervised task spawned by an accepted `exec`: correlates forwards,
/// decodes the worker descriptor from channel data, and starts the
/// heartbeater.
struct Registrar {
    state: Arc<Gateway>,
    procs: ProcessSet,
    handle: Handle,
    channel_id: ChannelId,
    identity: Identity,
    conn_cancel: CancellationToken,
    data_rx: mpsc::Receiver<Vec<u8>>,
}

impl Registrar {
    /// `register-worker`: the descriptor is forwarded untouched.
    async fn run_direct(mut self, cancel: CancellationToken) -> Result<()> {
        let worker = match self.decode_worker(&cancel).await {
            Ok(worker) => worker,
            Err(e) => {
                self.fail(&format!("malformed worker descriptor: {e:#}\n"))
                    .await;
                return Err(e);
            }
        };

        self.start_heartbeater(worker).await
    }

    /// `forward-worker`: collect the expected tunnels, then rewrite the
    /// descriptor's addresses to point at the gateway.
    async fn run_forwarded(
        mut self,
        request: ForwardRequest,
        mut forwards_rx: mpsc::Receiver<ForwardedTcpIp>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut collected: Vec<ForwardedTcpIp> = Vec::new();

        for _ in 0..request.expected_forwards() {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),

                forwarded = forwards_rx.recv() => match forwarded {
                    Some(forwarded) => {
                        info!(bound_port = forwarded.bound_port, "collected forwarded tcpip");
                        collected.push(forwarded);
                    }
                    None => break,
                },

                _ = tokio::time::sleep(FORWARD_COLLECT_TIMEOUT) => {
                    info!("expected forward never arrived");
                }
            }
        }

        let (garden_port, baggageclaim_port) = match collected.len() {
            0 => {
                self.fail("requested forwarding but no forwards given\n").await;
                return Err(anyhow!("no forwards established"));
            }

            // A single tunnel is always Garden, whatever was declared.
            1 => (collected[0].bound_port, None),

            _ => {
                let forwards: HashMap<&str, &ForwardedTcpIp> = collected
                    .iter()
                    .map(|f| (f.bind_addr.as_str(), f))
                    .collect();

                // expected_forwards() == 2 only when both were declared.
                let garden_addr = request
                    .garden_addr
                    .as_deref()
                    .context("garden address missing from forward request")?;
                let baggageclaim_addr = request
                    .baggageclaim_addr
                    .as_deref()
                    .context("baggageclaim address missing from forward request")?;

                let Some(garden) = forwards.get(garden_addr) else {
                    self.fail(&format!(
                        "garden address {garden_addr} not found in forwards\n"
                    ))
                    .await;
                    return Err(anyhow!("garden forward not found"));
                };

                let Some(baggageclaim) = forwards.get(baggageclaim_addr) else {
                    self.fail(&format!(
                        "baggageclaim address {baggageclaim_addr} not found in forwards\n"
                    ))
                    .await;
                    return Err(anyhow!("baggageclaim forward not found"));
                };

                (garden.bound_port, Some(baggageclaim.bound_port))
            }
        };

        let mut worker = match self.decode_worker(&cancel).await {
            Ok(worker) => worker,
            Err(e) => {
                self.fail(&format!("malformed worker descriptor: {e:#}\n"))
                    .await;
                return Err(e);
            }
        };

        let forward_host = &self.state.config.forward_host;
        worker.garden_addr = format!("{forward_host}:{garden_port}");
        if let Some(port) = baggageclaim_port {
            worker.baggageclaim_url = Some(format!("http://{forward_host}:{port}"));
        }

        self.start_heartbeater(worker).await
    }

    /// Read channel data until exactly one JSON document decodes.  The
    /// worker keeps the channel open afterwards, so decoding is incremental
    /// rather than read-to-EOF.
    async fn decode_worker(&mut self, cancel: &CancellationToken) -> Result<atc::Worker> {
        let mut buf: Vec<u8> = Vec::new();

        loop {
            if !buf.is_empty() {
                let mut documents =
                    serde_json::Deserializer::from_slice(&buf).into_iter::<atc::Worker>();
                match documents.next() {
                    Some(Ok(worker)) => return Ok(worker),
                    Some(Err(e)) if e.is_eof() => {}
                    Some(Err(e)) => return Err(e).context("failed to decode worker descriptor"),
                    None => {}
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    bail!("cancelled while waiting for worker descriptor")
                }
                chunk = self.data_rx.recv() => match chunk {
                    Some(chunk) => buf.extend_from_slice(&chunk),
                    None => bail!("connection closed before worker descriptor was received"),
                }
            }
        }
    }

    async fn start_heartbeater(&self, worker: atc::Worker) -> Result<()> {
        let garden = garden::Client::new(&worker.garden_addr)?;

        let heartbeater = Heartbeater::new(
            self.state.atc.clone(),
            garden,
            self.state.token_generator.clone(),
            self.identity.clone(),
            self.state.config.heartbeat.interval(),
            self.state.config.heartbeat.cpr_interval(),
            self.state.config.heartbeat.registration_ttl(),
            self.state.metrics.clone(),
            worker,
        );

        self.procs
            .spawn("heartbeater", move |cancel| heartbeater.run(cancel))
            .await;

        Ok(())
    }

    /// Best-effort diagnostic to the worker, then tear the connection down.
    async fn fail(&self, message: &str) {
        let _ = self
            .handle
            .data(self.channel_id, CryptoVec::from_slice(message.as_bytes()))
            .await;
        let _ = self.handle.close(self.channel_id).await;
        self.conn_cancel.cancel();
    }
}
