//! Parsing of the `exec` command a worker sends on its session channel.
//!
//! The grammar is deliberately tiny:
//!
//! ```text
//! register-worker
//! forward-worker [--garden-address HOST:PORT] [--baggageclaim-address HOST:PORT]
//! ```
//!
//! The parser only validates the shape of the command; matching declared
//! forward addresses against the tunnels the worker actually established
//! happens later, in the session handler.

use anyhow::{bail, Context, Result};

/// The two registration modes a worker can request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Direct registration: the worker's declared addresses are reachable
    /// from the orchestrator as-is.
    Register,
    /// Registration through reverse tunnels anchored at the gateway.
    Forward(ForwardRequest),
}

/// Declared bind addresses for a forwarded registration.  These are
/// correlation keys for the worker's inbound `tcpip-forward` requests, not
/// addresses the gateway ever connects to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardRequest {
    pub garden_addr: Option<String>,
    pub baggageclaim_addr: Option<String>,
}

impl ForwardRequest {
    /// Number of `tcpip-forward` requests the session handler should wait
    /// for.  With no declared addresses a single Garden tunnel is assumed.
    pub fn expected_forwards(&self) -> usize {
        match (&self.garden_addr, &self.baggageclaim_addr) {
            (Some(_), Some(_)) => 2,
            _ => 1,
        }
    }
}

/// Parse the raw `exec` command string into a [`WorkerCommand`].
pub fn parse(command: &str) -> Result<WorkerCommand> {
    let mut tokens = command.split_whitespace();

    match tokens.next() {
        Some("register-worker") => {
            if let Some(extra) = tokens.next() {
                bail!("unexpected argument {extra:?}");
            }
            Ok(WorkerCommand::Register)
        }

        Some("forward-worker") => {
            let mut request = ForwardRequest::default();

            while let Some(flag) = tokens.next() {
                let slot = match flag {
                    "--garden-address" => &mut request.garden_addr,
                    "--baggageclaim-address" => &mut request.baggageclaim_addr,
                    other => bail!("unknown flag {other:?}"),
                };

                if slot.is_some() {
                    bail!("duplicate flag {flag:?}");
                }

                let value = tokens
                    .next()
                    .with_context(|| format!("missing value for {flag}"))?;
                validate_addr(value).with_context(|| format!("bad value for {flag}"))?;

                *slot = Some(value.to_string());
            }

            // A baggageclaim tunnel without a garden tunnel has no meaning;
            // the single-forward path always treats the tunnel as Garden.
            if request.garden_addr.is_none() && request.baggageclaim_addr.is_some() {
                bail!("--baggageclaim-address requires --garden-address");
            }

            Ok(WorkerCommand::Forward(request))
        }

        Some(other) => bail!("unknown command {other:?}"),
        None => bail!("empty command"),
    }
}

/// Require a `host:port` form with a numeric port.
fn validate_addr(addr: &str) -> Result<()> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("{addr:?} is not of the form host:port"))?;

    if host.is_empty() {
        bail!("{addr:?} has an empty host");
    }

    port.parse::<u16>()
        .with_context(|| format!("{addr:?} has an invalid port"))?;

    Ok(())
}
