//! SSH ingress for the gateway.
//!
//! Workers connect here, authenticate with a public key, optionally set up
//! reverse tunnels with `tcpip-forward`, and issue a single registration
//! `exec` command.  The session handler drives everything after the
//! handshake; the server module owns the accept loop and per-connection
//! cleanup.

pub mod forward;
pub mod server;
pub mod session;

pub use server::{load_host_key, Server};
