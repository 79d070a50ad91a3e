//! Worker registration gateway.
//!
//! Remote build workers connect over SSH, prove their identity with a public
//! key, and either register directly (`register-worker`) or tunnel their
//! Garden and Baggageclaim services back through the gateway
//! (`forward-worker`).  For as long as the connection lives, the gateway
//! re-registers the worker with the orchestrator on a heartbeat cadence,
//! substituting its own tunnel endpoints for forwarded workers.

pub mod atc;
pub mod auth;
pub mod command;
pub mod config;
pub mod garden;
pub mod health;
pub mod heartbeat;
pub mod http;
pub mod metrics;
pub mod process;
pub mod ssh;
pub mod token;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::auth::AuthorizedKeys;
use crate::config::Config;
use crate::metrics::MetricsRegistry;
use crate::token::TokenGenerator;

/// Global state shared across connection handlers and background tasks.
pub struct Gateway {
    pub config: Arc<Config>,
    pub authorized_keys: AuthorizedKeys,
    pub token_generator: TokenGenerator,
    pub http_client: reqwest::Client,
    pub atc: atc::Client,
    pub metrics: MetricsRegistry,
    /// True while the SSH listener is bound and accepting; reported by
    /// `/healthz`.
    pub ssh_listener_up: AtomicBool,
}

impl Gateway {
    /// Assemble gateway state from a validated config: load the key stores
    /// and build the shared HTTP plumbing.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let authorized_keys = AuthorizedKeys::load(
            config.auth.authorized_keys_path.as_deref(),
            &config.auth.team_authorized_keys,
        )?;

        // Registration tokens live as long as a registration does.
        let token_generator = TokenGenerator::from_key_file(
            &config.atc.token_signing_key_path,
            config.heartbeat.registration_ttl(),
        )?;

        let http_client = reqwest::Client::builder()
            .user_agent(concat!("tollgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build http client")?;

        let atc = atc::Client::new(http_client.clone(), &config.atc.endpoint);

        Ok(Self {
            config,
            authorized_keys,
            token_generator,
            http_client,
            atc,
            metrics: MetricsRegistry::new(),
            ssh_listener_up: AtomicBool::new(false),
        })
    }
}
