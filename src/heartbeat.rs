//! The per-worker heartbeat loop.
//!
//! One heartbeater runs for the lifetime of each registered worker
//! connection.  Every beat refreshes the worker's container inventory from
//! Garden and re-posts the descriptor to the orchestrator with a fresh
//! bearer token.  While the orchestrator is unreachable the loop drops to
//! the accelerated CPR cadence and keeps trying; registration failures never
//! terminate the session.

use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::atc::{self, Worker};
use crate::auth::Identity;
use crate::garden;
use crate::metrics::{HeartbeatLabels, HeartbeatResult, MetricsRegistry};
use crate::token::TokenGenerator;

pub struct Heartbeater {
    atc: atc::Client,
    garden: garden::Client,
    tokens: TokenGenerator,
    identity: Identity,
    interval: Duration,
    cpr_interval: Duration,
    ttl: Duration,
    metrics: MetricsRegistry,
    worker: Worker,
}

impl Heartbeater {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        atc: atc::Client,
        garden: garden::Client,
        tokens: TokenGenerator,
        identity: Identity,
        interval: Duration,
        cpr_interval: Duration,
        ttl: Duration,
        metrics: MetricsRegistry,
        worker: Worker,
    ) -> Self {
        Self {
            atc,
            garden,
            tokens,
            identity,
            interval,
            cpr_interval,
            ttl,
            metrics,
            worker,
        }
    }

    /// Register the worker on a cadence until cancelled.  One POST is in
    /// flight at a time; an in-progress POST is allowed to finish before
    /// cancellation is observed.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let name = self.worker.name.clone();
        info!(worker = %name, interval = ?self.interval, "heartbeating worker");

        let mut resuscitating = false;

        loop {
            match self.heartbeat().await {
                Ok(()) => {
                    self.metrics
                        .metrics
                        .heartbeats_total
                        .get_or_create(&HeartbeatLabels {
                            result: HeartbeatResult::Ok,
                        })
                        .inc();

                    if resuscitating {
                        info!(worker = %name, "orchestrator recovered, resuming normal cadence");
                        resuscitating = false;
                    } else {
                        debug!(worker = %name, "registered");
                    }
                }
                Err(e) => {
                    self.metrics
                        .metrics
                        .heartbeats_total
                        .get_or_create(&HeartbeatLabels {
                            result: HeartbeatResult::Failed,
                        })
                        .inc();

                    warn!(worker = %name, error = %e, "registration failed, entering cpr cadence");
                    resuscitating = true;
                }
            }

            let pause = if resuscitating {
                self.cpr_interval
            } else {
                self.interval
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(worker = %name, "heartbeat stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn heartbeat(&mut self) -> Result<()> {
        // Refresh the container inventory first.  A Garden failure is not a
        // registration failure; the last known count is posted instead.
        match self.garden.container_count().await {
            Ok(count) => self.worker.active_containers = count,
            Err(e) => warn!(
                worker = %self.worker.name,
                error = %e,
                "garden probe failed, keeping last container count"
            ),
        }

        let token = self.tokens.generate(&self.identity)?;
        self.atc
            .register_worker(&self.worker, &token, self.ttl)
            .await
    }
}
