//! Liveness probing of a worker's Garden (container) backend.
//!
//! The heartbeater owns one [`Client`] per worker and uses it for exactly
//! one thing: pulling the current container inventory so each registration
//! carries a fresh `active_containers` count.  A probe failure is never
//! fatal; the registration itself is the source of truth.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_IDLE: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
const KEEPALIVE_RETRIES: u32 = 3;

/// Build the HTTP client every Garden probe runs on: a 5-second connect
/// deadline and OS-level TCP keepalive (idle 10s, probe interval 5s, 3
/// probes) so a worker that silently drops off the network is detected even
/// between requests.
pub fn keepalive_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(KEEPALIVE_IDLE)
        .tcp_keepalive_interval(KEEPALIVE_INTERVAL)
        .tcp_keepalive_retries(KEEPALIVE_RETRIES)
        .build()
        .context("failed to build garden http client")
}

#[derive(Debug, Deserialize)]
struct ContainersResponse {
    #[serde(default)]
    handles: Vec<String>,
}

/// Client for one worker's Garden backend.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    addr: String,
}

impl Client {
    pub fn new(addr: &str) -> Result<Self> {
        Ok(Self {
            http: keepalive_client()?,
            addr: addr.to_string(),
        })
    }

    /// Number of containers currently running on the worker.
    pub async fn container_count(&self) -> Result<usize> {
        let url = format!("http://{}/containers", self.addr);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("garden containers request failed")?;

        let status = response.status();
        anyhow::ensure!(status.is_success(), "garden returned {status}");

        let containers: ContainersResponse = response
            .json()
            .await
            .context("malformed garden containers response")?;

        Ok(containers.handles.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containers_response_decodes_handles() {
        let response: ContainersResponse =
            serde_json::from_str(r#"{"handles":["a","b","c"]}"#).unwrap();
        assert_eq!(response.handles.len(), 3);
    }

    #[test]
    fn containers_response_tolerates_missing_handles() {
        let response: ContainersResponse = serde_json::from_str("{}").unwrap();
        assert!(response.handles.is_empty());
    }

    #[test]
    fn keepalive_client_builds() {
        keepalive_client().unwrap();
    }
}
