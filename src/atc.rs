//! The orchestrator's worker API: the descriptor workers declare and the
//! registration endpoint the gateway posts it to.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Worker descriptor
// ---------------------------------------------------------------------------

/// The JSON payload a worker writes on its session channel after its `exec`
/// is accepted.  Unknown fields are preserved and echoed verbatim to the
/// orchestrator; the gateway itself only ever rewrites `addr` and
/// `baggageclaim_url` for forwarded registrations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Worker {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub platform: String,
    /// Address of the worker's Garden (container) backend, `host:port`.
    #[serde(default, rename = "addr")]
    pub garden_addr: String,
    /// URL of the worker's Baggageclaim (volume) backend, if it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baggageclaim_url: Option<String>,
    #[serde(default)]
    pub active_containers: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_types: Vec<ResourceType>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A resource-type capability the worker advertises.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceType {
    #[serde(rename = "type")]
    pub kind: String,
    pub image: String,
}

// ---------------------------------------------------------------------------
// Registration client
// ---------------------------------------------------------------------------

/// Thin client for the orchestrator's worker registration endpoint.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
}

impl Client {
    pub fn new(http: reqwest::Client, endpoint: &str) -> Self {
        Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    /// `POST {endpoint}/api/v1/workers?ttl={ttl}s` with a bearer token.
    /// Anything other than a 2xx response is a failure.
    pub async fn register_worker(
        &self,
        worker: &Worker,
        token: &str,
        ttl: Duration,
    ) -> Result<()> {
        let url = format!("{}/api/v1/workers", self.endpoint);

        let response = self
            .http
            .post(&url)
            .query(&[("ttl", format!("{}s", ttl.as_secs()))])
            .bearer_auth(token)
            .json(worker)
            .send()
            .await
            .context("registration request failed")?;

        let status = response.status();
        anyhow::ensure!(status.is_success(), "registration rejected: {status}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_minimal_descriptor() {
        let worker: Worker =
            serde_json::from_str(r#"{"name":"w1","platform":"linux","tags":[]}"#).unwrap();
        assert_eq!(worker.name, "w1");
        assert_eq!(worker.platform, "linux");
        assert_eq!(worker.garden_addr, "");
        assert_eq!(worker.baggageclaim_url, None);
        assert!(worker.tags.is_empty());
        assert!(worker.extra.is_empty());
    }

    #[test]
    fn unknown_fields_are_echoed_verbatim() {
        let worker: Worker = serde_json::from_str(
            r#"{"name":"w1","addr":"10.0.0.1:7777","certificates_path":"/etc/certs"}"#,
        )
        .unwrap();

        let out = serde_json::to_value(&worker).unwrap();
        assert_eq!(out["name"], "w1");
        assert_eq!(out["addr"], "10.0.0.1:7777");
        assert_eq!(out["certificates_path"], "/etc/certs");
    }

    #[test]
    fn resource_types_round_trip() {
        let worker: Worker = serde_json::from_str(
            r#"{"name":"w1","resource_types":[{"type":"git","image":"/images/git"}]}"#,
        )
        .unwrap();
        assert_eq!(
            worker.resource_types,
            vec![ResourceType {
                kind: "git".to_string(),
                image: "/images/git".to_string(),
            }]
        );

        let out = serde_json::to_value(&worker).unwrap();
        assert_eq!(out["resource_types"][0]["type"], "git");
    }

    #[test]
    fn rewritten_addresses_serialize_in_place() {
        let mut worker: Worker =
            serde_json::from_str(r#"{"name":"w2","addr":"127.0.0.1:7777"}"#).unwrap();

        worker.garden_addr = "gateway.example:40001".to_string();
        worker.baggageclaim_url = Some("http://gateway.example:40002".to_string());

        let out = serde_json::to_value(&worker).unwrap();
        assert_eq!(out["addr"], "gateway.example:40001");
        assert_eq!(out["baggageclaim_url"], "http://gateway.example:40002");
    }
}
