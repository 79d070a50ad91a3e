use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub ssh: SshConfig,
    pub auth: AuthConfig,
    pub atc: AtcConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub http: HttpConfig,
    /// Externally-reachable hostname of the gateway, substituted into the
    /// addresses of forwarded workers before every registration.
    pub forward_host: String,
}

// ---------------------------------------------------------------------------
// SSH listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// Socket address for the SSH listener (e.g. `0.0.0.0:2222`).
    #[serde(default = "default_ssh_listen")]
    pub listen_addr: String,
    /// Path to the OpenSSH-format host key.
    pub host_key_path: String,
}

fn default_ssh_listen() -> String {
    "0.0.0.0:2222".to_string()
}

// ---------------------------------------------------------------------------
// Worker authentication
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Authorized-keys file for workers not owned by any particular team.
    #[serde(default)]
    pub authorized_keys_path: Option<String>,
    /// Per-team authorized-keys files; a key found in one of these resolves
    /// to that team's identity.
    #[serde(default)]
    pub team_authorized_keys: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Orchestrator (ATC)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AtcConfig {
    /// Base URL of the orchestrator API (e.g. `https://atc.example.com`).
    pub endpoint: String,
    /// Path to the key material used to sign registration bearer tokens.
    pub token_signing_key_path: String,
}

// ---------------------------------------------------------------------------
// Heartbeat cadence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    /// Seconds between registrations while the orchestrator is healthy.
    #[serde(default = "default_heartbeat_interval")]
    pub interval: u64,
    /// Accelerated retry cadence (seconds) while registration is failing.
    #[serde(default = "default_cpr_interval")]
    pub cpr_interval: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: default_heartbeat_interval(),
            cpr_interval: default_cpr_interval(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn cpr_interval(&self) -> Duration {
        Duration::from_secs(self.cpr_interval)
    }

    /// TTL the orchestrator applies to each registration; a worker that
    /// misses two consecutive heartbeats ages out.
    pub fn registration_ttl(&self) -> Duration {
        Duration::from_secs(self.interval * 2)
    }
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_cpr_interval() -> u64 {
    5
}

// ---------------------------------------------------------------------------
// Operational HTTP (health + metrics)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Socket address for the health/metrics listener.
    #[serde(default = "default_http_listen")]
    pub listen_addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_http_listen(),
        }
    }
}

fn default_http_listen() -> String {
    "127.0.0.1:8000".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.forward_host.is_empty(),
        "forward_host must not be empty"
    );
    anyhow::ensure!(
        config.heartbeat.interval > 0,
        "heartbeat interval must be at least 1 second"
    );
    anyhow::ensure!(
        config.heartbeat.cpr_interval > 0,
        "cpr_interval must be at least 1 second"
    );
    anyhow::ensure!(
        config.heartbeat.cpr_interval <= config.heartbeat.interval,
        "cpr_interval must not exceed the heartbeat interval"
    );
    anyhow::ensure!(
        config.auth.authorized_keys_path.is_some() || !config.auth.team_authorized_keys.is_empty(),
        "at least one authorized-keys source must be configured"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
ssh:
  host_key_path: /etc/tollgate/host_key
auth:
  authorized_keys_path: /etc/tollgate/authorized_keys
atc:
  endpoint: http://127.0.0.1:8080
  token_signing_key_path: /etc/tollgate/signing_key
forward_host: gateway.example
"#
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        validate_config(&config).unwrap();

        assert_eq!(config.ssh.listen_addr, "0.0.0.0:2222");
        assert_eq!(config.heartbeat.interval, 30);
        assert_eq!(config.heartbeat.cpr_interval, 5);
        assert_eq!(config.heartbeat.registration_ttl(), Duration::from_secs(60));
        assert_eq!(config.http.listen_addr, "127.0.0.1:8000");
    }

    #[test]
    fn cpr_interval_must_not_exceed_heartbeat_interval() {
        let mut config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.heartbeat.interval = 5;
        config.heartbeat.cpr_interval = 30;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn forward_host_is_required() {
        let mut config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.forward_host = String::new();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn some_key_source_is_required() {
        let mut config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.auth.authorized_keys_path = None;
        config.auth.team_authorized_keys.clear();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn team_keys_alone_are_a_valid_source() {
        let mut config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.auth.authorized_keys_path = None;
        config
            .auth
            .team_authorized_keys
            .insert("main".to_string(), "/etc/tollgate/main.keys".to_string());
        validate_config(&config).unwrap();
    }
}
