//! Public-key authentication for workers.
//!
//! Keys are loaded from OpenSSH authorized-keys files at startup: one global
//! file plus any number of per-team files.  At handshake time the offered
//! key's fingerprint is resolved to an [`Identity`]; an unknown fingerprint
//! rejects the connection before any registration can happen.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine as _;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Who a worker key belongs to.  Keys from the global authorized-keys file
/// carry no team; keys from a team file resolve to that team.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub team: Option<String>,
}

impl Identity {
    pub fn global() -> Self {
        Self { team: None }
    }

    pub fn team(name: impl Into<String>) -> Self {
        Self {
            team: Some(name.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Fingerprints
// ---------------------------------------------------------------------------

/// Compute the SHA-256 fingerprint of an SSH public key, returned as a
/// base64-encoded string prefixed with `SHA256:` (matching the format used
/// by `ssh-keygen -l`).
pub fn fingerprint_of(key: &PublicKey) -> String {
    let blob_b64 = key.public_key_base64();
    let blob = base64::engine::general_purpose::STANDARD
        .decode(blob_b64.as_bytes())
        .unwrap_or_default();
    let hash = Sha256::digest(&blob);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{encoded}")
}

// ---------------------------------------------------------------------------
// Authorized-keys store
// ---------------------------------------------------------------------------

/// Immutable fingerprint-to-identity map built once at startup.
#[derive(Debug, Default)]
pub struct AuthorizedKeys {
    by_fingerprint: HashMap<String, Identity>,
}

impl AuthorizedKeys {
    /// Load the global file (if configured) and every team file.  A key that
    /// appears in more than one source keeps the first identity loaded;
    /// later duplicates are logged and skipped.
    pub fn load(
        global_path: Option<&str>,
        team_paths: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut store = Self::default();

        if let Some(path) = global_path {
            store.load_file(Path::new(path), Identity::global())?;
        }

        for (team, path) in team_paths {
            store.load_file(Path::new(path), Identity::team(team.clone()))?;
        }

        Ok(store)
    }

    fn load_file(&mut self, path: &Path, identity: Identity) -> Result<()> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read authorized keys: {}", path.display()))?;

        let mut count = 0;

        for (line_num, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some(key) = parse_openssh_line(line) else {
                warn!(
                    path = %path.display(),
                    line = line_num + 1,
                    "skipping unparseable authorized key"
                );
                continue;
            };

            let fingerprint = fingerprint_of(&key);

            if self.by_fingerprint.contains_key(&fingerprint) {
                warn!(%fingerprint, path = %path.display(), "duplicate authorized key ignored");
                continue;
            }

            debug!(%fingerprint, team = ?identity.team, "loaded authorized key");
            self.by_fingerprint.insert(fingerprint, identity.clone());
            count += 1;
        }

        tracing::info!(
            path = %path.display(),
            count,
            team = ?identity.team,
            "loaded authorized keys"
        );
        Ok(())
    }

    /// Resolve a fingerprint to the identity owning the key, if any.
    pub fn resolve(&self, fingerprint: &str) -> Option<&Identity> {
        self.by_fingerprint.get(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.by_fingerprint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_fingerprint.is_empty()
    }
}

/// Parse an OpenSSH public key line (`type base64 [comment]`).
fn parse_openssh_line(line: &str) -> Option<PublicKey> {
    let mut parts = line.split_whitespace();
    let first = parts.next()?;

    // Tolerate both bare-base64 lines and the usual `type base64 comment`
    // form.
    if let Ok(key) = russh_keys::parse_public_key_base64(first) {
        return Some(key);
    }

    let second = parts.next()?;
    russh_keys::parse_public_key_base64(second).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use russh_keys::key::KeyPair;
    use tempfile::NamedTempFile;

    fn key_line(pair: &KeyPair, comment: &str) -> String {
        format!("{} {} {}", pair.name(), pair.public_key_base64(), comment)
    }

    #[test]
    fn resolves_global_and_team_keys() {
        let global_pair = KeyPair::generate_ed25519();
        let team_pair = KeyPair::generate_ed25519();

        let mut global_file = NamedTempFile::new().unwrap();
        writeln!(global_file, "# workers").unwrap();
        writeln!(global_file).unwrap();
        writeln!(global_file, "{}", key_line(&global_pair, "worker@global")).unwrap();

        let mut team_file = NamedTempFile::new().unwrap();
        writeln!(team_file, "{}", key_line(&team_pair, "worker@main")).unwrap();

        let teams = HashMap::from([(
            "main".to_string(),
            team_file.path().to_string_lossy().into_owned(),
        )]);

        let global_path = global_file.path().to_string_lossy().into_owned();
        let store = AuthorizedKeys::load(Some(global_path.as_str()), &teams).unwrap();

        assert_eq!(store.len(), 2);

        let global_fp = fingerprint_of(&global_pair.clone_public_key().unwrap());
        assert_eq!(store.resolve(&global_fp), Some(&Identity::global()));

        let team_fp = fingerprint_of(&team_pair.clone_public_key().unwrap());
        assert_eq!(store.resolve(&team_fp), Some(&Identity::team("main")));
    }

    #[test]
    fn unknown_fingerprint_is_rejected() {
        let store = AuthorizedKeys::default();
        assert_eq!(store.resolve("SHA256:nope"), None);
    }

    #[test]
    fn unparseable_lines_are_skipped() {
        let pair = KeyPair::generate_ed25519();

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not a key at all").unwrap();
        writeln!(file, "{}", key_line(&pair, "worker")).unwrap();

        let path = file.path().to_string_lossy().into_owned();
        let store = AuthorizedKeys::load(Some(path.as_str()), &HashMap::new()).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = AuthorizedKeys::load(Some("/nonexistent/authorized_keys"), &HashMap::new());
        assert!(result.is_err());
    }

    #[test]
    fn fingerprint_has_sha256_prefix() {
        let pair = KeyPair::generate_ed25519();
        let fp = fingerprint_of(&pair.clone_public_key().unwrap());
        assert!(fp.starts_with("SHA256:"));
    }
}
