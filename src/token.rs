//! Bearer-token minting for registration requests.
//!
//! Every heartbeat carries a freshly signed, short-lived JWT so a captured
//! token is useless shortly after the worker disappears.  The signing key is
//! shared with the orchestrator, which verifies the token on its
//! registration endpoint.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::auth::Identity;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Clone)]
pub struct TokenGenerator {
    enc: EncodingKey,
    ttl: Duration,
}

impl TokenGenerator {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            enc: EncodingKey::from_secret(secret),
            ttl,
        }
    }

    /// Read the signing key material from disk.
    pub fn from_key_file<P: AsRef<Path>>(path: P, ttl: Duration) -> Result<Self> {
        let path = path.as_ref();
        let secret = std::fs::read(path)
            .with_context(|| format!("failed to read token signing key: {}", path.display()))?;
        anyhow::ensure!(
            !secret.is_empty(),
            "token signing key {} is empty",
            path.display()
        );
        Ok(Self::new(&secret, ttl))
    }

    /// Mint a token asserting the given identity, valid for the configured
    /// TTL from now.
    pub fn generate(&self, identity: &Identity) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: "tollgate".to_string(),
            team: identity.team.clone(),
            iat: now.timestamp(),
            exp: (now + chrono::Duration::from_std(self.ttl).context("token ttl out of range")?)
                .timestamp(),
        };

        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.enc)
            .context("failed to sign registration token")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};

    fn decode(token: &str, secret: &[u8]) -> Claims {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)
            .expect("token should verify")
            .claims
    }

    #[test]
    fn token_round_trips_with_team_claim() {
        let secret = b"super-secret-signing-key";
        let generator = TokenGenerator::new(secret, Duration::from_secs(60));

        let token = generator.generate(&Identity::team("main")).unwrap();
        let claims = decode(&token, secret);

        assert_eq!(claims.sub, "tollgate");
        assert_eq!(claims.team.as_deref(), Some("main"));
        assert!(claims.exp > claims.iat);
        assert_eq!(claims.exp - claims.iat, 60);
    }

    #[test]
    fn global_identity_omits_team_claim() {
        let secret = b"super-secret-signing-key";
        let generator = TokenGenerator::new(secret, Duration::from_secs(60));

        let token = generator.generate(&Identity::global()).unwrap();
        let claims = decode(&token, secret);
        assert_eq!(claims.team, None);
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let generator = TokenGenerator::new(b"right", Duration::from_secs(60));
        let token = generator.generate(&Identity::global()).unwrap();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        let result = jsonwebtoken::decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"wrong"),
            &validation,
        );
        assert!(result.is_err());
    }

    #[test]
    fn key_file_must_not_be_empty() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let result = TokenGenerator::from_key_file(file.path(), Duration::from_secs(60));
        assert!(result.is_err());
    }
}
