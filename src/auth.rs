//! Api keys, claim codes and request authentication
//!
//! Keys are `fc_sk_<hex>` bearer tokens. Only a peppered sha-256 of the key
//! ever touches the database; the plaintext is shown exactly once, at
//! registration. Claim codes hash the same way.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::store::{AgentRow, Store};

pub const API_KEY_PREFIX: &str = "fc_sk_";
pub const CLAIM_CODE_PREFIX: &str = "fc_claim_";

/// The agent resolved from a bearer key
#[derive(Debug, Clone)]
pub struct AuthedAgent {
    pub agent: AgentRow,
    pub api_key_id: String,
}

impl AuthedAgent {
    /// Gameplay routes require a verified agent
    pub fn require_verified(&self) -> Result<(), ApiError> {
        if self.agent.verified_at.is_none() {
            return Err(ApiError::Forbidden);
        }
        Ok(())
    }
}

pub fn mint_api_key() -> String {
    format!("{API_KEY_PREFIX}{}", random_hex(24))
}

pub fn mint_claim_code() -> String {
    format!("{CLAIM_CODE_PREFIX}{}", random_hex(16))
}

/// The stored, displayable prefix of a key (enough to recognise, not to use)
pub fn key_prefix(key: &str) -> String {
    key.chars().take(API_KEY_PREFIX.len() + 6).collect()
}

pub fn hash_secret(secret: &str, pepper: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pepper.as_bytes());
    hasher.update(secret.as_bytes());
    hex(&hasher.finalize())
}

/// Agent names: 1-64 chars of `[A-Za-z0-9_-]`
pub fn valid_agent_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Resolve `Authorization: Bearer fc_sk_…` to an agent, or 401
pub async fn authenticate_bearer(
    store: &Store,
    config: &ServerConfig,
    headers: &HeaderMap,
) -> Result<AuthedAgent, ApiError> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    if !token.starts_with(API_KEY_PREFIX) {
        return Err(ApiError::Unauthorized);
    }

    let key_hash = hash_secret(token, &config.api_key_pepper);
    let (agent, api_key_id) = store
        .find_agent_by_key_hash(&key_hash)
        .await?
        .ok_or(ApiError::Unauthorized)?;

    Ok(AuthedAgent { agent, api_key_id })
}

/// Like `authenticate_bearer` but tolerates a missing header
/// (spectator transports take an optional key for per-agent filtering)
pub async fn authenticate_optional(
    store: &Store,
    config: &ServerConfig,
    headers: &HeaderMap,
) -> Result<Option<AuthedAgent>, ApiError> {
    if bearer_token(headers).is_none() {
        return Ok(None);
    }
    authenticate_bearer(store, config, headers).await.map(Some)
}

/// Admin routes carry `x-admin-key` matching `ADMIN_KEY`
pub fn require_admin(config: &ServerConfig, headers: &HeaderMap) -> Result<(), ApiError> {
    let presented = headers
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Forbidden)?;

    // Compare digests rather than the raw strings
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(config.admin_key.as_bytes());
    if a != b {
        return Err(ApiError::Forbidden);
    }
    Ok(())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    hex(&buf)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::test_store;

    #[test]
    fn test_name_validation() {
        assert!(valid_agent_name("alpha_Bot-7"));
        assert!(!valid_agent_name(""));
        assert!(!valid_agent_name("has space"));
        assert!(!valid_agent_name(&"x".repeat(65)));
    }

    #[test]
    fn test_hash_uses_pepper() {
        let key = mint_api_key();
        assert!(key.starts_with(API_KEY_PREFIX));
        assert_ne!(hash_secret(&key, "p1"), hash_secret(&key, "p2"));
        assert_eq!(hash_secret(&key, "p1"), hash_secret(&key, "p1"));
    }

    #[tokio::test]
    async fn test_bearer_roundtrip() {
        let store = test_store().await;
        let config = crate::config::ServerConfig::for_tests();

        let key = mint_api_key();
        let key_hash = hash_secret(&key, &config.api_key_pepper);
        let agent = store.create_agent("alpha", &key_hash, "claim").await.unwrap();
        store
            .insert_api_key(&agent.id, &key_hash, &key_prefix(&key))
            .await
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, format!("Bearer {key}").parse().unwrap());
        let authed = authenticate_bearer(&store, &config, &headers).await.unwrap();
        assert_eq!(authed.agent.id, agent.id);

        // Unverified agents authenticate but may not play
        assert!(authed.require_verified().is_err());

        // A bad key is a 401
        let mut bad = HeaderMap::new();
        bad.insert(AUTHORIZATION, "Bearer fc_sk_nope".parse().unwrap());
        assert!(authenticate_bearer(&store, &config, &bad).await.is_err());
    }
}
