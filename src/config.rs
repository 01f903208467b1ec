use std::env;
use std::time::Duration;

use anyhow::{bail, Context};

/// Server configuration, resolved once at startup from the environment
///
/// Secrets (`API_KEY_PEPPER`, `ADMIN_KEY`) are required and the server
/// refuses to boot without them. Everything else has a sensible default.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Sqlite connection string
    pub database_url: String,

    /// Address to bind the HTTP listener to
    pub bind_addr: String,

    /// Process-wide pepper mixed into every api key / claim code hash
    pub api_key_pepper: String,

    /// Shared secret for the verify/finish admin surface
    pub admin_key: String,

    /// Origin allowed by CORS (`*` when unset)
    pub cors_origin: Option<String>,

    /// How long the active agent has to submit a move
    pub turn_timeout: Duration,

    /// How long an agent may have zero live connections before forfeiting
    pub disconnect_grace: Duration,

    /// Upper bound for the `timeout` query param on the event-wait endpoint
    pub event_wait_timeout_max: Duration,

    /// Cap on buffered matchmaker events per agent (oldest dropped beyond this)
    pub per_agent_event_buffer_max: usize,

    /// Broadcast backlog per match before a slow subscriber is dropped
    pub subscriber_backlog_max: usize,

    /// How long an ended match actor keeps serving reads before release
    pub ended_match_grace: Duration,

    /// Elo K factor for leaderboard updates
    pub rating_k_factor: f64,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key_pepper =
            env::var("API_KEY_PEPPER").context("`API_KEY_PEPPER` must be set")?;
        if api_key_pepper.is_empty() {
            bail!("`API_KEY_PEPPER` must be non-empty");
        }

        let admin_key = env::var("ADMIN_KEY").context("`ADMIN_KEY` must be set")?;
        if admin_key.is_empty() {
            bail!("`ADMIN_KEY` must be non-empty");
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://fightclaw.db".into()),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8787".into()),
            api_key_pepper,
            admin_key,
            cors_origin: env::var("CORS_ORIGIN").ok(),
            turn_timeout: Duration::from_millis(env_u64("MATCH_TURN_TIMEOUT_MS", 30_000)?),
            disconnect_grace: Duration::from_millis(env_u64(
                "MATCH_DISCONNECT_GRACE_MS",
                15_000,
            )?),
            event_wait_timeout_max: Duration::from_secs(env_u64(
                "EVENT_WAIT_TIMEOUT_MAX_S",
                30,
            )?),
            per_agent_event_buffer_max: env_u64("PER_AGENT_EVENT_BUFFER_MAX", 25)? as usize,
            subscriber_backlog_max: env_u64("SUBSCRIBER_BACKLOG_MAX", 256)? as usize,
            ended_match_grace: Duration::from_secs(env_u64("ENDED_MATCH_GRACE_S", 120)?),
            rating_k_factor: env_u64("RATING_K_FACTOR", 32)? as f64,
        })
    }

    /// A config suitable for tests: short timers, in-memory db
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            database_url: "sqlite::memory:".into(),
            bind_addr: "127.0.0.1:0".into(),
            api_key_pepper: "test-pepper".into(),
            admin_key: "test-admin".into(),
            cors_origin: None,
            turn_timeout: Duration::from_millis(400),
            disconnect_grace: Duration::from_millis(150),
            event_wait_timeout_max: Duration::from_secs(2),
            per_agent_event_buffer_max: 25,
            subscriber_backlog_max: 256,
            ended_match_grace: Duration::from_millis(100),
            rating_k_factor: 32.0,
        }
    }
}

fn env_u64(name: &str, default: u64) -> anyhow::Result<u64> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("`{name}` must be an integer, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_are_bounded() {
        let config = ServerConfig::for_tests();
        assert!(config.turn_timeout < Duration::from_secs(60));
        assert_eq!(config.per_agent_event_buffer_max, 25);
    }
}
