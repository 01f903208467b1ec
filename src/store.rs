//! Narrow persistence surface over sqlite
//!
//! Every caller goes through one of these operation-specific methods; nothing
//! else in the crate issues SQL. Writers are guarded by primary keys or are
//! append-only, so retries are safe.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;

use crate::engine::AgentId;
use crate::mtch::MatchId;

pub type Db = Pool<Sqlite>;

pub const DEFAULT_RATING: i64 = 1500;

#[derive(Debug, Clone, FromRow)]
pub struct AgentRow {
    pub id: String,
    pub name: String,
    /// Hash of the key minted at registration; per-key records (including
    /// revocations) live in `api_keys`, which is what auth resolves against
    pub api_key_hash: String,
    pub claim_code_hash: String,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct MatchRow {
    pub id: String,
    pub status: String,
    pub seed: i64,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub winner_agent_id: Option<String>,
    pub end_reason: Option<String>,
    pub final_state_version: Option<i64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct MatchPlayerRow {
    pub match_id: String,
    pub agent_id: String,
    pub seat: i64,
    pub starting_rating: i64,
}

#[derive(Debug, Clone, FromRow, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRow {
    pub id: i64,
    pub match_id: String,
    pub turn: i64,
    pub ts: DateTime<Utc>,
    pub event_type: String,
    pub payload_json: String,
}

#[derive(Debug, Clone, FromRow, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardRow {
    pub agent_id: String,
    pub rating: i64,
    pub wins: i64,
    pub losses: i64,
    pub games_played: i64,
    pub updated_at: DateTime<Utc>,
}

/// One side's leaderboard mutation when a match ends
#[derive(Debug, Clone)]
pub struct LeaderboardUpdate {
    pub agent_id: AgentId,
    pub new_rating: i64,
    pub won: bool,
    pub lost: bool,
}

#[derive(Clone)]
pub struct Store {
    db: Db,
}

impl Store {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let db = Db::connect_with(
            SqliteConnectOptions::from_str(database_url)?.create_if_missing(true),
        )
        .await?;
        sqlx::migrate!().run(&db).await?;
        Ok(Self { db })
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.db).await?;
        Ok(())
    }

    // --- agents & keys ------------------------------------------------------

    pub async fn create_agent(
        &self,
        name: &str,
        api_key_hash: &str,
        claim_code_hash: &str,
    ) -> Result<AgentRow, sqlx::Error> {
        let agent = AgentRow {
            id: new_id(),
            name: name.to_string(),
            api_key_hash: api_key_hash.to_string(),
            claim_code_hash: claim_code_hash.to_string(),
            verified_at: None,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO agents (id, name, api_key_hash, claim_code_hash, verified_at, created_at)
             VALUES (?, ?, ?, ?, NULL, ?)",
        )
        .bind(&agent.id)
        .bind(&agent.name)
        .bind(&agent.api_key_hash)
        .bind(&agent.claim_code_hash)
        .bind(agent.created_at)
        .execute(&self.db)
        .await?;
        Ok(agent)
    }

    pub async fn insert_api_key(
        &self,
        agent_id: &str,
        key_hash: &str,
        key_prefix: &str,
    ) -> Result<String, sqlx::Error> {
        let id = new_id();
        sqlx::query(
            "INSERT INTO api_keys (id, agent_id, key_hash, key_prefix, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(agent_id)
        .bind(key_hash)
        .bind(key_prefix)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;
        Ok(id)
    }

    /// Resolve a presented (already hashed) bearer key to its agent.
    /// Revoked keys never match.
    pub async fn find_agent_by_key_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<(AgentRow, String)>, sqlx::Error> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT agent_id, id FROM api_keys WHERE key_hash = ? AND revoked_at IS NULL",
        )
        .bind(key_hash)
        .fetch_optional(&self.db)
        .await?;

        let Some((agent_id, api_key_id)) = row else {
            return Ok(None);
        };
        let agent = self.get_agent(&agent_id).await?;
        Ok(agent.map(|a| (a, api_key_id)))
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRow>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM agents WHERE id = ?")
            .bind(agent_id)
            .fetch_optional(&self.db)
            .await
    }

    pub async fn find_agent_by_claim_hash(
        &self,
        claim_code_hash: &str,
    ) -> Result<Option<AgentRow>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM agents WHERE claim_code_hash = ?")
            .bind(claim_code_hash)
            .fetch_optional(&self.db)
            .await
    }

    pub async fn mark_agent_verified(
        &self,
        agent_id: &str,
    ) -> Result<DateTime<Utc>, sqlx::Error> {
        let now = Utc::now();
        sqlx::query("UPDATE agents SET verified_at = ? WHERE id = ?")
            .bind(now)
            .bind(agent_id)
            .execute(&self.db)
            .await?;
        Ok(now)
    }

    // --- matches ------------------------------------------------------------

    pub async fn record_match_created(
        &self,
        match_id: &MatchId,
        seed: u64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR IGNORE INTO matches (id, status, seed, created_at)
             VALUES (?, 'active', ?, ?)",
        )
        .bind(match_id)
        .bind(seed as i64)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn record_match_players(
        &self,
        match_id: &MatchId,
        players: &[(AgentId, i64, i64)],
    ) -> Result<(), sqlx::Error> {
        for (agent_id, seat, starting_rating) in players {
            sqlx::query(
                "INSERT OR IGNORE INTO match_players (match_id, agent_id, seat, starting_rating)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(match_id)
            .bind(agent_id)
            .bind(seat)
            .bind(starting_rating)
            .execute(&self.db)
            .await?;
        }
        Ok(())
    }

    pub async fn get_match(&self, match_id: &str) -> Result<Option<MatchRow>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM matches WHERE id = ?")
            .bind(match_id)
            .fetch_optional(&self.db)
            .await
    }

    pub async fn get_match_players(
        &self,
        match_id: &str,
    ) -> Result<Vec<MatchPlayerRow>, sqlx::Error> {
        sqlx::query_as(
            "SELECT match_id, agent_id, seat, starting_rating
             FROM match_players WHERE match_id = ? ORDER BY seat",
        )
        .bind(match_id)
        .fetch_all(&self.db)
        .await
    }

    // --- event log ----------------------------------------------------------

    /// Strictly append-only; the autoincrement pk gives per-match ordering
    pub async fn append_event(
        &self,
        match_id: &MatchId,
        turn: u32,
        event_type: &str,
        payload: &Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO match_events (match_id, turn, ts, event_type, payload_json)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(match_id)
        .bind(turn as i64)
        .bind(Utc::now())
        .bind(event_type)
        .bind(payload.to_string())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn load_event_log(
        &self,
        match_id: &str,
        limit: i64,
    ) -> Result<Vec<EventRow>, sqlx::Error> {
        sqlx::query_as(
            "SELECT id, match_id, turn, ts, event_type, payload_json
             FROM match_events WHERE match_id = ? ORDER BY id ASC LIMIT ?",
        )
        .bind(match_id)
        .bind(limit)
        .fetch_all(&self.db)
        .await
    }

    // --- results & leaderboard ----------------------------------------------

    pub async fn get_rating(&self, agent_id: &str) -> Result<i64, sqlx::Error> {
        let rating: Option<(i64,)> =
            sqlx::query_as("SELECT rating FROM leaderboard WHERE agent_id = ?")
                .bind(agent_id)
                .fetch_optional(&self.db)
                .await?;
        Ok(rating.map(|(r,)| r).unwrap_or(DEFAULT_RATING))
    }

    /// Termination writes: result row, both leaderboard rows and the match's
    /// `ended` flip, all in one transaction. `INSERT OR IGNORE` on the result
    /// row makes a retried call a no-op.
    pub async fn record_match_ended(
        &self,
        match_id: &MatchId,
        winner: Option<&AgentId>,
        loser: Option<&AgentId>,
        reason: &str,
        final_state_version: u64,
        updates: &[LeaderboardUpdate],
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO match_results
             (match_id, winner_agent_id, loser_agent_id, reason, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(match_id)
        .bind(winner)
        .bind(loser)
        .bind(reason)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        // A result row already present means a retry of a completed write;
        // the leaderboard must move exactly once per match
        if inserted.rows_affected() == 0 {
            return tx.commit().await;
        }

        for update in updates {
            sqlx::query(
                "INSERT INTO leaderboard (agent_id, rating, wins, losses, games_played, updated_at)
                 VALUES (?, ?, ?, ?, 1, ?)
                 ON CONFLICT (agent_id) DO UPDATE SET
                   rating = excluded.rating,
                   wins = leaderboard.wins + excluded.wins,
                   losses = leaderboard.losses + excluded.losses,
                   games_played = leaderboard.games_played + 1,
                   updated_at = excluded.updated_at",
            )
            .bind(&update.agent_id)
            .bind(update.new_rating)
            .bind(update.won as i64)
            .bind(update.lost as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE matches SET status = 'ended', ended_at = ?, winner_agent_id = ?,
             end_reason = ?, final_state_version = ? WHERE id = ? AND status = 'active'",
        )
        .bind(now)
        .bind(winner)
        .bind(reason)
        .bind(final_state_version as i64)
        .bind(match_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await
    }

    pub async fn leaderboard_top(&self, limit: i64) -> Result<Vec<LeaderboardRow>, sqlx::Error> {
        sqlx::query_as(
            "SELECT agent_id, rating, wins, losses, games_played, updated_at
             FROM leaderboard ORDER BY rating DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await
    }
}

/// Text v7 uuids, matching the id scheme used for matches
fn new_id() -> String {
    uuid::Uuid::now_v7().hyphenated().to_string()
}

#[cfg(test)]
pub async fn test_store() -> Store {
    use sqlx::sqlite::SqlitePoolOptions;

    // A pooled `sqlite::memory:` with >1 connection would hand each
    // connection its own empty database
    let db = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!().run(&db).await.unwrap();
    Store::new(db)
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_agent_roundtrip() {
        let store = test_store().await;
        let agent = store
            .create_agent("alpha", "keyhash", "claimhash")
            .await
            .unwrap();
        assert!(agent.verified_at.is_none());
        assert_eq!(agent.api_key_hash, "keyhash");

        store.insert_api_key(&agent.id, "keyhash", "fc_sk_ab").await.unwrap();
        let (found, _key_id) = store
            .find_agent_by_key_hash("keyhash")
            .await
            .unwrap()
            .expect("agent resolvable by key hash");
        assert_eq!(found.id, agent.id);

        store.mark_agent_verified(&agent.id).await.unwrap();
        let reread = store.get_agent(&agent.id).await.unwrap().unwrap();
        assert!(reread.verified_at.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let store = test_store().await;
        store.create_agent("alpha", "k1", "h1").await.unwrap();
        assert!(store.create_agent("alpha", "k2", "h2").await.is_err());
    }

    #[tokio::test]
    async fn test_event_log_is_ordered() {
        let store = test_store().await;
        let match_id: MatchId = "m1".into();
        for turn in 0..5u32 {
            store
                .append_event(&match_id, turn, "move_applied", &serde_json::json!({"n": turn}))
                .await
                .unwrap();
        }

        let rows = store.load_event_log("m1", 100).await.unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_match_end_is_idempotent() {
        let store = test_store().await;
        let match_id: MatchId = "m1".into();
        store.record_match_created(&match_id, 7).await.unwrap();

        let updates = [
            LeaderboardUpdate {
                agent_id: "alpha".into(),
                new_rating: 1516,
                won: true,
                lost: false,
            },
            LeaderboardUpdate {
                agent_id: "beta".into(),
                new_rating: 1484,
                won: false,
                lost: true,
            },
        ];
        let winner = Some("alpha".to_string());
        let loser = Some("beta".to_string());

        store
            .record_match_ended(&match_id, winner.as_ref(), loser.as_ref(), "terminal", 9, &updates)
            .await
            .unwrap();
        // Retry: result row untouched, match stays ended
        store
            .record_match_ended(&match_id, winner.as_ref(), loser.as_ref(), "terminal", 9, &updates)
            .await
            .unwrap();

        let row = store.get_match("m1").await.unwrap().unwrap();
        assert_eq!(row.status, "ended");
        assert_eq!(row.winner_agent_id.as_deref(), Some("alpha"));

        let top = store.leaderboard_top(10).await.unwrap();
        assert_eq!(top[0].agent_id, "alpha");
        assert_eq!(top[0].rating, 1516);
    }

    #[tokio::test]
    async fn test_rating_defaults() {
        let store = test_store().await;
        assert_eq!(store.get_rating("nobody").await.unwrap(), DEFAULT_RATING);
    }
}
