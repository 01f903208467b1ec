//! Unauthenticated spectator routes: featured/live pointers, leaderboard,
//! and the liveness probe

use axum::extract::{Query, State};
use axum::Json;
use itertools::Itertools;
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::error::ApiError;

/// `GET /healthz`
pub async fn healthz(State(app): State<AppState>) -> Result<Json<Value>, ApiError> {
    app.store.ping().await.map_err(|_| ApiError::Unavailable)?;
    Ok(Json(json!({"ok": true})))
}

/// `GET /v1/featured`: the most recently paired match, falling back to a
/// pending pairing still waiting for an opponent
pub async fn featured(State(app): State<AppState>) -> Result<Json<Value>, ApiError> {
    let snapshot = app.matchmaker.snapshot().await?;

    let (match_id, fallback_status) = match (snapshot.latest_match_id, snapshot.pending) {
        (Some(latest), _) => (latest, None),
        (None, Some((pending, _))) => (pending, Some("waiting")),
        (None, None) => return Ok(Json(json!({"ok": true}))),
    };

    let status = match app.store.get_match(&match_id).await? {
        Some(row) => row.status,
        None => fallback_status.unwrap_or("active").to_string(),
    };

    let players = app.store.get_match_players(&match_id).await?;
    let mut named = Vec::with_capacity(players.len());
    for player in players.iter().sorted_by_key(|p| p.seat) {
        let name = app
            .store
            .get_agent(&player.agent_id)
            .await?
            .map(|agent| agent.name);
        named.push(json!({
            "agentId": player.agent_id,
            "name": name,
            "seat": player.seat,
        }));
    }

    Ok(Json(json!({
        "ok": true,
        "matchId": match_id,
        "status": status,
        "players": named,
    })))
}

/// `GET /v1/live`: the latest match plus its authoritative snapshot,
/// when its actor is still around to answer
pub async fn live(State(app): State<AppState>) -> Result<Json<Value>, ApiError> {
    let snapshot = app.matchmaker.snapshot().await?;
    let Some(match_id) = snapshot.latest_match_id else {
        return Ok(Json(json!({"ok": true})));
    };

    let state = match app.registry.get(&match_id) {
        Some(handle) => handle.get_state().await.ok(),
        None => None,
    };

    Ok(Json(json!({
        "ok": true,
        "matchId": match_id,
        "state": state,
    })))
}

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    limit: Option<i64>,
}

/// `GET /v1/leaderboard?limit=`
pub async fn leaderboard(
    State(app): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let rows = app.store.leaderboard_top(limit).await?;
    Ok(Json(json!({
        "ok": true,
        "leaderboard": rows,
    })))
}
