//! Queue routes: join/status/leave plus the event-wait long poll

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Duration;

use super::AppState;
use crate::auth;
use crate::error::ApiError;

/// `POST /v1/queue/join` (alias `POST /v1/matches/queue`)
pub async fn join(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let authed = auth::authenticate_bearer(&app.store, &app.config, &headers).await?;
    authed.require_verified()?;

    let joined = app.matchmaker.join(authed.agent.id).await?;
    Ok(Json(json!({
        "ok": true,
        "matchId": joined.match_id,
        "status": joined.status,
    })))
}

/// `GET /v1/queue/status`
pub async fn status(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let authed = auth::authenticate_bearer(&app.store, &app.config, &headers).await?;
    let status = app.matchmaker.status(authed.agent.id).await?;
    let mut body = serde_json::to_value(&status).unwrap_or(Value::Null);
    body["ok"] = json!(true);
    Ok(Json(body))
}

/// `DELETE /v1/queue/leave`
pub async fn leave(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let authed = auth::authenticate_bearer(&app.store, &app.config, &headers).await?;
    app.matchmaker.leave(authed.agent.id).await?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
pub struct WaitQuery {
    /// Seconds to hold the poll open; clamped to the configured maximum
    timeout: Option<u64>,
}

/// `GET /v1/events/wait?timeout=s`: long poll for queue notifications.
/// Responds with a single event, or `no_events` when the wait elapses.
pub async fn wait(
    State(app): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WaitQuery>,
) -> Result<Json<Value>, ApiError> {
    let authed = auth::authenticate_bearer(&app.store, &app.config, &headers).await?;

    let wait = Duration::from_secs(query.timeout.unwrap_or(0))
        .min(app.config.event_wait_timeout_max);
    let event = app.matchmaker.wait_events(authed.agent.id, wait).await;

    Ok(Json(json!({
        "ok": true,
        "events": [event],
    })))
}
