//! Per-match routes: moves, snapshots, the two streaming transports, the
//! public event log and the admin finish.

use std::convert::Infallible;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::AppState;
use crate::auth;
use crate::engine::AgentId;
use crate::error::ApiError;
use crate::mtch::{ConnectionGuard, Subscription};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveBody {
    move_id: String,
    expected_version: u64,
    #[serde(rename = "move")]
    mv: Value,
}

/// `POST /v1/matches/:id/move`
///
/// The actor decides the outcome and its status code; retries with the same
/// `moveId` replay the stored response unchanged.
pub async fn submit_move(
    State(app): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<MoveBody>,
) -> Result<Response, ApiError> {
    let authed = auth::authenticate_bearer(&app.store, &app.config, &headers).await?;
    authed.require_verified()?;

    if body.move_id.is_empty() {
        return Err(ApiError::bad_request("moveId required"));
    }

    let handle = app.registry.get(&id).ok_or(ApiError::NotFound)?;
    let outcome = handle
        .submit_move(authed.agent.id, body.move_id, body.expected_version, body.mv)
        .await?;

    let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Ok((status, Json(outcome.body)).into_response())
}

/// `GET /v1/matches/:id/state`: public snapshot
pub async fn state(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let handle = app.registry.get(&id).ok_or(ApiError::NotFound)?;
    let snapshot = handle.get_state().await?;
    Ok(Json(json!({
        "ok": true,
        "state": snapshot,
    })))
}

/// `GET /v1/matches/:id/stream`: server-sent events transport.
/// A bearer key is optional; with one, `your_turn` events are delivered
/// to their addressee and the connection counts against disconnect grace.
pub async fn stream(
    State(app): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let (subscription, guard) = open_subscription(&app, &id, &headers).await?;

    let stream = futures::stream::unfold(
        (subscription, guard),
        |(mut subscription, guard)| async move {
            let event = subscription.next().await?;
            let sse = SseEvent::default().json_data(&event).ok()?;
            Some((Ok::<_, Infallible>(sse), (subscription, guard)))
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// `GET /v1/matches/:id/ws`: WebSocket transport carrying the same
/// envelope as the SSE stream, one JSON frame per event
pub async fn ws(
    State(app): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let (subscription, guard) = open_subscription(&app, &id, &headers).await?;
    Ok(upgrade.on_upgrade(move |socket| ws_session(socket, subscription, guard)))
}

async fn ws_session(
    mut socket: WebSocket,
    mut subscription: Subscription,
    _guard: Option<ConnectionGuard>,
) {
    loop {
        tokio::select! {
            event = subscription.next() => match event {
                Some(event) => {
                    let Ok(frame) = serde_json::to_string(&event) else { break };
                    if socket.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                // Stream over (game ended or subscriber dropped for lagging)
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Clients have nothing to say on this socket
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("ws session closed");
}

async fn open_subscription(
    app: &AppState,
    match_id: &str,
    headers: &HeaderMap,
) -> Result<(Subscription, Option<ConnectionGuard>), ApiError> {
    let authed = auth::authenticate_optional(&app.store, &app.config, headers).await?;
    let handle = app.registry.get(match_id).ok_or(ApiError::NotFound)?;

    let agent_id: Option<AgentId> = authed.map(|a| a.agent.id);
    let subscription = handle.subscribe(agent_id.clone()).await?;
    let guard = match agent_id {
        Some(agent_id) => handle.track_connection(agent_id).await.ok(),
        None => None,
    };
    Ok((subscription, guard))
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    limit: Option<i64>,
}

/// `GET /v1/matches/:id/log`: read the append-only event log
pub async fn log(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Value>, ApiError> {
    // Served from storage so it outlives the actor
    if app.store.get_match(&id).await?.is_none() {
        return Err(ApiError::NotFound);
    }

    let limit = query.limit.unwrap_or(500).clamp(1, 5_000);
    let rows = app.store.load_event_log(&id, limit).await?;
    let events: Vec<Value> = rows
        .into_iter()
        .map(|row| {
            let payload: Value =
                serde_json::from_str(&row.payload_json).unwrap_or(Value::Null);
            json!({
                "id": row.id,
                "turn": row.turn,
                "ts": row.ts,
                "eventType": row.event_type,
                "payload": payload,
            })
        })
        .collect();

    Ok(Json(json!({
        "ok": true,
        "matchId": id,
        "events": events,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ThoughtBody {
    thought: Value,
}

/// `POST /v1/matches/:id/thought`: opaque pass-through to spectators
pub async fn thought(
    State(app): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ThoughtBody>,
) -> Result<Json<Value>, ApiError> {
    let authed = auth::authenticate_bearer(&app.store, &app.config, &headers).await?;
    authed.require_verified()?;

    let handle = app.registry.get(&id).ok_or(ApiError::NotFound)?;
    require_participant(&app, &id, &authed.agent.id).await?;
    handle.publish_thought(authed.agent.id, body.thought).await?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
pub struct FinishBody {
    reason: Option<String>,
}

/// `POST /v1/matches/:id/finish`: admin override; idempotent
pub async fn finish(
    State(app): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<FinishBody>,
) -> Result<Json<Value>, ApiError> {
    auth::require_admin(&app.config, &headers)?;

    let handle = app.registry.get(&id).ok_or(ApiError::NotFound)?;
    let ended_now = handle
        .finish(body.reason.unwrap_or_else(|| "forfeit".into()))
        .await?;
    Ok(Json(json!({
        "ok": true,
        "alreadyEnded": !ended_now,
    })))
}

async fn require_participant(
    app: &AppState,
    match_id: &str,
    agent_id: &str,
) -> Result<(), ApiError> {
    let players = app.store.get_match_players(match_id).await?;
    if players.iter().any(|p| p.agent_id == agent_id) {
        return Ok(());
    }
    Err(ApiError::Forbidden)
}
