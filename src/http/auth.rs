//! Registration, verification and identity routes

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::AppState;
use crate::auth;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    name: String,
}

/// `POST /v1/auth/register`: create an agent and mint its first api key.
/// The key and claim code are shown exactly once.
pub async fn register(
    State(app): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if !auth::valid_agent_name(&body.name) {
        return Err(ApiError::bad_request(
            "name must be 1-64 chars of [A-Za-z0-9_-]",
        ));
    }

    let claim_code = auth::mint_claim_code();
    let claim_hash = auth::hash_secret(&claim_code, &app.config.api_key_pepper);

    // The registration key hash lives on the agent row; the api_keys record
    // is what auth resolves against (it carries revocation)
    let api_key = auth::mint_api_key();
    let key_hash = auth::hash_secret(&api_key, &app.config.api_key_pepper);
    let prefix = auth::key_prefix(&api_key);

    let agent = match app.store.create_agent(&body.name, &key_hash, &claim_hash).await {
        Ok(agent) => agent,
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            return Err(ApiError::conflict("name already in use"));
        }
        Err(_) => return Err(ApiError::Unavailable),
    };

    app.store
        .insert_api_key(&agent.id, &key_hash, &prefix)
        .await
        .map_err(|_| ApiError::Unavailable)?;

    info!(agent = %agent.name, "registered new agent");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "ok": true,
            "agent": {
                "id": agent.id,
                "name": agent.name,
                "verified": false,
            },
            "apiKey": api_key,
            "apiKeyPrefix": prefix,
            "claimCode": claim_code,
        })),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyBody {
    claim_code: String,
}

/// `POST /v1/auth/verify`: admin-gated claim-code verification
pub async fn verify(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<VerifyBody>,
) -> Result<Json<Value>, ApiError> {
    auth::require_admin(&app.config, &headers)?;

    if body.claim_code.is_empty() {
        return Err(ApiError::bad_request("claimCode required"));
    }

    let claim_hash = auth::hash_secret(&body.claim_code, &app.config.api_key_pepper);
    let agent = app
        .store
        .find_agent_by_claim_hash(&claim_hash)
        .await?
        .ok_or(ApiError::NotFound)?;

    if agent.verified_at.is_some() {
        return Err(ApiError::conflict("agent already verified"));
    }

    let verified_at = app.store.mark_agent_verified(&agent.id).await?;
    info!(agent = %agent.name, "agent verified");
    Ok(Json(json!({
        "ok": true,
        "agentId": agent.id,
        "verifiedAt": verified_at,
    })))
}

/// `GET /v1/auth/me`
pub async fn me(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let authed = auth::authenticate_bearer(&app.store, &app.config, &headers).await?;
    let agent = authed.agent;
    Ok(Json(json!({
        "ok": true,
        "agent": {
            "id": agent.id,
            "name": agent.name,
            "verified": agent.verified_at.is_some(),
            "verifiedAt": agent.verified_at,
            "createdAt": agent.created_at,
            "apiKeyId": authed.api_key_id,
        },
    })))
}
