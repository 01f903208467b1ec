//! Thin axum adapters over the actors and the store
//!
//! Handlers parse/validate input, authenticate, and translate actor results
//! into the wire envelope. No game or queue logic lives here.

pub mod auth;
pub mod matches;
pub mod public;
pub mod queue;

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::config::ServerConfig;
use crate::matchmaker::MatchmakerHandle;
use crate::mtch::MatchRegistry;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub config: Arc<ServerConfig>,
    pub matchmaker: MatchmakerHandle,
    pub registry: MatchRegistry,
}

pub fn router(app: AppState) -> Router {
    let cors = cors_layer(&app.config);

    Router::new()
        .route("/healthz", get(public::healthz))
        .route("/v1/auth/register", post(auth::register))
        .route("/v1/auth/verify", post(auth::verify))
        .route("/v1/auth/me", get(auth::me))
        .route("/v1/queue/join", post(queue::join))
        // historical alias for join
        .route("/v1/matches/queue", post(queue::join))
        .route("/v1/queue/status", get(queue::status))
        .route("/v1/queue/leave", delete(queue::leave))
        .route("/v1/events/wait", get(queue::wait))
        .route("/v1/matches/{id}/move", post(matches::submit_move))
        .route("/v1/matches/{id}/state", get(matches::state))
        .route("/v1/matches/{id}/stream", get(matches::stream))
        .route("/v1/matches/{id}/ws", get(matches::ws))
        .route("/v1/matches/{id}/log", get(matches::log))
        .route("/v1/matches/{id}/thought", post(matches::thought))
        .route("/v1/matches/{id}/finish", post(matches::finish))
        .route("/v1/featured", get(public::featured))
        .route("/v1/live", get(public::live))
        .route("/v1/leaderboard", get(public::leaderboard))
        .layer(cors)
        .with_state(app)
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    match &config.cors_origin {
        Some(origin) => match origin.parse::<HeaderValue>() {
            Ok(origin) => CorsLayer::new()
                .allow_origin(origin)
                .allow_methods(Any)
                .allow_headers(Any),
            Err(_) => {
                warn!("unparseable CORS_ORIGIN {origin:?}, allowing any origin");
                CorsLayer::permissive()
            }
        },
        None => CorsLayer::permissive(),
    }
}
