mod auth;
mod config;
mod engine;
mod error;
mod events;
mod http;
mod matchmaker;
mod mtch;
mod rating;
mod store;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::ServerConfig;
use crate::http::AppState;
use crate::matchmaker::Matchmaker;
use crate::mtch::MatchRegistry;
use crate::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Arc::new(ServerConfig::from_env()?);

    // DB (runs migrations)
    info!("Connecting db and running migrations");
    let store = Store::connect(&config.database_url).await?;

    // Setup a task tracker; every actor lives on it
    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    let registry = MatchRegistry::new(
        store.clone(),
        config.clone(),
        tracker.clone(),
        token.clone(),
    );
    let matchmaker = Matchmaker::spawn(
        store.clone(),
        registry.clone(),
        config.per_agent_event_buffer_max,
        &tracker,
        token.clone(),
    );

    let app = AppState {
        store,
        config: config.clone(),
        matchmaker,
        registry,
    };
    let router = http::router(app);

    // Start the HTTP server
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("fightclaw server listening at {}", config.bind_addr);
    tracker.spawn({
        let token = token.clone();
        let serve =
            axum::serve(listener, router).with_graceful_shutdown(token.clone().cancelled_owned());
        async move {
            if let Err(err) = serve.await {
                error!("server error: {err}");
                token.cancel();
            }
        }
    });

    // Wait for shutdown signal...
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    // Then kill everything
    token.cancel();
    tracker.close();
    tracker.wait().await;

    Ok(())
}
