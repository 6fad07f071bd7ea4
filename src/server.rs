use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use axum::{debug_handler, extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use tokio::{net::TcpListener, task::JoinHandle, time::MissedTickBehavior};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::{
    config::Config,
    db::SqliteStore,
    hub::{ChatHub, Collaborators},
    invitations,
    rest::{RestAuth, RestClient, RestDirectory},
    rooms, ws, AppState,
};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::chat_ws))
        .merge(invitations::router())
        .merge(rooms::router())
        .with_state(state)
        .layer(CorsLayer::permissive())
}

#[debug_handler(state = crate::AppState)]
async fn health(State(hub): State<Arc<ChatHub>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": hub.registry.len().await,
        "rooms": hub.rooms.room_count().await,
        "persistFailures": hub.relay.persist_failures(),
    }))
}

/// The SQLite store backs history and invitations. Auth and directory
/// lookups go to the REST services when `DIRECTORY_URL` is set.
pub async fn collaborators(config: &Config) -> anyhow::Result<Collaborators> {
    let store = SqliteStore::connect(&config.database_url).await?;
    let mut collaborators = Collaborators::sqlite(store);

    if let Some(url) = &config.directory_url {
        let token = config
            .directory_service_token
            .clone()
            .ok_or_else(|| anyhow!("DIRECTORY_SERVICE_TOKEN is required with DIRECTORY_URL"))?;
        let client = RestClient::new(url)?;
        collaborators.auth = Arc::new(RestAuth::new(client.clone()));
        collaborators.directory = Arc::new(RestDirectory::new(client, token));
        info!(%url, "using REST directory");
    }
    Ok(collaborators)
}

pub fn state(config: Config, collaborators: Collaborators) -> AppState {
    AppState {
        hub: Arc::new(ChatHub::new(collaborators, &config)),
        config: Arc::new(config),
    }
}

pub fn spawn_reaper(hub: Arc<ChatHub>, idle_timeout: Duration, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            hub.reap_idle(idle_timeout).await;
        }
    })
}

pub async fn serve(config: Config) -> anyhow::Result<()> {
    let collaborators = collaborators(&config).await?;
    let bind_addr = config.bind_addr.clone();
    let (idle_timeout, reap_interval) = (config.idle_timeout, config.reap_interval);
    let state = state(config, collaborators);

    let reaper = spawn_reaper(Arc::clone(&state.hub), idle_timeout, reap_interval);

    let listener = TcpListener::bind(&bind_addr).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reaper.abort();
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
