mod cli;
mod config;
mod handlers;
mod presence;
mod relay;
mod storage;
mod voice;
mod ws;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::cli::{Cli, Commands};
use crate::config::Config;
use crate::handlers::{
    emit, health_check, online_users, poll_events, poll_join, poll_send, stats, update_presence,
    user_presence,
};
use crate::storage::Storage;
use crate::ws::{websocket_handler, AppState};

#[tokio::main]
async fn main() {
    // Default to WARN if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Some(Commands::Debug {
        url,
        room,
        user,
        name,
    }) = cli.command
    {
        if let Err(e) = cli::run_debug_client(url, room, user, name).await {
            error!("debug client error: {}", e);
            std::process::exit(1);
        }
        return;
    }

    let config = Config::from_env();
    info!("starting lantern relay on port {}", config.port);
    info!("redis url: {}", config.redis_url);

    let storage = match Storage::new(&config.redis_url, config.presence_ttl_seconds) {
        Ok(storage) => storage,
        Err(e) => {
            error!("invalid redis url: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = storage.connect().await {
        error!("failed to connect to redis: {}", e);
        std::process::exit(1);
    }

    let state = AppState::new(config.clone(), storage);
    state.spawn_heartbeat_monitor();
    state.spawn_voice_reaper();

    let app = Router::new()
        .route("/ws/:room_id", get(websocket_handler))
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .route("/online-users", get(online_users))
        .route("/user-presence/:user_id", get(user_presence))
        .route("/update-presence", post(update_presence))
        .route("/emit", post(emit))
        .route("/poll/:id/join", post(poll_join))
        .route("/poll/:id/events", get(poll_events))
        .route("/poll/:id/send", post(poll_send))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("lantern relay listening on {}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("server error: {}", e);
        std::process::exit(1);
    }
}
