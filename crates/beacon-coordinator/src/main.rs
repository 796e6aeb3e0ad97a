mod auth;
mod config;
mod error;
mod routes;
mod services;
mod state;
mod views;

use std::net::SocketAddr;

use axum::{
    Json, Router,
    routing::{get, post},
};
use serde_json::json;
use socket2::{Domain, Protocol, Socket, Type};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::state::{AppState, AppStateInner};

/// Root discovery signature probed by launchers sweeping the LAN.
async fn index() -> Json<serde_json::Value> {
    Json(json!({ "service": "coordinator", "status": "ok" }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": "coordinator" }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon_coordinator=debug,tower_http=debug".into()),
        )
        .init();

    let config = match config::load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("FATAL: {err}");
            eprintln!("       Generate a strong random value: openssl rand -base64 48");
            eprintln!("       Set it in your .env file and restart.");
            std::process::exit(1);
        }
    };

    let db = beacon_db::Database::open(&config.database_path)?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let state: AppState = AppStateInner::new(db, config);

    // CORS -- permissive: browsers on arbitrary LAN addresses talk to us.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    let api = Router::new()
        .route("/pairing/start", post(routes::pairing::start_pairing))
        .route("/pairing/confirm", post(routes::pairing::confirm_pairing))
        .route("/auth/token", post(routes::auth::issue_token))
        .route("/auth/me", get(routes::auth::me))
        .route("/catalog/devices", get(routes::catalog::list_devices))
        .route(
            "/catalog/devices/{device_id}/visibility",
            post(routes::catalog::set_visibility),
        )
        .route("/catalog/shares", get(routes::catalog::list_shares))
        .route("/files/list", get(routes::files::list_files))
        .route("/files/search", get(routes::files::search_files))
        .route(
            "/transfers",
            post(routes::transfers::create_transfer).get(routes::transfers::list_transfers),
        )
        .route(
            "/transfers/history/clear",
            post(routes::transfers::clear_history),
        )
        .route(
            "/transfers/pending/cancel",
            post(routes::transfers::cancel_pending),
        )
        .route("/transfers/{transfer_id}", get(routes::transfers::get_transfer))
        .route(
            "/transfers/{transfer_id}/approve",
            post(routes::transfers::approve_transfer),
        )
        .route(
            "/transfers/{transfer_id}/reject",
            post(routes::transfers::reject_transfer),
        )
        .route(
            "/transfers/{transfer_id}/passcode/open",
            post(routes::transfers::open_passcode),
        )
        .route(
            "/internal/agents/register",
            post(routes::catalog::register_agent),
        )
        .route(
            "/internal/agents/{device_id}/heartbeat",
            post(routes::catalog::heartbeat_agent),
        )
        .route(
            "/internal/transfers/{transfer_id}/items/{item_id}/state",
            post(routes::transfers::update_item_state),
        )
        .route(
            "/internal/transfers/{transfer_id}/items/{item_id}",
            get(routes::transfers::get_item_manifest),
        )
        .route("/events/token", get(routes::events::ws_token))
        .route("/events/ws", get(routes::events::events_ws));

    let app = Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    info!("Beacon coordinator listening on {}", addr);

    // Listener via socket2 for address reuse, backlog, and TCP_NODELAY.
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nodelay(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(socket.into())?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    state.broker.close_all(1001);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
