mod config;
mod db;
mod error;
mod files;
mod paths;
mod routes;
mod state;
mod sync;

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use serde_json::json;
use socket2::{Domain, Protocol, Socket, Type};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::state::{AppState, AppStateInner};

async fn index() -> Json<serde_json::Value> {
    Json(json!({ "service": "agent", "status": "ok" }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": "agent" }))
}

fn seed_default_share(state: &AppState) -> anyhow::Result<()> {
    std::fs::create_dir_all(&state.config.default_share_root)?;
    std::fs::create_dir_all(&state.config.inbox_dir)?;
    if state
        .db
        .get_local_share(&state.config.default_share_id)?
        .is_none()
    {
        state.db.upsert_local_share(
            &state.config.default_share_id,
            &state.config.default_share_name,
            &state.config.default_share_root.to_string_lossy(),
            false,
        )?;
    }
    Ok(())
}

async fn announce_and_heartbeat(state: AppState) {
    let shares = match state.db.list_local_shares() {
        Ok(shares) => shares,
        Err(err) => {
            tracing::warn!("Failed to load local shares for registration: {}", err);
            return;
        }
    };
    let payload: Vec<serde_json::Value> = shares
        .iter()
        .map(|share| {
            json!({
                "share_id": share.id,
                "name": share.name,
                "root_path": share.root_path,
                "read_only": share.read_only,
            })
        })
        .collect();
    state.coordinator.register(payload).await;

    let interval = Duration::from_secs(state.config.heartbeat_interval_seconds.max(5));
    loop {
        tokio::time::sleep(interval).await;
        state.coordinator.heartbeat().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon_agent=debug,tower_http=debug".into()),
        )
        .init();

    let config = match config::load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("FATAL: {err}");
            eprintln!("       These must match the coordinator's secrets.");
            eprintln!("       Set them in your .env file and restart.");
            std::process::exit(1);
        }
    };

    let db = db::AgentDb::open(&config.state_db_path)?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let chunk_cap = config.upload_chunk_max_bytes as usize;
    let state: AppState = AppStateInner::new(db, config);
    seed_default_share(&state)?;

    // Register with the coordinator and keep the heartbeat alive. Skipped
    // until pairing has produced an owner principal.
    let heartbeat_task = if state.config.owner_principal_id.is_empty() {
        info!("No owner principal configured; running unannounced");
        None
    } else {
        Some(tokio::spawn(announce_and_heartbeat(state.clone())))
    };

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    let agent_api = Router::new()
        .route(
            "/shares/{share_id}/list",
            get(routes::shares::list_share_files),
        )
        .route(
            "/shares/{share_id}/search",
            get(routes::shares::search_share_files),
        )
        .route(
            "/shares/{share_id}/stream",
            get(routes::shares::stream_share_file),
        )
        .route(
            "/shares/{share_id}/download",
            get(routes::shares::download_share_file),
        )
        .route(
            "/inbox/transfers/{transfer_id}/status",
            get(routes::inbox::transfer_status),
        )
        .route(
            "/inbox/transfers/{transfer_id}/pause",
            post(routes::inbox::pause_transfer),
        )
        .route(
            "/inbox/transfers/{transfer_id}/resume",
            post(routes::inbox::resume_transfer),
        )
        .route(
            "/inbox/transfers/{transfer_id}/chunk",
            post(routes::inbox::upload_chunk),
        )
        .route(
            "/inbox/transfers/{transfer_id}/commit",
            post(routes::inbox::commit_transfer_item),
        )
        .route(
            "/inbox/transfers/{transfer_id}/finalize",
            post(routes::inbox::finalize_transfer_item),
        );

    let app = Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .nest("/agent/v1", agent_api)
        // Chunk bodies are capped separately inside the handler; the HTTP
        // limit just needs headroom above the configured chunk size.
        .layer(DefaultBodyLimit::max(chunk_cap + 64 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    info!("Beacon agent listening on {}", addr);
    info!(
        "Serving share '{}' from {}",
        state.config.default_share_name,
        state.config.default_share_root.display()
    );

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

    if let Some(task) = heartbeat_task {
        task.abort();
    }
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
