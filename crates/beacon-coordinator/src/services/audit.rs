use std::net::SocketAddr;

use axum::http::HeaderMap;
use serde_json::Value;
use tracing::warn;

use beacon_db::Database;

/// Append an audit event. Best-effort: a failed write is logged, never
/// surfaced to the caller.
pub fn write_audit(
    db: &Database,
    action: &str,
    resource_type: &str,
    resource_id: &str,
    actor_principal_id: Option<&str>,
    addr: Option<SocketAddr>,
    headers: Option<&HeaderMap>,
    metadata: Value,
) {
    let ip = addr.map(|addr| addr.ip().to_string());
    let user_agent = headers
        .and_then(|headers| headers.get("user-agent"))
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let metadata_json = serde_json::to_string(&metadata).unwrap_or_else(|_| "{}".to_string());

    if let Err(err) = db.insert_audit(
        actor_principal_id,
        action,
        resource_type,
        resource_id,
        ip.as_deref(),
        user_agent.as_deref(),
        &metadata_json,
    ) {
        warn!("Failed to write audit event {}: {}", action, err);
    }
}
