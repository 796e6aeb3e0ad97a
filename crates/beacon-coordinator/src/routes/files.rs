use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::debug;

use beacon_db::models::{AgentDeviceRow, ShareRow};
use beacon_ticket::PermissionSet;
use beacon_types::models::{FileEntry, ListingPayload, SearchPayload, SearchShareError, ShareAccess};

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::services::acl::{get_permissions_for_shares, require_permission};
use crate::state::AppState;

/// Percent-encode a query-string value (RFC 3986 unreserved set passes
/// through).
fn encode_query_component(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

fn build_file_urls(base_url: &str, share_id: &str, path: &str, ticket: &str) -> (String, String) {
    let base = base_url.trim_end_matches('/');
    let path = encode_query_component(path);
    let ticket = encode_query_component(ticket);
    (
        format!("{base}/agent/v1/shares/{share_id}/stream?path={path}&ticket={ticket}"),
        format!("{base}/agent/v1/shares/{share_id}/download?path={path}&ticket={ticket}"),
    )
}

fn annotate_urls(item: &mut FileEntry, base_url: &str, share_id: &str, ticket: &str, can_download: bool) {
    if item.is_dir {
        return;
    }
    let (stream_url, download_url) = build_file_urls(base_url, share_id, &item.path, ticket);
    item.stream_url = Some(stream_url);
    if can_download {
        item.download_url = Some(download_url);
    }
}

fn check_browse_pin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.config.browse_pin.as_deref() else {
        return Ok(());
    };
    let provided = headers
        .get("x-browse-pin")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if provided != expected {
        return Err(ApiError::Unauthorized("Browse PIN required".into()));
    }
    Ok(())
}

fn parse_flag(raw: Option<&str>, default: bool) -> bool {
    match raw.map(|value| value.trim().to_ascii_lowercase()) {
        Some(value) if !value.is_empty() => matches!(value.as_str(), "1" | "true" | "yes" | "on"),
        _ => default,
    }
}

/// Resolve a (device, share) pair the caller may browse: share must belong
/// to the device, the device must be visible to the caller and online.
fn resolve_online_share(
    state: &AppState,
    auth: &AuthContext,
    device_id: &str,
    share_id: &str,
) -> Result<(AgentDeviceRow, ShareRow), ApiError> {
    let share = state
        .db
        .get_share(share_id)?
        .ok_or_else(|| ApiError::NotFound("Share not found".into()))?;
    if share.agent_device_id != device_id {
        return Err(ApiError::BadRequest(
            "Share does not belong to device".into(),
        ));
    }
    let device = state
        .db
        .get_agent_device(device_id)?
        .ok_or_else(|| ApiError::NotFound("Device not found".into()))?;
    if !device.visibility && device.owner_principal_id != auth.principal_id {
        return Err(ApiError::NotFound("Device not found".into()));
    }
    if !device.is_online() {
        return Err(ApiError::Unavailable("Device is offline".into()));
    }
    Ok((device, share))
}

#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    pub device_id: String,
    pub share_id: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub max_results: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ScopedListing {
    #[serde(flatten)]
    pub payload: ListingPayload,
    pub device_id: String,
    pub share_id: String,
    pub permissions: Vec<String>,
}

/// GET /api/v1/files/list -- proxy a directory listing from one share,
/// annotating entries with ticket-bearing URLs.
pub async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<ListFilesQuery>,
    headers: HeaderMap,
    auth: AuthContext,
) -> Result<Json<ScopedListing>, ApiError> {
    check_browse_pin(&state, &headers)?;
    let max_results = query.max_results.unwrap_or(300);
    if !(50..=5000).contains(&max_results) {
        return Err(ApiError::BadRequest("max_results out of range".into()));
    }

    let (device, share) = resolve_online_share(&state, &auth, &query.device_id, &query.share_id)?;
    let permissions = require_permission(&state.db, &auth.principal_id, &share, "read")?;
    let ticket = beacon_ticket::issue_read_ticket(
        &state.config.secret_key,
        &auth.principal_id,
        &share.id,
        &permissions,
        state.config.read_ticket_ttl_seconds,
    );

    let mut payload = state
        .agents
        .list_share(&device.base_url, &share.id, &query.path, &ticket, max_results)
        .await?;
    let can_download = permissions.contains("download");
    for item in &mut payload.items {
        annotate_urls(item, &device.base_url, &share.id, &ticket, can_download);
    }

    Ok(Json(ScopedListing {
        payload,
        device_id: device.id,
        share_id: share.id,
        permissions: permissions.iter().cloned().collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct SearchFilesQuery {
    pub q: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub share_id: Option<String>,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub recursive: Option<String>,
    #[serde(default)]
    pub compact: Option<String>,
    #[serde(default)]
    pub max_shares: Option<usize>,
    #[serde(default)]
    pub max_results_per_share: Option<usize>,
    #[serde(default)]
    pub max_results_total: Option<usize>,
    #[serde(default)]
    pub timeout_budget_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ScopedSearch {
    #[serde(flatten)]
    pub payload: SearchPayload,
    pub device_id: String,
    pub share_id: String,
    pub permissions: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FederatedSearch {
    pub query: String,
    pub base_path: String,
    pub recursive: bool,
    pub federated: bool,
    pub items: Vec<FileEntry>,
    pub truncated: bool,
    pub errors: Vec<SearchShareError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_map: Option<BTreeMap<String, ShareAccess>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SearchResponse {
    Scoped(Box<ScopedSearch>),
    Federated(Box<FederatedSearch>),
}

struct FanoutOutcome {
    device_id: String,
    share_id: String,
    device_name: String,
    share_name: String,
    base_url: String,
    ticket: String,
    permissions: PermissionSet,
    result: Result<SearchPayload, ApiError>,
}

/// GET /api/v1/files/search -- single-share search when device_id+share_id
/// are given, otherwise a parallel fan-out across every readable online
/// share under a global time budget.
pub async fn search_files(
    State(state): State<AppState>,
    Query(query): Query<SearchFilesQuery>,
    headers: HeaderMap,
    auth: AuthContext,
) -> Result<Json<SearchResponse>, ApiError> {
    check_browse_pin(&state, &headers)?;

    let q = query.q.trim().to_string();
    if q.is_empty() || q.len() > 120 {
        return Err(ApiError::BadRequest("Invalid search query".into()));
    }
    let recursive = parse_flag(query.recursive.as_deref(), true);
    let compact = parse_flag(query.compact.as_deref(), false);
    let max_shares = query.max_shares.unwrap_or(30);
    let max_results_per_share = query.max_results_per_share.unwrap_or(200);
    let max_results_total = query.max_results_total.unwrap_or(800);
    let timeout_budget_ms = query.timeout_budget_ms.unwrap_or(6000);
    if !(1..=200).contains(&max_shares)
        || !(10..=1000).contains(&max_results_per_share)
        || !(20..=5000).contains(&max_results_total)
        || !(500..=20000).contains(&timeout_budget_ms)
    {
        return Err(ApiError::BadRequest("Search caps out of range".into()));
    }

    // Single-share path: same authorization, no fan-out.
    if let (Some(device_id), Some(share_id)) = (query.device_id.as_deref(), query.share_id.as_deref())
    {
        let (device, share) = resolve_online_share(&state, &auth, device_id, share_id)?;
        let permissions = require_permission(&state.db, &auth.principal_id, &share, "read")?;
        let ticket = beacon_ticket::issue_read_ticket(
            &state.config.secret_key,
            &auth.principal_id,
            &share.id,
            &permissions,
            state.config.read_ticket_ttl_seconds,
        );
        let mut payload = state
            .agents
            .search_share(
                &device.base_url,
                &share.id,
                &query.path,
                &q,
                recursive,
                &ticket,
                max_results_per_share.min(max_results_total),
            )
            .await?;
        let can_download = permissions.contains("download");
        for item in &mut payload.items {
            annotate_urls(item, &device.base_url, &share.id, &ticket, can_download);
        }
        return Ok(Json(SearchResponse::Scoped(Box::new(ScopedSearch {
            payload,
            device_id: device.id,
            share_id: share.id,
            permissions: permissions.iter().cloned().collect(),
        }))));
    }

    // Enumerate candidate shares: visible, online, readable.
    let rows = state.db.list_shares_with_devices(None)?;
    let mut owner_map = HashMap::new();
    let mut visible: Vec<(ShareRow, AgentDeviceRow)> = Vec::new();
    for (share, device) in rows {
        if !device.visibility && device.owner_principal_id != auth.principal_id {
            continue;
        }
        if !device.is_online() {
            continue;
        }
        owner_map.insert(share.id.clone(), device.owner_principal_id.clone());
        visible.push((share, device));
    }

    let shares: Vec<ShareRow> = visible.iter().map(|(share, _)| share.clone()).collect();
    let permissions_by_share =
        get_permissions_for_shares(&state.db, &auth.principal_id, &shares, &owner_map)?;

    let mut candidates = Vec::new();
    for (share, device) in visible {
        let Some(permissions) = permissions_by_share.get(&share.id) else {
            continue;
        };
        if !permissions.contains("read") {
            continue;
        }
        candidates.push((device, share, permissions.clone()));
        if candidates.len() >= max_shares {
            break;
        }
    }

    if candidates.is_empty() {
        return Ok(Json(SearchResponse::Federated(Box::new(FederatedSearch {
            query: q,
            base_path: query.path,
            recursive,
            federated: true,
            items: vec![],
            truncated: false,
            errors: vec![],
            access_map: compact.then(BTreeMap::new),
        }))));
    }

    let mut join_set: JoinSet<FanoutOutcome> = JoinSet::new();
    for (device, share, permissions) in candidates {
        let limiter = state.search_limiter.clone();
        let agents = state.agents.clone();
        let secret_key = state.config.secret_key.clone();
        let ticket_ttl = state.config.read_ticket_ttl_seconds;
        let principal_id = auth.principal_id.clone();
        let path = query.path.clone();
        let q = q.clone();
        join_set.spawn(async move {
            let _permit = limiter.acquire_owned().await;
            let ticket = beacon_ticket::issue_read_ticket(
                &secret_key,
                &principal_id,
                &share.id,
                &permissions,
                ticket_ttl,
            );
            let result = agents
                .search_share(
                    &device.base_url,
                    &share.id,
                    &path,
                    &q,
                    recursive,
                    &ticket,
                    max_results_per_share,
                )
                .await;
            FanoutOutcome {
                device_id: device.id,
                share_id: share.id,
                device_name: device.name,
                share_name: share.name,
                base_url: device.base_url,
                ticket,
                permissions,
                result,
            }
        });
    }

    let deadline = Instant::now() + Duration::from_millis(timeout_budget_ms);
    let mut items: Vec<FileEntry> = Vec::new();
    let mut errors: Vec<SearchShareError> = Vec::new();
    let mut access_map: BTreeMap<String, ShareAccess> = BTreeMap::new();
    let mut truncated = false;

    loop {
        let joined = match timeout_at(deadline, join_set.join_next()).await {
            Ok(joined) => joined,
            Err(_) => {
                truncated = true;
                break;
            }
        };
        let Some(joined) = joined else {
            break;
        };
        let Ok(outcome) = joined else {
            // A cancelled or panicked fan-out task contributes nothing.
            debug!("search fan-out task did not complete");
            continue;
        };

        let payload = match outcome.result {
            Ok(payload) => payload,
            Err(err) => {
                errors.push(SearchShareError {
                    device_id: outcome.device_id,
                    share_id: outcome.share_id,
                    error: err.to_string(),
                });
                continue;
            }
        };

        if payload.truncated {
            truncated = true;
        }
        let can_download = outcome.permissions.contains("download");
        if compact {
            access_map.insert(
                outcome.share_id.clone(),
                ShareAccess {
                    device_id: outcome.device_id.clone(),
                    share_id: outcome.share_id.clone(),
                    agent_base_url: outcome.base_url.clone(),
                    ticket: outcome.ticket.clone(),
                    permissions: outcome.permissions.iter().cloned().collect(),
                    can_download,
                    expires_in: state.config.read_ticket_ttl_seconds.max(0) as u64,
                },
            );
        }
        for mut item in payload.items.into_iter().take(max_results_per_share) {
            item.device_id = Some(outcome.device_id.clone());
            item.share_id = Some(outcome.share_id.clone());
            item.share_name = Some(outcome.share_name.clone());
            item.device_name = Some(outcome.device_name.clone());
            if !compact {
                annotate_urls(
                    &mut item,
                    &outcome.base_url,
                    &outcome.share_id,
                    &outcome.ticket,
                    can_download,
                );
            }
            items.push(item);
            if items.len() >= max_results_total {
                truncated = true;
                break;
            }
        }
        if items.len() >= max_results_total {
            break;
        }
    }
    join_set.abort_all();

    items.sort_by(|a, b| {
        (!a.is_dir, a.path.to_lowercase()).cmp(&(!b.is_dir, b.path.to_lowercase()))
    });
    items.truncate(max_results_total);

    Ok(Json(SearchResponse::Federated(Box::new(FederatedSearch {
        query: q,
        base_path: query.path,
        recursive,
        federated: true,
        items,
        truncated,
        errors,
        access_map: compact.then_some(access_map),
    }))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_component_encoding_is_strict() {
        assert_eq!(encode_query_component("a b/c"), "a%20b%2Fc");
        assert_eq!(encode_query_component("safe-1.2_~"), "safe-1.2_~");
        assert_eq!(encode_query_component("ü"), "%C3%BC");
    }

    #[test]
    fn urls_embed_ticket_and_path() {
        let (stream, download) =
            build_file_urls("http://10.0.0.2:7001/", "s-1", "docs/a b.txt", "tkt.sig");
        assert_eq!(
            stream,
            "http://10.0.0.2:7001/agent/v1/shares/s-1/stream?path=docs%2Fa%20b.txt&ticket=tkt.sig"
        );
        assert!(download.ends_with("/download?path=docs%2Fa%20b.txt&ticket=tkt.sig"));
    }

    #[test]
    fn flag_parsing_defaults() {
        assert!(parse_flag(None, true));
        assert!(!parse_flag(None, false));
        assert!(parse_flag(Some("1"), false));
        assert!(parse_flag(Some("true"), false));
        assert!(!parse_flag(Some("0"), true));
        assert!(!parse_flag(Some("false"), true));
    }
}
