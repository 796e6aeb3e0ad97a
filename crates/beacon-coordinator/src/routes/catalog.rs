use std::collections::HashMap;
use std::net::SocketAddr;

use axum::Json;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::{Value, json};

use beacon_db::models::new_id;
use beacon_types::api::{
    AgentHeartbeatRequest, AgentRegisterRequest, AgentRegisterResponse, RegisteredShare,
    VisibilityRequest,
};
use beacon_types::models::{DeviceView, ShareView};

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::services::acl::{ensure_default_grants_for_share, get_permissions_for_shares};
use crate::services::audit::write_audit;
use crate::state::AppState;

pub fn require_agent_secret(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers
        .get("x-agent-secret")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if provided != state.config.agent_shared_secret {
        return Err(ApiError::Unauthorized("Invalid agent secret".into()));
    }
    Ok(())
}

/// POST /api/v1/internal/agents/register -- an agent announces itself and its
/// shares. Re-registration upserts; new shares get default grants.
pub async fn register_agent(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<AgentRegisterRequest>,
) -> Result<Json<AgentRegisterResponse>, ApiError> {
    require_agent_secret(&state, &headers)?;

    let owner = state
        .db
        .get_principal(&body.owner_principal_id)?
        .filter(|principal| principal.status == "active")
        .ok_or_else(|| ApiError::NotFound("Owner principal not found".into()))?;

    let base_url = body.base_url.trim_end_matches('/').to_string();
    let device_id = match body.agent_device_id.as_deref().filter(|id| !id.is_empty()) {
        Some(id) => {
            if state.db.get_agent_device(id)?.is_some() {
                state
                    .db
                    .update_agent_registration(id, &owner.id, &body.name, &base_url, body.visible)?;
            } else {
                state
                    .db
                    .insert_agent_device(id, &owner.id, &body.name, &base_url, body.visible)?;
            }
            id.to_string()
        }
        None => {
            let id = new_id();
            state
                .db
                .insert_agent_device(&id, &owner.id, &body.name, &base_url, body.visible)?;
            id
        }
    };

    let existing: HashMap<String, _> = state
        .db
        .list_device_shares(&device_id)?
        .into_iter()
        .map(|share| (share.id.clone(), share))
        .collect();

    let mut response_shares = Vec::with_capacity(body.shares.len());
    for share_input in &body.shares {
        let known = share_input
            .share_id
            .as_deref()
            .and_then(|id| existing.get(id));
        let share_id = match known {
            Some(share) => {
                state.db.update_share(
                    &share.id,
                    &share_input.name,
                    &share_input.root_path,
                    share_input.read_only,
                )?;
                share.id.clone()
            }
            None => {
                let id = share_input
                    .share_id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(new_id);
                state.db.insert_share(
                    &id,
                    &device_id,
                    &share_input.name,
                    &share_input.root_path,
                    share_input.read_only,
                )?;
                ensure_default_grants_for_share(&state.db, &id, &owner.id)?;
                id
            }
        };
        response_shares.push(RegisteredShare {
            id: share_id,
            name: share_input.name.clone(),
            root_path: share_input.root_path.clone(),
            read_only: share_input.read_only,
        });
    }

    write_audit(
        &state.db,
        "agent_registered",
        "agent_device",
        &device_id,
        Some(&owner.id),
        Some(addr),
        Some(&headers),
        json!({ "share_count": response_shares.len() }),
    );

    Ok(Json(AgentRegisterResponse {
        device_id,
        shares: response_shares,
    }))
}

/// POST /api/v1/internal/agents/{device_id}/heartbeat
pub async fn heartbeat_agent(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AgentHeartbeatRequest>,
) -> Result<Json<Value>, ApiError> {
    require_agent_secret(&state, &headers)?;
    if !state.db.heartbeat_agent_device(&device_id, body.online)? {
        return Err(ApiError::NotFound("Agent device not found".into()));
    }
    Ok(Json(json!({ "ok": true })))
}

/// GET /api/v1/catalog/devices -- devices visible to the caller.
pub async fn list_devices(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<Value>, ApiError> {
    let devices = state.db.list_agent_devices()?;
    let payload: Vec<DeviceView> = devices
        .into_iter()
        .filter(|device| device.visibility || device.owner_principal_id == auth.principal_id)
        .map(|device| DeviceView {
            online: device.is_online(),
            id: device.id,
            name: device.name,
            owner_principal_id: device.owner_principal_id,
            visible: device.visibility,
            last_seen: device.last_seen,
        })
        .collect();
    Ok(Json(json!({ "devices": payload })))
}

/// POST /api/v1/catalog/devices/{device_id}/visibility -- owner only.
pub async fn set_visibility(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    auth: AuthContext,
    Json(body): Json<VisibilityRequest>,
) -> Result<Json<Value>, ApiError> {
    let device = state
        .db
        .get_agent_device(&device_id)?
        .ok_or_else(|| ApiError::NotFound("Device not found".into()))?;
    if device.owner_principal_id != auth.principal_id {
        return Err(ApiError::Forbidden(
            "Only owner can change visibility".into(),
        ));
    }
    state.db.set_device_visibility(&device_id, body.visible)?;
    Ok(Json(json!({ "id": device_id, "visible": body.visible })))
}

#[derive(Debug, Deserialize)]
pub struct SharesQuery {
    #[serde(default)]
    pub device_id: Option<String>,
}

/// GET /api/v1/catalog/shares -- shares the caller holds any permission on.
pub async fn list_shares(
    State(state): State<AppState>,
    Query(query): Query<SharesQuery>,
    auth: AuthContext,
) -> Result<Json<Value>, ApiError> {
    let rows = state
        .db
        .list_shares_with_devices(query.device_id.as_deref())?;

    let mut owner_map = HashMap::new();
    let mut visible_rows = Vec::new();
    for (share, device) in rows {
        if !device.visibility && device.owner_principal_id != auth.principal_id {
            continue;
        }
        owner_map.insert(share.id.clone(), device.owner_principal_id.clone());
        visible_rows.push((share, device));
    }

    let shares: Vec<_> = visible_rows
        .iter()
        .map(|(share, _)| share.clone())
        .collect();
    let permissions_by_share =
        get_permissions_for_shares(&state.db, &auth.principal_id, &shares, &owner_map)?;

    let mut payload = Vec::new();
    for (share, device) in visible_rows {
        let Some(permissions) = permissions_by_share.get(&share.id) else {
            continue;
        };
        if permissions.is_empty() {
            continue;
        }
        payload.push(ShareView {
            id: share.id,
            name: share.name,
            device_id: share.agent_device_id,
            read_only: share.read_only,
            permissions: permissions.iter().cloned().collect(),
            device_online: device.is_online(),
        });
    }
    Ok(Json(json!({ "shares": payload })))
}
