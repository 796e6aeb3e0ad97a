use std::collections::BTreeSet;
use std::net::SocketAddr;

use axum::Json;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::HeaderMap;
use chrono::Duration;
use serde::Deserialize;
use serde_json::{Value, json};

use beacon_db::models::{TransferItemRow, TransferRow, new_id, now};
use beacon_db::queries::is_terminal_transfer_state;
use beacon_types::api::{
    ItemManifest, PasscodeOpenRequest, PasscodeOpenResponse, TransferApproveRequest,
    TransferCreateRequest, TransferRejectRequest, TransferItemStateRequest,
};
use beacon_types::events::{CoordinatorEvent, ItemStateBrief};
use beacon_types::models::TransferView;

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::routes::catalog::require_agent_secret;
use crate::services::acl::{get_permissions_for_share, require_permission};
use crate::services::audit::write_audit;
use crate::services::passcode::{set_transfer_passcode, verify_passcode_for_transfer};
use crate::state::AppState;
use crate::views::transfer_to_view;

const MAX_TRANSFER_ITEMS: usize = 200;

/// Item states that count towards `in_progress`.
const ACTIVE_ITEM_STATES: &[&str] = &["receiving", "staged", "committed"];
/// Item states that count towards `completed`.
const DONE_ITEM_STATES: &[&str] = &["finalized", "completed"];

/// Derived transfer state as a pure function of the item-state multiset.
/// Returns `None` when the aggregate does not force a transition.
pub fn derive_transfer_state(state_counts: &[(String, i64)]) -> Option<&'static str> {
    let total: i64 = state_counts.iter().map(|(_, count)| count).sum();
    if total == 0 {
        return None;
    }
    let done: i64 = state_counts
        .iter()
        .filter(|(state, _)| DONE_ITEM_STATES.contains(&state.as_str()))
        .map(|(_, count)| count)
        .sum();
    if done == total {
        return Some("completed");
    }
    let active: i64 = state_counts
        .iter()
        .filter(|(state, _)| ACTIVE_ITEM_STATES.contains(&state.as_str()))
        .map(|(_, count)| count)
        .sum();
    if active > 0 {
        return Some("in_progress");
    }
    None
}

fn receiver_owner(state: &AppState, transfer: &TransferRow) -> Result<String, ApiError> {
    let device = state
        .db
        .get_agent_device(&transfer.receiver_device_id)?
        .ok_or_else(|| ApiError::NotFound("Receiver device not found".into()))?;
    Ok(device.owner_principal_id)
}

/// The 24-hour expiry is evaluated lazily: the first read of an overdue
/// non-terminal transfer persists the terminal `expired` state.
fn refresh_expiry(state: &AppState, mut transfer: TransferRow) -> Result<TransferRow, ApiError> {
    if !is_terminal_transfer_state(&transfer.state) && transfer.expires_at < now() {
        state.db.set_transfer_state(&transfer.id, "expired")?;
        transfer.state = "expired".to_string();
    }
    Ok(transfer)
}

fn load_transfer(state: &AppState, transfer_id: &str) -> Result<TransferRow, ApiError> {
    let transfer = state
        .db
        .get_transfer(transfer_id)?
        .ok_or_else(|| ApiError::NotFound("Transfer not found".into()))?;
    refresh_expiry(state, transfer)
}

fn load_visible_transfer(
    state: &AppState,
    transfer_id: &str,
    auth: &AuthContext,
) -> Result<TransferRow, ApiError> {
    let transfer = load_transfer(state, transfer_id)?;
    let owner = receiver_owner(state, &transfer)?;
    if auth.principal_id != transfer.sender_principal_id && auth.principal_id != owner {
        return Err(ApiError::Forbidden("Transfer not accessible".into()));
    }
    Ok(transfer)
}

fn publish_to(state: &AppState, principals: &BTreeSet<String>, event: &CoordinatorEvent) {
    for principal in principals {
        if principal.trim().is_empty() {
            continue;
        }
        state.broker.publish(principal, event);
    }
}

fn validate_items(body: &TransferCreateRequest) -> Result<(), ApiError> {
    if body.items.is_empty() || body.items.len() > MAX_TRANSFER_ITEMS {
        return Err(ApiError::BadRequest(format!(
            "Transfer must carry between 1 and {MAX_TRANSFER_ITEMS} items"
        )));
    }
    for item in &body.items {
        if item.filename.trim().is_empty() || item.filename.len() > 255 {
            return Err(ApiError::BadRequest("Invalid item filename".into()));
        }
        if item.sha256.len() != 64 {
            return Err(ApiError::BadRequest("Invalid item sha256".into()));
        }
        if item
            .mime_type
            .as_deref()
            .is_some_and(|mime| mime.len() > 120)
        {
            return Err(ApiError::BadRequest("Invalid item mime type".into()));
        }
    }
    Ok(())
}

/// POST /api/v1/transfers -- sender requests a transfer to a receiver share.
pub async fn create_transfer(
    State(state): State<AppState>,
    auth: AuthContext,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<TransferCreateRequest>,
) -> Result<Json<TransferView>, ApiError> {
    validate_items(&body)?;

    let receiver_device = state
        .db
        .get_agent_device(&body.receiver_device_id)?
        .ok_or_else(|| ApiError::NotFound("Receiver device not found".into()))?;
    if !receiver_device.visibility && receiver_device.owner_principal_id != auth.principal_id {
        return Err(ApiError::NotFound("Receiver device not found".into()));
    }

    let receiver_share = state
        .db
        .get_share(&body.receiver_share_id)?
        .filter(|share| share.agent_device_id == receiver_device.id)
        .ok_or_else(|| ApiError::NotFound("Receiver share not found".into()))?;

    require_permission(&state.db, &auth.principal_id, &receiver_share, "request_send")?;

    let stamp = now();
    let transfer = TransferRow {
        id: new_id(),
        sender_principal_id: auth.principal_id.clone(),
        sender_client_device_id: auth.client_device_id.clone(),
        receiver_device_id: receiver_device.id.clone(),
        receiver_share_id: receiver_share.id.clone(),
        state: "pending_receiver_approval".into(),
        reason: None,
        created_at: stamp,
        expires_at: stamp + Duration::hours(24),
        updated_at: stamp,
    };
    state.db.insert_transfer(&transfer)?;

    for item in &body.items {
        state.db.insert_transfer_item(&TransferItemRow {
            id: new_id(),
            transfer_request_id: transfer.id.clone(),
            filename: item.filename.clone(),
            size: item.size as i64,
            sha256: item.sha256.to_lowercase(),
            mime_type: item.mime_type.clone(),
            state: "pending".into(),
            created_at: stamp,
            updated_at: stamp,
        })?;
    }

    write_audit(
        &state.db,
        "transfer_created",
        "transfer",
        &transfer.id,
        Some(&auth.principal_id),
        Some(addr),
        Some(&headers),
        json!({
            "item_count": body.items.len(),
            "receiver_device_id": receiver_device.id,
        }),
    );

    let view = transfer_to_view(&state.db, &transfer)?;
    state.broker.publish(
        &receiver_device.owner_principal_id,
        &CoordinatorEvent::TransferRequested {
            transfer: view.clone(),
        },
    );
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub role: Option<String>,
}

/// GET /api/v1/transfers?role=all|incoming|outgoing
pub async fn list_transfers(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
    auth: AuthContext,
) -> Result<Json<Value>, ApiError> {
    let role = query.role.as_deref().unwrap_or("all");
    if !matches!(role, "all" | "incoming" | "outgoing") {
        return Err(ApiError::BadRequest("Invalid role filter".into()));
    }

    let owned = state.db.list_owned_device_ids(&auth.principal_id)?;
    let transfers = state
        .db
        .list_transfers_for(&auth.principal_id, &owned, role)?;
    let mut views = Vec::with_capacity(transfers.len());
    for transfer in transfers {
        let transfer = refresh_expiry(&state, transfer)?;
        views.push(transfer_to_view(&state.db, &transfer)?);
    }
    Ok(Json(json!({ "transfers": views })))
}

/// POST /api/v1/transfers/history/clear -- drop caller-visible terminal
/// transfers.
pub async fn clear_history(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<Value>, ApiError> {
    let owned = state.db.list_owned_device_ids(&auth.principal_id)?;
    let deleted = state
        .db
        .delete_terminal_transfers_for(&auth.principal_id, &owned)?;
    Ok(Json(json!({ "deleted": deleted })))
}

/// POST /api/v1/transfers/pending/cancel -- bulk-cancel every caller-visible
/// non-terminal transfer.
pub async fn cancel_pending(
    State(state): State<AppState>,
    auth: AuthContext,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let owned = state.db.list_owned_device_ids(&auth.principal_id)?;
    let transfers = state
        .db
        .list_nonterminal_transfers_for(&auth.principal_id, &owned)?;

    let mut cancelled = 0usize;
    let mut notifications = Vec::new();
    for transfer in transfers {
        state.db.set_transfer_state_reason(
            &transfer.id,
            "cancelled",
            Some("Cancelled in bulk by user"),
        )?;
        state.db.cancel_unsettled_items(&transfer.id)?;
        cancelled += 1;

        let owner = receiver_owner(&state, &transfer).unwrap_or_default();
        let mut targets = BTreeSet::new();
        targets.insert(transfer.sender_principal_id.clone());
        targets.insert(owner);
        if let Some(updated) = state.db.get_transfer(&transfer.id)? {
            notifications.push((targets, transfer_to_view(&state.db, &updated)?));
        }
    }

    if cancelled > 0 {
        write_audit(
            &state.db,
            "transfer_bulk_cancelled",
            "transfer",
            "bulk",
            Some(&auth.principal_id),
            Some(addr),
            Some(&headers),
            json!({ "cancelled_count": cancelled }),
        );
    }

    for (targets, view) in notifications {
        publish_to(
            &state,
            &targets,
            &CoordinatorEvent::TransferCancelled { transfer: view },
        );
    }
    Ok(Json(json!({ "cancelled": cancelled })))
}

/// GET /api/v1/transfers/{transfer_id}
pub async fn get_transfer(
    State(state): State<AppState>,
    Path(transfer_id): Path<String>,
    auth: AuthContext,
) -> Result<Json<TransferView>, ApiError> {
    let transfer = load_visible_transfer(&state, &transfer_id, &auth)?;
    Ok(Json(transfer_to_view(&state.db, &transfer)?))
}

/// POST /api/v1/transfers/{transfer_id}/approve -- receiver owner (or a
/// principal granted accept_incoming) sets the passcode window.
pub async fn approve_transfer(
    State(state): State<AppState>,
    Path(transfer_id): Path<String>,
    auth: AuthContext,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<TransferApproveRequest>,
) -> Result<Json<TransferView>, ApiError> {
    let transfer = load_transfer(&state, &transfer_id)?;
    let receiver_share = state
        .db
        .get_share(&transfer.receiver_share_id)?
        .ok_or_else(|| ApiError::NotFound("Receiver share not found".into()))?;
    let owner = receiver_owner(&state, &transfer)?;
    if auth.principal_id != owner {
        let permissions =
            get_permissions_for_share(&state.db, &auth.principal_id, &receiver_share, Some(&owner))?;
        if !permissions.contains("accept_incoming") {
            return Err(ApiError::Forbidden("Permission denied".into()));
        }
    }
    if transfer.state != "pending_receiver_approval" {
        return Err(ApiError::Conflict("Transfer is not pending approval".into()));
    }

    let state_clone = state.clone();
    let principal_id = auth.principal_id.clone();
    let transfer_id_clone = transfer.id.clone();
    let passcode = body.passcode.clone();
    let destination = body.destination_path.clone().unwrap_or_default();
    tokio::task::spawn_blocking(move || -> Result<(), ApiError> {
        set_transfer_passcode(
            &state_clone.db,
            &transfer_id_clone,
            &passcode,
            state_clone.config.passcode_window_seconds,
        )?;
        let reason = json!({
            "kind": "receiver_preferences",
            "destination_path": destination.trim(),
            "auto_passcode": passcode.trim(),
        })
        .to_string();
        state_clone.db.set_transfer_state_reason(
            &transfer_id_clone,
            "approved_pending_sender_passcode",
            Some(&reason),
        )?;
        write_audit(
            &state_clone.db,
            "transfer_approved",
            "transfer",
            &transfer_id_clone,
            Some(&principal_id),
            Some(addr),
            Some(&headers),
            json!({}),
        );
        Ok(())
    })
    .await
    .map_err(|err| ApiError::Internal(anyhow::anyhow!("join error: {err}")))??;

    let updated = load_transfer(&state, &transfer_id)?;
    let view = transfer_to_view(&state.db, &updated)?;
    state.broker.publish(
        &updated.sender_principal_id,
        &CoordinatorEvent::TransferApproved {
            transfer: view.clone(),
        },
    );
    Ok(Json(view))
}

/// POST /api/v1/transfers/{transfer_id}/reject -- receiver owner only.
pub async fn reject_transfer(
    State(state): State<AppState>,
    Path(transfer_id): Path<String>,
    auth: AuthContext,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<TransferRejectRequest>,
) -> Result<Json<TransferView>, ApiError> {
    let transfer = load_transfer(&state, &transfer_id)?;
    let owner = receiver_owner(&state, &transfer)?;
    if auth.principal_id != owner {
        return Err(ApiError::Forbidden(
            "Only receiver owner can reject".into(),
        ));
    }
    if transfer.state != "pending_receiver_approval" {
        return Err(ApiError::Conflict("Transfer is not pending approval".into()));
    }

    state
        .db
        .set_transfer_state_reason(&transfer.id, "rejected", body.reason.as_deref())?;
    state.db.set_all_items_state(&transfer.id, "rejected")?;
    write_audit(
        &state.db,
        "transfer_rejected",
        "transfer",
        &transfer.id,
        Some(&auth.principal_id),
        Some(addr),
        Some(&headers),
        json!({ "reason": body.reason.clone().unwrap_or_default() }),
    );

    let updated = load_transfer(&state, &transfer_id)?;
    let view = transfer_to_view(&state.db, &updated)?;
    state.broker.publish(
        &updated.sender_principal_id,
        &CoordinatorEvent::TransferRejected {
            transfer: view.clone(),
        },
    );
    Ok(Json(view))
}

/// POST /api/v1/transfers/{transfer_id}/passcode/open -- the sender proves
/// the passcode and receives an upload ticket for the receiving agent.
pub async fn open_passcode(
    State(state): State<AppState>,
    Path(transfer_id): Path<String>,
    auth: AuthContext,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<PasscodeOpenRequest>,
) -> Result<Json<PasscodeOpenResponse>, ApiError> {
    let transfer = load_transfer(&state, &transfer_id)?;
    if transfer.sender_principal_id != auth.principal_id {
        return Err(ApiError::Forbidden(
            "Only sender can open passcode window".into(),
        ));
    }
    if !matches!(
        transfer.state.as_str(),
        "approved_pending_sender_passcode" | "passcode_open"
    ) {
        return Err(ApiError::Conflict(
            "Transfer is not ready for passcode entry".into(),
        ));
    }

    let state_clone = state.clone();
    let principal_id = auth.principal_id.clone();
    let transfer_id_clone = transfer.id.clone();
    let passcode = body.passcode.clone();
    tokio::task::spawn_blocking(move || {
        verify_passcode_for_transfer(
            &state_clone.db,
            &transfer_id_clone,
            &principal_id,
            &passcode,
        )
    })
    .await
    .map_err(|err| ApiError::Internal(anyhow::anyhow!("join error: {err}")))??;

    state.db.set_transfer_state(&transfer.id, "passcode_open")?;
    let receiver = state
        .db
        .get_agent_device(&transfer.receiver_device_id)?
        .ok_or_else(|| ApiError::NotFound("Receiver device not found".into()))?;

    let ticket = beacon_ticket::issue_transfer_ticket(
        &state.config.secret_key,
        &auth.principal_id,
        &transfer.id,
        &receiver.id,
        &transfer.receiver_share_id,
        state.config.transfer_ticket_ttl_seconds,
    );
    write_audit(
        &state.db,
        "transfer_passcode_opened",
        "transfer",
        &transfer.id,
        Some(&auth.principal_id),
        Some(addr),
        Some(&headers),
        json!({}),
    );

    let updated = load_transfer(&state, &transfer_id)?;
    let view = transfer_to_view(&state.db, &updated)?;
    state.broker.publish(
        &receiver.owner_principal_id,
        &CoordinatorEvent::TransferPasscodeOpened {
            transfer: view.clone(),
        },
    );

    let window = state.db.get_passcode_window(&transfer.id)?;
    Ok(Json(PasscodeOpenResponse {
        transfer: view,
        upload_ticket: ticket,
        upload_base_url: format!(
            "{}/agent/v1/inbox/transfers/{}",
            receiver.base_url.trim_end_matches('/'),
            transfer.id
        ),
        expires_at: window.map(|window| window.expires_at),
    }))
}

/// POST /api/v1/internal/transfers/{tid}/items/{iid}/state -- the receiving
/// agent reports an item transition; the transfer state is recomputed from
/// the item multiset. Idempotent: duplicate notifications re-derive the same
/// state and re-publish the event.
pub async fn update_item_state(
    State(state): State<AppState>,
    Path((transfer_id, item_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<TransferItemStateRequest>,
) -> Result<Json<Value>, ApiError> {
    require_agent_secret(&state, &headers)?;
    if body.state.trim().is_empty() || body.state.len() > 30 {
        return Err(ApiError::BadRequest("Invalid item state".into()));
    }

    let transfer = state
        .db
        .get_transfer(&transfer_id)?
        .ok_or_else(|| ApiError::NotFound("Transfer not found".into()))?;
    if is_terminal_transfer_state(&transfer.state) {
        return Ok(Json(json!({ "ok": true })));
    }

    if !state
        .db
        .set_item_state(&transfer_id, &item_id, body.state.trim())?
    {
        return Err(ApiError::NotFound("Transfer item not found".into()));
    }

    let counts = state.db.item_state_counts(&transfer_id)?;
    if let Some(derived) = derive_transfer_state(&counts) {
        if derived != transfer.state {
            state.db.set_transfer_state(&transfer_id, derived)?;
        }
    }

    let updated = state
        .db
        .get_transfer(&transfer_id)?
        .ok_or_else(|| ApiError::NotFound("Transfer not found".into()))?;
    let event = CoordinatorEvent::TransferItemState {
        transfer_id: updated.id.clone(),
        transfer_state: updated.state.clone(),
        item: ItemStateBrief {
            id: item_id,
            state: body.state.trim().to_string(),
        },
        updated_at: updated.updated_at,
    };
    let owner = receiver_owner(&state, &updated)?;
    let mut targets = BTreeSet::new();
    targets.insert(updated.sender_principal_id.clone());
    targets.insert(owner);
    publish_to(&state, &targets, &event);
    Ok(Json(json!({ "ok": true })))
}

/// GET /api/v1/internal/transfers/{tid}/items/{iid} -- item manifest for the
/// receiving agent, bound to its device id.
pub async fn get_item_manifest(
    State(state): State<AppState>,
    Path((transfer_id, item_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<ItemManifest>, ApiError> {
    require_agent_secret(&state, &headers)?;
    let device_id = headers
        .get("x-agent-device-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if device_id.is_empty() {
        return Err(ApiError::BadRequest("Missing agent device id".into()));
    }

    let transfer = state
        .db
        .get_transfer(&transfer_id)?
        .ok_or_else(|| ApiError::NotFound("Transfer not found".into()))?;
    if transfer.receiver_device_id != device_id {
        return Err(ApiError::Forbidden(
            "Transfer does not target this agent".into(),
        ));
    }

    let item = state
        .db
        .get_transfer_item(&transfer_id, &item_id)?
        .ok_or_else(|| ApiError::NotFound("Transfer item not found".into()))?;

    Ok(Json(ItemManifest {
        transfer_id: transfer.id,
        receiver_share_id: transfer.receiver_share_id,
        item_id: item.id,
        filename: item.filename,
        size: item.size.max(0) as u64,
        sha256: item.sha256,
        mime_type: item.mime_type,
        state: item.state,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(&str, i64)]) -> Vec<(String, i64)> {
        pairs
            .iter()
            .map(|(state, count)| (state.to_string(), *count))
            .collect()
    }

    #[test]
    fn all_finalized_means_completed() {
        assert_eq!(
            derive_transfer_state(&counts(&[("finalized", 2), ("completed", 1)])),
            Some("completed")
        );
    }

    #[test]
    fn any_active_item_means_in_progress() {
        assert_eq!(
            derive_transfer_state(&counts(&[("pending", 1), ("receiving", 1)])),
            Some("in_progress")
        );
        assert_eq!(
            derive_transfer_state(&counts(&[("finalized", 1), ("staged", 1)])),
            Some("in_progress")
        );
        assert_eq!(
            derive_transfer_state(&counts(&[("committed", 3)])),
            Some("in_progress")
        );
    }

    #[test]
    fn inert_items_force_nothing() {
        assert_eq!(derive_transfer_state(&counts(&[("pending", 2)])), None);
        assert_eq!(derive_transfer_state(&counts(&[])), None);
        assert_eq!(
            derive_transfer_state(&counts(&[("rejected", 1), ("pending", 1)])),
            None
        );
    }

    #[test]
    fn derivation_is_pure_over_the_multiset() {
        let a = counts(&[("finalized", 1), ("receiving", 1)]);
        let b = counts(&[("receiving", 1), ("finalized", 1)]);
        assert_eq!(derive_transfer_state(&a), derive_transfer_state(&b));
    }
}
