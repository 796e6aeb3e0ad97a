use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use beacon_types::api::{AuthTokenRequest, AuthTokenResponse};

use crate::auth::{AuthContext, verify_secret};
use crate::error::ApiError;
use crate::state::AppState;

/// Device secrets are Argon2-verified; cap input length to bound hash cost.
const MAX_SECRET_LEN: usize = 256;

/// POST /api/v1/auth/token -- exchange a device secret for a client_access
/// token.
pub async fn issue_token(
    State(state): State<AppState>,
    Json(body): Json<AuthTokenRequest>,
) -> Result<Json<AuthTokenResponse>, ApiError> {
    if body.device_secret.len() < 8 || body.device_secret.len() > MAX_SECRET_LEN {
        return Err(ApiError::Unauthorized("Invalid device credentials".into()));
    }

    let state_clone = state.clone();
    let response = tokio::task::spawn_blocking(move || -> Result<_, ApiError> {
        let principal = state_clone.db.get_principal(&body.principal_id)?;
        let device = state_clone.db.get_client_device(&body.client_device_id)?;
        let (Some(principal), Some(device)) = (principal, device) else {
            return Err(ApiError::Unauthorized("Invalid principal or device".into()));
        };
        if principal.status != "active" || device.status != "active" {
            return Err(ApiError::Unauthorized("Invalid principal or device".into()));
        }
        if device.principal_id != principal.id {
            return Err(ApiError::Unauthorized(
                "Device does not belong to principal".into(),
            ));
        }
        if !verify_secret(&device.device_secret_hash, &body.device_secret) {
            return Err(ApiError::Unauthorized("Invalid device credentials".into()));
        }

        state_clone.db.touch_client_device(&device.id)?;
        let token = beacon_ticket::issue_access_token(
            &state_clone.config.secret_key,
            &principal.id,
            &device.id,
            state_clone.config.access_token_ttl_seconds,
        );
        Ok(AuthTokenResponse {
            access_token: token,
            token_type: "bearer".into(),
            expires_in: state_clone.config.access_token_ttl_seconds.max(0) as u64,
            principal_id: principal.id,
            client_device_id: device.id,
        })
    })
    .await
    .map_err(|err| ApiError::Internal(anyhow::anyhow!("join error: {err}")))??;

    Ok(Json(response))
}

/// GET /api/v1/auth/me -- caller self-info.
pub async fn me(State(state): State<AppState>, auth: AuthContext) -> Result<Json<Value>, ApiError> {
    let principal = state
        .db
        .get_principal(&auth.principal_id)?
        .ok_or_else(|| ApiError::Unauthorized("Unknown caller".into()))?;
    let device = state
        .db
        .get_client_device(&auth.client_device_id)?
        .ok_or_else(|| ApiError::Unauthorized("Unknown caller".into()))?;

    Ok(Json(json!({
        "principal": {
            "id": principal.id,
            "display_name": principal.display_name,
            "status": principal.status,
        },
        "client_device": {
            "id": device.id,
            "name": device.name,
            "platform": device.platform,
            "status": device.status,
            "last_seen": device.last_seen.map(|at| at.to_rfc3339()),
        },
    })))
}
