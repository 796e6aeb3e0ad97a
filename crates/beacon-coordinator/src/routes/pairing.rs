use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use axum::Json;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Deserialize;
use serde_json::json;

use beacon_db::models::{new_id, now};
use beacon_types::api::{PairingConfirmRequest, PairingStartRequest, PairingStartResponse};

use crate::auth::{AuthContext, generate_device_secret, hash_secret};
use crate::error::ApiError;
use crate::services::acl::ensure_default_grants_for_principal;
use crate::services::audit::write_audit;
use crate::services::passcode::lock_seconds;
use crate::state::AppState;

const MAX_PAIRING_ATTEMPTS: u32 = 5;

#[derive(Debug, Default)]
struct AttemptState {
    failure_count: u32,
    locked_until: Option<DateTime<Utc>>,
}

/// In-process pairing attempt table. Deliberately ephemeral: a restart
/// clears it.
pub struct PairingAttempts {
    inner: Mutex<HashMap<String, AttemptState>>,
}

impl PairingAttempts {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn check_lock(&self, session_id: &str, at: DateTime<Utc>) -> Result<(), ApiError> {
        let mut map = self.inner.lock().expect("pairing lock poisoned");
        if let Some(state) = map.get_mut(session_id) {
            match state.locked_until {
                Some(locked_until) if locked_until > at => {
                    return Err(ApiError::RateLimited("Pairing temporarily locked".into()));
                }
                Some(_) => {
                    state.locked_until = None;
                    state.failure_count = 0;
                }
                None => {}
            }
        }
        Ok(())
    }

    fn record_failure(&self, session_id: &str, at: DateTime<Utc>) {
        let mut map = self.inner.lock().expect("pairing lock poisoned");
        let state = map.entry(session_id.to_string()).or_default();
        state.failure_count += 1;
        if state.failure_count >= MAX_PAIRING_ATTEMPTS {
            state.locked_until = Some(at + Duration::seconds(lock_seconds(state.failure_count as i32)));
        }
    }

    fn clear(&self, session_id: &str) {
        let mut map = self.inner.lock().expect("pairing lock poisoned");
        map.remove(session_id);
    }
}

impl Default for PairingAttempts {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_start(body: &PairingStartRequest) -> Result<(), ApiError> {
    if body.display_name.trim().is_empty() || body.display_name.len() > 80 {
        return Err(ApiError::BadRequest("Invalid display name".into()));
    }
    if body.device_name.trim().is_empty() || body.device_name.len() > 120 {
        return Err(ApiError::BadRequest("Invalid device name".into()));
    }
    if body.platform.trim().is_empty() || body.platform.len() > 60 {
        return Err(ApiError::BadRequest("Invalid platform".into()));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct StartQuery {
    /// Sent by the launcher during unattended bootstrap; affects nothing on
    /// the coordinator side but is kept for log correlation.
    #[serde(default)]
    #[allow(dead_code)]
    pub auto_join: Option<String>,
}

/// POST /api/v1/pairing/start -- bootstrap the first principal directly, or
/// open a 6-digit pairing session an existing principal must confirm.
pub async fn start_pairing(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(_query): Query<StartQuery>,
    headers: HeaderMap,
    Json(body): Json<PairingStartRequest>,
) -> Result<Json<PairingStartResponse>, ApiError> {
    validate_start(&body)?;

    if !state.db.any_principal_exists()? {
        let state = state.clone();
        let response = tokio::task::spawn_blocking(move || -> Result<_, ApiError> {
            let principal_id = new_id();
            state
                .db
                .create_principal(&principal_id, body.display_name.trim(), body.public_key.as_deref())?;

            let device_secret = generate_device_secret();
            let client_device_id = new_id();
            let secret_hash = hash_secret(&device_secret)?;
            state.db.create_client_device(
                &client_device_id,
                &principal_id,
                body.device_name.trim(),
                body.platform.trim(),
                body.public_key.as_deref(),
                &secret_hash,
            )?;
            ensure_default_grants_for_principal(&state.db, &principal_id)?;
            write_audit(
                &state.db,
                "principal_bootstrap",
                "principal",
                &principal_id,
                Some(&principal_id),
                Some(addr),
                Some(&headers),
                json!({ "client_device_id": client_device_id }),
            );

            let access_token = beacon_ticket::issue_access_token(
                &state.config.secret_key,
                &principal_id,
                &client_device_id,
                state.config.access_token_ttl_seconds,
            );
            Ok(PairingStartResponse {
                bootstrap: true,
                principal_id: Some(principal_id),
                client_device_id: Some(client_device_id),
                access_token: Some(access_token),
                device_secret: Some(device_secret),
                ..Default::default()
            })
        })
        .await
        .map_err(|err| ApiError::Internal(anyhow::anyhow!("join error: {err}")))??;
        return Ok(Json(response));
    }

    let pairing_code = format!("{:06}", rand::rng().random_range(0..1_000_000));
    let session_id = new_id();
    let expires_at = now() + Duration::seconds(state.config.pairing_code_ttl_seconds.max(1));
    state.db.create_pairing_session(
        &session_id,
        body.display_name.trim(),
        body.device_name.trim(),
        body.platform.trim(),
        body.public_key.as_deref(),
        &pairing_code,
        expires_at,
    )?;

    Ok(Json(PairingStartResponse {
        bootstrap: false,
        pending_pairing_id: Some(session_id),
        pairing_code: Some(pairing_code),
        expires_at: Some(expires_at),
        ..Default::default()
    }))
}

/// POST /api/v1/pairing/confirm -- an authenticated principal redeems the
/// 6-digit code to mint a new client device.
pub async fn confirm_pairing(
    State(state): State<AppState>,
    auth: AuthContext,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<PairingConfirmRequest>,
) -> Result<Json<PairingStartResponse>, ApiError> {
    let at = Utc::now();
    let session = state
        .db
        .get_pairing_session(&body.pending_pairing_id)?
        .filter(|session| session.status == "pending")
        .ok_or_else(|| ApiError::NotFound("Pairing session not found".into()))?;

    state.pairing_attempts.check_lock(&session.id, at)?;
    if session.pairing_code != body.pairing_code {
        state.pairing_attempts.record_failure(&session.id, at);
        return Err(ApiError::Unauthorized("Invalid pairing code".into()));
    }
    if session.expires_at < at {
        state.db.mark_pairing_session(&session.id, "expired", None)?;
        state.pairing_attempts.clear(&session.id);
        return Err(ApiError::Gone("Pairing session expired".into()));
    }

    let state_clone = state.clone();
    let principal_id = auth.principal_id.clone();
    let response = tokio::task::spawn_blocking(move || -> Result<_, ApiError> {
        let device_secret = generate_device_secret();
        let client_device_id = new_id();
        let secret_hash = hash_secret(&device_secret)?;
        state_clone.db.create_client_device(
            &client_device_id,
            &principal_id,
            &session.device_name,
            &session.platform,
            session.public_key.as_deref(),
            &secret_hash,
        )?;
        state_clone
            .db
            .mark_pairing_session(&session.id, "confirmed", Some(&principal_id))?;
        state_clone.pairing_attempts.clear(&session.id);
        write_audit(
            &state_clone.db,
            "pairing_confirmed",
            "pairing_session",
            &session.id,
            Some(&principal_id),
            Some(addr),
            Some(&headers),
            json!({ "client_device_id": client_device_id }),
        );

        let access_token = beacon_ticket::issue_access_token(
            &state_clone.config.secret_key,
            &principal_id,
            &client_device_id,
            state_clone.config.access_token_ttl_seconds,
        );
        Ok(PairingStartResponse {
            bootstrap: false,
            principal_id: Some(principal_id),
            client_device_id: Some(client_device_id),
            access_token: Some(access_token),
            device_secret: Some(device_secret),
            ..Default::default()
        })
    })
    .await
    .map_err(|err| ApiError::Internal(anyhow::anyhow!("join error: {err}")))??;

    Ok(Json(response))
}
