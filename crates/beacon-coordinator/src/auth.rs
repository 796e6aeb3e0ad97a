use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;

use crate::error::ApiError;
use crate::state::AppState;

/// Authenticated caller, resolved from a `client_access` bearer token against
/// live principal and device rows.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub principal_id: String,
    pub client_device_id: String,
}

pub fn hash_secret(secret: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| ApiError::Internal(anyhow::anyhow!("argon2 hash failed: {err}")))
}

pub fn verify_secret(secret_hash: &str, candidate: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(secret_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(candidate.as_bytes(), &parsed)
        .is_ok()
}

pub fn generate_device_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn bearer_token(parts: &Parts) -> Result<String, ApiError> {
    let header_value = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".into()))?;
    let token = header_value
        .strip_prefix("Bearer ")
        .or_else(|| header_value.strip_prefix("bearer "))
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".into()))?;
    Ok(token.trim().to_string())
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let claims = beacon_ticket::decode_token(&state.config.secret_key, &token)?;
        if claims.kind() != beacon_ticket::TicketKind::ClientAccess.as_str() {
            return Err(ApiError::Unauthorized("Invalid access token".into()));
        }

        let principal_id = claims.str_claim("principal_id").to_string();
        let client_device_id = claims.str_claim("client_device_id").to_string();

        let principal = state.db.get_principal(&principal_id)?;
        let device = state.db.get_client_device(&client_device_id)?;
        let (Some(principal), Some(device)) = (principal, device) else {
            return Err(ApiError::Unauthorized("Unknown principal or device".into()));
        };
        if principal.status != "active" || device.status != "active" {
            return Err(ApiError::Unauthorized("Unknown principal or device".into()));
        }
        if device.principal_id != principal.id {
            return Err(ApiError::Unauthorized("Token principal mismatch".into()));
        }

        Ok(AuthContext {
            principal_id: principal.id,
            client_device_id: device.id,
        })
    }
}
