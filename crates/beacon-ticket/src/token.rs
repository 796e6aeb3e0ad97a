//! Signed capability tickets.
//!
//! A ticket is `base64url(body) + "." + base64url(hmac_sha256(secret, body))`
//! where the body is canonical JSON (sorted keys, no spaces) carrying an
//! integer `exp` in unix seconds. Tickets are self-contained: agents verify
//! them without calling back to the coordinator.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use thiserror::Error;

use crate::permissions::PermissionSet;

type HmacSha256 = Hmac<Sha256>;

/// Any decode failure collapses into this one kind; callers map it to 401.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TokenError(pub String);

/// Verification beyond the signature: wrong kind stays 401, a valid ticket
/// bound to the wrong resource is 403.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketKind {
    ClientAccess,
    EventsWs,
    ReadTicket,
    TransferUploadTicket,
    InternalAgent,
}

impl TicketKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketKind::ClientAccess => "client_access",
            TicketKind::EventsWs => "events_ws",
            TicketKind::ReadTicket => "read_ticket",
            TicketKind::TransferUploadTicket => "transfer_upload_ticket",
            TicketKind::InternalAgent => "internal_agent",
        }
    }
}

/// Decoded ticket body with typed accessors over the claim map.
#[derive(Debug, Clone)]
pub struct Claims(pub Map<String, Value>);

impl Claims {
    pub fn kind(&self) -> &str {
        self.str_claim("kind")
    }

    pub fn str_claim(&self, name: &str) -> &str {
        self.0.get(name).and_then(Value::as_str).unwrap_or("")
    }

    pub fn permissions(&self) -> PermissionSet {
        self.0
            .get("permissions")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

fn sign(secret: &str, body: &[u8]) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    mac.finalize().into_bytes().to_vec()
}

fn encode_parts(secret: &str, body: &[u8]) -> String {
    let signature = sign(secret, body);
    format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(body),
        URL_SAFE_NO_PAD.encode(signature)
    )
}

/// Issue a ticket from arbitrary claims. `exp` is stamped here; an existing
/// `exp` key in the payload is overwritten.
pub fn issue_token(secret: &str, mut payload: Map<String, Value>, expires_in: i64) -> String {
    payload.insert(
        "exp".to_string(),
        Value::from(unix_now() + expires_in.max(1)),
    );
    // serde_json::Map is BTreeMap-backed, so serialization yields sorted keys.
    let body = serde_json::to_vec(&Value::Object(payload)).expect("claim map serializes");
    encode_parts(secret, &body)
}

pub fn decode_token(secret: &str, token: &str) -> Result<Claims, TokenError> {
    let (body_part, signature_part) = token
        .split_once('.')
        .ok_or_else(|| TokenError("Malformed token".into()))?;
    let body = URL_SAFE_NO_PAD
        .decode(body_part)
        .map_err(|_| TokenError("Malformed token".into()))?;
    let signature = URL_SAFE_NO_PAD
        .decode(signature_part)
        .map_err(|_| TokenError("Malformed token".into()))?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(&body);
    mac.verify_slice(&signature)
        .map_err(|_| TokenError("Invalid token signature".into()))?;

    let payload: Value =
        serde_json::from_slice(&body).map_err(|_| TokenError("Invalid token body".into()))?;
    let Value::Object(claims) = payload else {
        return Err(TokenError("Invalid token payload".into()));
    };

    let exp = claims
        .get("exp")
        .and_then(Value::as_i64)
        .ok_or_else(|| TokenError("Invalid token expiry".into()))?;
    if exp < unix_now() {
        return Err(TokenError("Token expired".into()));
    }
    Ok(Claims(claims))
}

// ── Typed issuers ───────────────────────────────────────────────────────

pub fn issue_access_token(
    secret: &str,
    principal_id: &str,
    client_device_id: &str,
    ttl_seconds: i64,
) -> String {
    let mut payload = Map::new();
    payload.insert("kind".into(), TicketKind::ClientAccess.as_str().into());
    payload.insert("principal_id".into(), principal_id.into());
    payload.insert("client_device_id".into(), client_device_id.into());
    issue_token(secret, payload, ttl_seconds)
}

pub fn issue_events_ws_token(
    secret: &str,
    principal_id: &str,
    client_device_id: &str,
    ttl_seconds: i64,
) -> String {
    let mut payload = Map::new();
    payload.insert("kind".into(), TicketKind::EventsWs.as_str().into());
    payload.insert("principal_id".into(), principal_id.into());
    payload.insert("client_device_id".into(), client_device_id.into());
    issue_token(secret, payload, ttl_seconds)
}

pub fn issue_read_ticket(
    secret: &str,
    principal_id: &str,
    share_id: &str,
    permissions: &PermissionSet,
    ttl_seconds: i64,
) -> String {
    let mut payload = Map::new();
    payload.insert("kind".into(), TicketKind::ReadTicket.as_str().into());
    payload.insert("principal_id".into(), principal_id.into());
    payload.insert("share_id".into(), share_id.into());
    payload.insert(
        "permissions".into(),
        Value::Array(permissions.iter().map(|p| Value::from(p.as_str())).collect()),
    );
    issue_token(secret, payload, ttl_seconds)
}

pub fn issue_transfer_ticket(
    secret: &str,
    principal_id: &str,
    transfer_id: &str,
    receiver_device_id: &str,
    receiver_share_id: &str,
    ttl_seconds: i64,
) -> String {
    let mut payload = Map::new();
    payload.insert(
        "kind".into(),
        TicketKind::TransferUploadTicket.as_str().into(),
    );
    payload.insert("principal_id".into(), principal_id.into());
    payload.insert("transfer_id".into(), transfer_id.into());
    payload.insert("receiver_device_id".into(), receiver_device_id.into());
    payload.insert("receiver_share_id".into(), receiver_share_id.into());
    issue_token(secret, payload, ttl_seconds)
}

pub fn issue_internal_agent_ticket(secret: &str, share_id: &str) -> String {
    let mut payload = Map::new();
    payload.insert("kind".into(), TicketKind::InternalAgent.as_str().into());
    payload.insert("share_id".into(), share_id.into());
    issue_token(secret, payload, 60)
}

// ── Agent-side verifiers ────────────────────────────────────────────────

/// Accepts `read_ticket` (checking the required permission) or the
/// coordinator's `internal_agent` ticket, both bound to the share.
pub fn verify_read_ticket(
    secret: &str,
    ticket: &str,
    share_id: &str,
    required_permission: &str,
) -> Result<Claims, VerifyError> {
    let claims =
        decode_token(secret, ticket).map_err(|err| VerifyError::Unauthorized(err.to_string()))?;
    let kind = claims.kind();
    if kind != TicketKind::ReadTicket.as_str() && kind != TicketKind::InternalAgent.as_str() {
        return Err(VerifyError::Unauthorized("Invalid read ticket".into()));
    }
    if claims.str_claim("share_id") != share_id {
        return Err(VerifyError::Forbidden("Ticket share mismatch".into()));
    }
    if kind == TicketKind::ReadTicket.as_str()
        && !claims.permissions().contains(required_permission)
    {
        return Err(VerifyError::Forbidden("Permission denied".into()));
    }
    Ok(claims)
}

/// Upload tickets are bound to a `(transfer_id, receiver_share_id)` pair.
pub fn verify_transfer_ticket(
    secret: &str,
    ticket: &str,
    transfer_id: &str,
    share_id: &str,
) -> Result<Claims, VerifyError> {
    let claims =
        decode_token(secret, ticket).map_err(|err| VerifyError::Unauthorized(err.to_string()))?;
    if claims.kind() != TicketKind::TransferUploadTicket.as_str() {
        return Err(VerifyError::Unauthorized("Invalid transfer ticket".into()));
    }
    if claims.str_claim("transfer_id") != transfer_id {
        return Err(VerifyError::Forbidden("Transfer ticket mismatch".into()));
    }
    if claims.str_claim("receiver_share_id") != share_id {
        return Err(VerifyError::Forbidden("Share mismatch".into()));
    }
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::permission_set;

    const SECRET: &str = "unit-test-secret";

    #[test]
    fn round_trip_preserves_claims() {
        let mut payload = Map::new();
        payload.insert("kind".into(), "client_access".into());
        payload.insert("principal_id".into(), "p-1".into());
        let token = issue_token(SECRET, payload, 60);

        let claims = decode_token(SECRET, &token).expect("valid token");
        assert_eq!(claims.kind(), "client_access");
        assert_eq!(claims.str_claim("principal_id"), "p-1");
        assert!(claims.0.get("exp").and_then(Value::as_i64).unwrap() > unix_now());
    }

    #[test]
    fn tampered_body_is_rejected() {
        let token = issue_access_token(SECRET, "p-1", "d-1", 60);
        let mut bytes = token.into_bytes();
        bytes[2] = if bytes[2] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();
        assert!(decode_token(SECRET, &tampered).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue_access_token(SECRET, "p-1", "d-1", 60);
        assert!(decode_token("other-secret", &token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let mut payload = Map::new();
        payload.insert("kind".into(), "client_access".into());
        payload.insert("exp".into(), Value::from(unix_now() - 10));
        let body = serde_json::to_vec(&Value::Object(payload)).unwrap();
        let token = encode_parts(SECRET, &body);
        let err = decode_token(SECRET, &token).unwrap_err();
        assert_eq!(err.to_string(), "Token expired");
    }

    #[test]
    fn missing_exp_is_rejected() {
        let mut payload = Map::new();
        payload.insert("kind".into(), "client_access".into());
        let body = serde_json::to_vec(&Value::Object(payload)).unwrap();
        let token = encode_parts(SECRET, &body);
        assert!(decode_token(SECRET, &token).is_err());
    }

    #[test]
    fn non_object_body_is_rejected() {
        let body = serde_json::to_vec(&Value::from(42)).unwrap();
        let token = encode_parts(SECRET, &body);
        assert!(decode_token(SECRET, &token).is_err());
    }

    #[test]
    fn malformed_split_is_rejected() {
        assert!(decode_token(SECRET, "no-dot-here").is_err());
        assert!(decode_token(SECRET, "bad base64.bad base64").is_err());
    }

    #[test]
    fn body_is_canonical_sorted_json() {
        let mut payload = Map::new();
        payload.insert("zulu".into(), "z".into());
        payload.insert("alpha".into(), "a".into());
        payload.insert("kind".into(), "client_access".into());
        let token = issue_token(SECRET, payload, 60);

        let body_part = token.split('.').next().unwrap();
        let body = URL_SAFE_NO_PAD.decode(body_part).unwrap();
        let text = String::from_utf8(body).unwrap();
        let alpha = text.find("\"alpha\"").unwrap();
        let exp = text.find("\"exp\"").unwrap();
        let kind = text.find("\"kind\"").unwrap();
        let zulu = text.find("\"zulu\"").unwrap();
        assert!(alpha < exp && exp < kind && kind < zulu);
        assert!(!text.contains(": "));
    }

    #[test]
    fn read_ticket_verifies_share_and_permission() {
        let perms = permission_set(&["read", "download"]);
        let ticket = issue_read_ticket(SECRET, "p-1", "share-1", &perms, 60);

        assert!(verify_read_ticket(SECRET, &ticket, "share-1", "read").is_ok());
        assert!(matches!(
            verify_read_ticket(SECRET, &ticket, "share-2", "read"),
            Err(VerifyError::Forbidden(_))
        ));
        assert!(matches!(
            verify_read_ticket(SECRET, &ticket, "share-1", "manage_share"),
            Err(VerifyError::Forbidden(_))
        ));
    }

    #[test]
    fn internal_agent_ticket_skips_permission_check() {
        let ticket = issue_internal_agent_ticket(SECRET, "share-1");
        assert!(verify_read_ticket(SECRET, &ticket, "share-1", "download").is_ok());
    }

    #[test]
    fn transfer_ticket_is_bound_to_transfer_and_share() {
        let ticket = issue_transfer_ticket(SECRET, "p-1", "t-1", "dev-1", "share-1", 60);
        assert!(verify_transfer_ticket(SECRET, &ticket, "t-1", "share-1").is_ok());
        assert!(matches!(
            verify_transfer_ticket(SECRET, &ticket, "t-2", "share-1"),
            Err(VerifyError::Forbidden(_))
        ));
        assert!(matches!(
            verify_transfer_ticket(SECRET, &ticket, "t-1", "share-2"),
            Err(VerifyError::Forbidden(_))
        ));

        let read = issue_read_ticket(SECRET, "p-1", "share-1", &permission_set(&["read"]), 60);
        assert!(matches!(
            verify_transfer_ticket(SECRET, &read, "t-1", "share-1"),
            Err(VerifyError::Unauthorized(_))
        ));
    }
}
