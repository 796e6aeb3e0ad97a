use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::TransferView;

// ── Pairing ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingStartRequest {
    pub display_name: String,
    pub device_name: String,
    pub platform: String,
    #[serde(default)]
    pub public_key: Option<String>,
}

/// Response for both bootstrap and later pairing sessions. Bootstrap fills
/// the credential fields directly; a pairing session returns the pending id
/// plus the 6-digit code instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PairingStartResponse {
    pub bootstrap: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_pairing_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfirmRequest {
    pub pending_pairing_id: String,
    pub pairing_code: String,
}

// ── Auth ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthTokenRequest {
    pub principal_id: String,
    pub client_device_id: String,
    pub device_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthTokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub principal_id: String,
    pub client_device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsWsTokenResponse {
    pub ws_token: String,
    pub expires_in: u64,
}

// ── Transfers ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferItemInput {
    pub filename: String,
    pub size: u64,
    pub sha256: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferCreateRequest {
    pub receiver_device_id: String,
    pub receiver_share_id: String,
    pub items: Vec<TransferItemInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferApproveRequest {
    pub passcode: String,
    #[serde(default)]
    pub destination_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRejectRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasscodeOpenRequest {
    pub passcode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasscodeOpenResponse {
    pub transfer: TransferView,
    pub upload_ticket: String,
    pub upload_base_url: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisibilityRequest {
    pub visible: bool,
}

// ── Internal (agent ↔ coordinator) ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentShareRegistration {
    #[serde(default)]
    pub share_id: Option<String>,
    pub name: String,
    pub root_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegisterRequest {
    #[serde(default)]
    pub agent_device_id: Option<String>,
    pub owner_principal_id: String,
    pub name: String,
    pub base_url: String,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default)]
    pub shares: Vec<AgentShareRegistration>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredShare {
    pub id: String,
    pub name: String,
    pub root_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegisterResponse {
    pub device_id: String,
    pub shares: Vec<RegisteredShare>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeatRequest {
    #[serde(default = "default_true")]
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferItemStateRequest {
    pub state: String,
}

/// Manifest the agent fetches before accepting the first chunk of an item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemManifest {
    pub transfer_id: String,
    pub receiver_share_id: String,
    pub item_id: String,
    pub filename: String,
    pub size: u64,
    pub sha256: String,
    pub mime_type: Option<String>,
    pub state: String,
}

// ── Agent inbox ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeRequest {
    pub item_id: String,
    #[serde(default)]
    pub destination_path: String,
    #[serde(default = "default_true")]
    pub keep_original_name: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkResponse {
    pub item_id: String,
    pub received_size: u64,
    pub expected_size: u64,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitResponse {
    pub item_id: String,
    pub state: String,
    pub inbox_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeResponse {
    pub item_id: String,
    pub state: String,
    pub final_path: String,
}
