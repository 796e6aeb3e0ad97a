use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Agent device as seen in catalog listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceView {
    pub id: String,
    pub name: String,
    pub owner_principal_id: String,
    pub visible: bool,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Share as seen in catalog listings, annotated with the caller's permissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareView {
    pub id: String,
    pub name: String,
    pub device_id: String,
    pub read_only: bool,
    pub permissions: Vec<String>,
    pub device_online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferItemView {
    pub id: String,
    pub filename: String,
    pub size: u64,
    pub sha256: String,
    pub mime_type: Option<String>,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferView {
    pub id: String,
    pub sender_principal_id: String,
    pub sender_client_device_id: String,
    pub receiver_device_id: String,
    pub receiver_share_id: String,
    pub state: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub items: Vec<TransferItemView>,
}

/// One directory entry returned by agent list/search endpoints.
///
/// The federated annotations (`device_id` and friends) and the synthesized
/// URLs are only present in coordinator responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
    pub path: String,
    pub parent_path: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

/// Directory listing payload from the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingPayload {
    pub current_path: String,
    pub parent_path: Option<String>,
    pub items: Vec<FileEntry>,
    pub truncated: bool,
    pub limit: usize,
}

/// Search payload from a single agent share.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPayload {
    pub query: String,
    pub base_path: String,
    pub recursive: bool,
    pub items: Vec<FileEntry>,
    pub truncated: bool,
}

/// Per-share failure recorded during a federated search fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchShareError {
    pub device_id: String,
    pub share_id: String,
    pub error: String,
}

/// Compact-mode access descriptor: instead of per-item URLs the client gets
/// one ticket per share and builds URLs itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareAccess {
    pub device_id: String,
    pub share_id: String,
    pub agent_base_url: String,
    pub ticket: String,
    pub permissions: Vec<String>,
    pub can_download: bool,
    pub expires_in: u64,
}

/// Inbox item snapshot returned by the agent status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxItemView {
    pub item_id: String,
    pub filename: String,
    pub expected_size: u64,
    pub received_size: u64,
    pub state: String,
}
