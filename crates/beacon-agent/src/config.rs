use std::path::PathBuf;

use anyhow::{Result, bail};
use uuid::Uuid;

const BLOCKED_SECRET_KEYS: &[&str] = &[
    "replace-with-secure-key",
    "replace-with-strong-coordinator-key",
    "replace-this-secret-key",
    "changeme",
];

const BLOCKED_AGENT_SECRETS: &[&str] = &[
    "replace-agent-secret",
    "replace-with-strong-agent-secret",
    "changeme",
];

pub const DEFAULT_UPLOAD_CHUNK_MAX_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_device_id: String,
    pub agent_name: String,
    pub owner_principal_id: String,
    pub public_base_url: String,
    pub coordinator_url: String,
    /// Shared secret for internal calls to the coordinator.
    pub coordinator_agent_secret: String,
    /// Coordinator signing key; tickets presented by clients verify against it.
    pub coordinator_secret_key: String,
    pub state_db_path: PathBuf,
    pub default_share_id: String,
    pub default_share_name: String,
    pub default_share_root: PathBuf,
    pub inbox_dir: PathBuf,
    pub heartbeat_interval_seconds: u64,
    pub upload_chunk_max_bytes: u64,
    pub host: String,
    pub port: u16,
}

fn allow_insecure_defaults() -> bool {
    std::env::var("ALLOW_INSECURE_DEFAULTS")
        .map(|v| v.trim() == "1")
        .unwrap_or(false)
}

fn secure_value(name: &str, default: &str, blocked: &[&str]) -> Result<String> {
    let value = std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .to_string();
    if value.is_empty() {
        bail!("{name} must not be empty");
    }
    if !allow_insecure_defaults() && blocked.contains(&value.as_str()) {
        bail!("{name} uses an insecure placeholder value; set a secure value");
    }
    Ok(value)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn db_path(name: &str, default: &str) -> PathBuf {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    let trimmed = raw
        .strip_prefix("sqlite:///")
        .or_else(|| raw.strip_prefix("sqlite://"))
        .unwrap_or(&raw);
    PathBuf::from(trimmed)
}

pub fn load_config() -> Result<AgentConfig> {
    let home = std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."));
    let root = std::env::var("AGENT_DEFAULT_SHARE_ROOT")
        .map(PathBuf::from)
        .unwrap_or(home);
    let inbox_dir = std::env::var("AGENT_INBOX_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| root.join(".inbox"));

    Ok(AgentConfig {
        agent_device_id: std::env::var("AGENT_DEVICE_ID")
            .unwrap_or_else(|_| Uuid::new_v4().to_string()),
        agent_name: std::env::var("AGENT_NAME").unwrap_or_else(|_| "Local Agent".to_string()),
        owner_principal_id: std::env::var("AGENT_OWNER_PRINCIPAL_ID").unwrap_or_default(),
        public_base_url: std::env::var("AGENT_PUBLIC_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:7001".to_string()),
        coordinator_url: std::env::var("AGENT_COORDINATOR_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:7000".to_string()),
        coordinator_agent_secret: secure_value(
            "COORDINATOR_AGENT_SHARED_SECRET",
            "replace-agent-secret",
            BLOCKED_AGENT_SECRETS,
        )?,
        coordinator_secret_key: secure_value(
            "COORDINATOR_SECRET_KEY",
            "replace-with-secure-key",
            BLOCKED_SECRET_KEYS,
        )?,
        state_db_path: db_path("AGENT_STATE_DB_URL", "./agent_state.db"),
        default_share_id: std::env::var("AGENT_DEFAULT_SHARE_ID")
            .unwrap_or_else(|_| Uuid::new_v4().to_string()),
        default_share_name: std::env::var("AGENT_DEFAULT_SHARE_NAME")
            .unwrap_or_else(|_| "Home".to_string()),
        default_share_root: root,
        inbox_dir,
        heartbeat_interval_seconds: env_u64("AGENT_HEARTBEAT_SECONDS", 20),
        upload_chunk_max_bytes: env_u64(
            "AGENT_UPLOAD_CHUNK_MAX_BYTES",
            DEFAULT_UPLOAD_CHUNK_MAX_BYTES,
        ),
        host: std::env::var("AGENT_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
        port: std::env::var("AGENT_PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(7001),
    })
}
