use std::path::PathBuf;

use anyhow::{Result, bail};

/// Secret values that MUST NOT survive into a real deployment.
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

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub database_path: PathBuf,
    pub secret_key: String,
    pub agent_shared_secret: String,
    pub access_token_ttl_seconds: i64,
    pub events_ws_token_ttl_seconds: i64,
    pub read_ticket_ttl_seconds: i64,
    pub transfer_ticket_ttl_seconds: i64,
    pub passcode_window_seconds: i64,
    pub pairing_code_ttl_seconds: i64,
    pub browse_pin: Option<String>,
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

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

/// Accepts either a bare filesystem path or a `sqlite:///` URL.
fn database_path() -> PathBuf {
    let raw = std::env::var("COORDINATOR_DATABASE_URL")
        .unwrap_or_else(|_| "./coordinator.db".to_string());
    let trimmed = raw
        .strip_prefix("sqlite:///")
        .or_else(|| raw.strip_prefix("sqlite://"))
        .unwrap_or(&raw);
    PathBuf::from(trimmed)
}

pub fn load_config() -> Result<CoordinatorConfig> {
    Ok(CoordinatorConfig {
        database_path: database_path(),
        secret_key: secure_value(
            "COORDINATOR_SECRET_KEY",
            "replace-with-secure-key",
            BLOCKED_SECRET_KEYS,
        )?,
        agent_shared_secret: secure_value(
            "COORDINATOR_AGENT_SHARED_SECRET",
            "replace-agent-secret",
            BLOCKED_AGENT_SECRETS,
        )?,
        access_token_ttl_seconds: env_i64("COORDINATOR_ACCESS_TOKEN_TTL", 3600),
        events_ws_token_ttl_seconds: env_i64("COORDINATOR_EVENTS_WS_TOKEN_TTL", 90),
        read_ticket_ttl_seconds: env_i64("COORDINATOR_READ_TICKET_TTL", 1800),
        transfer_ticket_ttl_seconds: env_i64("COORDINATOR_TRANSFER_TICKET_TTL", 1800),
        passcode_window_seconds: env_i64("COORDINATOR_PASSCODE_WINDOW_SECONDS", 300),
        pairing_code_ttl_seconds: env_i64("COORDINATOR_PAIRING_CODE_TTL", 600),
        browse_pin: std::env::var("COORDINATOR_BROWSE_PIN")
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|pin| !pin.is_empty()),
        host: std::env::var("COORDINATOR_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
        port: std::env::var("COORDINATOR_PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(7000),
    })
}
