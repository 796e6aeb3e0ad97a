mod discovery;
mod net;
mod settings;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use beacon_types::api::{PairingStartRequest, PairingStartResponse};

use crate::settings::{LauncherSettings, settings_path};

fn env_port(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

/// Resolve a sibling service binary next to the launcher, falling back to
/// PATH lookup.
fn service_binary(name: &str) -> PathBuf {
    if let Ok(current) = std::env::current_exe() {
        if let Some(dir) = current.parent() {
            let candidate = dir.join(name);
            if candidate.exists() {
                return candidate;
            }
        }
    }
    PathBuf::from(name)
}

fn spawn_coordinator(settings: &LauncherSettings, port: u16) -> Result<Child> {
    let mut command = Command::new(service_binary("beacon-coordinator"));
    command
        .env("COORDINATOR_SECRET_KEY", &settings.secret_key)
        .env(
            "COORDINATOR_AGENT_SHARED_SECRET",
            &settings.agent_shared_secret,
        )
        .env("COORDINATOR_PORT", port.to_string())
        .kill_on_drop(true);
    command
        .spawn()
        .context("failed to spawn beacon-coordinator")
}

fn spawn_agent(
    settings: &LauncherSettings,
    coordinator_url: &str,
    public_base_url: &str,
    port: u16,
) -> Result<Child> {
    let mut command = Command::new(service_binary("beacon-agent"));
    command
        .env("COORDINATOR_SECRET_KEY", &settings.secret_key)
        .env(
            "COORDINATOR_AGENT_SHARED_SECRET",
            &settings.agent_shared_secret,
        )
        .env("AGENT_COORDINATOR_URL", coordinator_url)
        .env("AGENT_PUBLIC_BASE_URL", public_base_url)
        .env("AGENT_DEVICE_ID", &settings.agent_device_id)
        .env("AGENT_OWNER_PRINCIPAL_ID", &settings.principal_id)
        .env("AGENT_DEFAULT_SHARE_ID", &settings.default_share_id)
        .env("AGENT_PORT", port.to_string())
        .kill_on_drop(true);
    command.spawn().context("failed to spawn beacon-agent")
}

/// Poll the local coordinator until its discovery signature answers.
async fn wait_for_coordinator(url: &str, budget: Duration) -> bool {
    let client = reqwest::Client::new();
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let probe = client
            .get(format!("{}/", url.trim_end_matches('/')))
            .timeout(Duration::from_millis(400))
            .send()
            .await;
        if let Ok(response) = probe {
            if let Ok(payload) = response.json::<serde_json::Value>().await {
                if payload.get("service").and_then(|v| v.as_str()) == Some("coordinator") {
                    return true;
                }
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

fn device_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "beacon-device".to_string())
}

/// Bootstrap (or re-join) against the chosen coordinator. Only the first
/// principal on a fresh coordinator gets credentials back; otherwise a
/// pairing session needs human confirmation and we log the code.
async fn auto_join(settings: &mut LauncherSettings, coordinator_url: &str) -> Result<bool> {
    let client = reqwest::Client::new();
    let body = PairingStartRequest {
        display_name: std::env::var("BEACON_DISPLAY_NAME")
            .unwrap_or_else(|_| "Beacon Owner".to_string()),
        device_name: device_name(),
        platform: std::env::consts::OS.to_string(),
        public_key: None,
    };
    let response = client
        .post(format!(
            "{}/api/v1/pairing/start?auto_join=1",
            coordinator_url.trim_end_matches('/')
        ))
        .json(&body)
        .timeout(Duration::from_secs(8))
        .send()
        .await
        .context("pairing/start request failed")?;
    if !response.status().is_success() {
        anyhow::bail!("pairing/start returned {}", response.status());
    }
    let payload: PairingStartResponse = response.json().await.context("bad pairing response")?;

    if payload.bootstrap {
        settings.principal_id = payload.principal_id.unwrap_or_default();
        settings.client_device_id = payload.client_device_id.unwrap_or_default();
        settings.device_secret = payload.device_secret.unwrap_or_default();
        settings.coordinator_url = coordinator_url.to_string();
        info!("Bootstrapped first principal {}", settings.principal_id);
        return Ok(true);
    }

    if let (Some(session), Some(code)) = (payload.pending_pairing_id, payload.pairing_code) {
        warn!(
            "Coordinator already has principals; confirm pairing session {} with code {} from an existing device",
            session, code
        );
    }
    Ok(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon_launcher=info".into()),
        )
        .init();

    let path = settings_path();
    let mut settings = LauncherSettings::load(&path);
    if settings.materialize() {
        settings.save(&path)?;
        info!("Materialized secrets and ids into {}", path.display());
    }

    let coordinator_port = env_port("COORDINATOR_PORT", 7000);
    let agent_port = env_port("AGENT_PORT", 7001);
    let lan_ip = net::preferred_lan_ipv4();
    let local_coordinator_url = format!("http://{lan_ip}:{coordinator_port}");
    info!("Preferred LAN address: {}", lan_ip);

    let mut coordinator_child = spawn_coordinator(&settings, coordinator_port)?;
    let local_probe_url = format!("http://127.0.0.1:{coordinator_port}");
    if !wait_for_coordinator(&local_probe_url, Duration::from_secs(10)).await {
        warn!("Local coordinator did not come up within 10s; continuing anyway");
    }

    // Prefer an already-running coordinator elsewhere on the LAN; fall back
    // to our own.
    let discovered = discovery::discover_coordinators(coordinator_port).await;
    let chosen_coordinator = discovered
        .iter()
        .find(|url| !url.contains("127.0.0.1") && !url.contains("localhost"))
        .cloned()
        .unwrap_or(local_coordinator_url.clone());
    info!(
        "Using coordinator {} ({} discovered)",
        chosen_coordinator,
        discovered.len()
    );

    if !settings.has_identity() || settings.coordinator_url != chosen_coordinator {
        match auto_join(&mut settings, &chosen_coordinator).await {
            Ok(true) => settings.save(&path)?,
            Ok(false) => {}
            Err(err) => warn!("Auto-join failed: {:#}", err),
        }
    }

    let agent_public_url = format!("http://{lan_ip}:{agent_port}");
    let mut agent_child = spawn_agent(
        &settings,
        &chosen_coordinator,
        &agent_public_url,
        agent_port,
    )?;

    info!("All services up; Ctrl+C to stop");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
        status = coordinator_child.wait() => warn!("Coordinator exited: {:?}", status),
        status = agent_child.wait() => warn!("Agent exited: {:?}", status),
    }

    let _ = agent_child.kill().await;
    let _ = coordinator_child.kill().await;
    Ok(())
}
