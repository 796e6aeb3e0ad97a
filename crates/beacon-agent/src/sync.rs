//! Best-effort calls from the agent to the coordinator's internal API.
//! Registration and state pushes are fire-and-forget from the caller's view;
//! failures are logged and swallowed.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};

use beacon_types::api::ItemManifest;

use crate::config::AgentConfig;

#[derive(Clone)]
pub struct CoordinatorClient {
    http: reqwest::Client,
    config: Arc<AgentConfig>,
}

impl CoordinatorClient {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(25))
            .build()
            .expect("reqwest client builds");
        Self { http, config }
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/api/v1/internal/{}",
            self.config.coordinator_url.trim_end_matches('/'),
            suffix
        )
    }

    /// Announce this agent and its shares. Returns the coordinator's reply,
    /// or `None` when the coordinator cannot be reached.
    pub async fn register(&self, shares: Vec<Value>) -> Option<Value> {
        let payload = json!({
            "agent_device_id": self.config.agent_device_id,
            "owner_principal_id": self.config.owner_principal_id,
            "name": self.config.agent_name,
            "base_url": self.config.public_base_url,
            "visible": true,
            "shares": shares,
        });
        let result = self
            .http
            .post(self.url("agents/register"))
            .header("x-agent-secret", &self.config.coordinator_agent_secret)
            .json(&payload)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => response.json().await.ok(),
            Ok(response) => {
                warn!(
                    "Failed to register agent with coordinator: status {}",
                    response.status()
                );
                None
            }
            Err(err) => {
                warn!("Failed to register agent with coordinator: {}", err);
                None
            }
        }
    }

    pub async fn heartbeat(&self) {
        let result = self
            .http
            .post(self.url(&format!(
                "agents/{}/heartbeat",
                self.config.agent_device_id
            )))
            .header("x-agent-secret", &self.config.coordinator_agent_secret)
            .json(&json!({ "online": true }))
            .send()
            .await;
        if let Err(err) = result {
            debug!("Coordinator heartbeat failed: {}", err);
        }
    }

    /// Push an item state transition. Best-effort: the coordinator treats
    /// these as idempotent, so a lost notification is repaired by the next.
    pub async fn notify_item_state(&self, transfer_id: &str, item_id: &str, state: &str) {
        let result = self
            .http
            .post(self.url(&format!("transfers/{transfer_id}/items/{item_id}/state")))
            .header("x-agent-secret", &self.config.coordinator_agent_secret)
            .json(&json!({ "state": state }))
            .send()
            .await;
        if let Err(err) = result {
            debug!("Failed to push transfer item state to coordinator: {}", err);
        }
    }

    /// Fetch the manifest for an item this agent has not seen before.
    /// `None` means "not approved" (404) or coordinator unreachable.
    pub async fn fetch_item_manifest(
        &self,
        transfer_id: &str,
        item_id: &str,
    ) -> Option<ItemManifest> {
        let result = self
            .http
            .get(self.url(&format!("transfers/{transfer_id}/items/{item_id}")))
            .header("x-agent-secret", &self.config.coordinator_agent_secret)
            .header("x-agent-device-id", &self.config.agent_device_id)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => response.json().await.ok(),
            Ok(response) => {
                if response.status() != reqwest::StatusCode::NOT_FOUND {
                    warn!(
                        "Failed to fetch transfer item manifest: status {}",
                        response.status()
                    );
                }
                None
            }
            Err(err) => {
                warn!("Failed to fetch transfer item manifest: {}", err);
                None
            }
        }
    }
}
