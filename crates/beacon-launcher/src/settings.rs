use std::path::{Path, PathBuf};

use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persistent launcher state: generated secrets, stable device/share ids,
/// and the credentials obtained from auto-join. Lives in a small JSON file
/// next to the data directory so restarts reuse the same identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LauncherSettings {
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub agent_shared_secret: String,
    #[serde(default)]
    pub agent_device_id: String,
    #[serde(default)]
    pub default_share_id: String,
    #[serde(default)]
    pub principal_id: String,
    #[serde(default)]
    pub client_device_id: String,
    #[serde(default)]
    pub device_secret: String,
    #[serde(default)]
    pub coordinator_url: String,
}

pub fn settings_path() -> PathBuf {
    std::env::var("BEACON_SETTINGS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./beacon-settings.json"))
}

fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

impl LauncherSettings {
    pub fn load(path: &Path) -> Self {
        std::fs::read(path)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Fill in any missing secrets and ids. Environment values win over
    /// generated ones so operators can pin them. Returns true when anything
    /// changed and the file should be rewritten.
    pub fn materialize(&mut self) -> bool {
        let mut changed = false;
        if let Ok(value) = std::env::var("COORDINATOR_SECRET_KEY") {
            if !value.trim().is_empty() && self.secret_key != value {
                self.secret_key = value;
                changed = true;
            }
        }
        if self.secret_key.is_empty() {
            self.secret_key = random_secret();
            changed = true;
        }
        if let Ok(value) = std::env::var("COORDINATOR_AGENT_SHARED_SECRET") {
            if !value.trim().is_empty() && self.agent_shared_secret != value {
                self.agent_shared_secret = value;
                changed = true;
            }
        }
        if self.agent_shared_secret.is_empty() {
            self.agent_shared_secret = random_secret();
            changed = true;
        }
        if self.agent_device_id.is_empty() {
            self.agent_device_id = Uuid::new_v4().to_string();
            changed = true;
        }
        if self.default_share_id.is_empty() {
            self.default_share_id = Uuid::new_v4().to_string();
            changed = true;
        }
        changed
    }

    pub fn has_identity(&self) -> bool {
        !self.principal_id.is_empty()
            && !self.client_device_id.is_empty()
            && !self.device_secret.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialize_fills_missing_fields_once() {
        let mut settings = LauncherSettings::default();
        assert!(settings.materialize());
        assert!(!settings.secret_key.is_empty());
        assert!(!settings.agent_shared_secret.is_empty());
        assert!(!settings.agent_device_id.is_empty());
        assert!(!settings.default_share_id.is_empty());

        let snapshot = settings.clone();
        assert!(!settings.materialize());
        assert_eq!(settings.secret_key, snapshot.secret_key);
        assert_eq!(settings.agent_device_id, snapshot.agent_device_id);
    }

    #[test]
    fn settings_round_trip_through_disk() {
        let path = std::env::temp_dir().join(format!(
            "beacon_settings_test_{}.json",
            std::process::id()
        ));
        let mut settings = LauncherSettings::default();
        settings.materialize();
        settings.principal_id = "p-1".into();
        settings.save(&path).unwrap();

        let loaded = LauncherSettings::load(&path);
        assert_eq!(loaded.secret_key, settings.secret_key);
        assert_eq!(loaded.principal_id, "p-1");
        std::fs::remove_file(&path).unwrap();
    }
}
