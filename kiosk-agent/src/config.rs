//! Agent configuration
//!
//! TOML file in the OS config dir (`kiosk-agent/config.toml`). Missing file
//! means defaults; the device token itself lives in `token_path`, written by
//! the token-swap command.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server_url: String,
    pub device_id: i64,
    pub device_name: String,
    pub token_path: PathBuf,
    pub poll_interval_secs: u64,
    pub command_timeout_secs: u64,
    /// Flags `.fast_loop_enabled` / `.debug_mode_enabled`
    pub flag_dir: PathBuf,
    pub update_script: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            device_id: 0,
            device_name: hostname::get().unwrap_or_default().to_string_lossy().to_string(),
            token_path: PathBuf::from("/opt/edudisplej/lic/token"),
            poll_interval_secs: 300,
            command_timeout_secs: 120,
            flag_dir: PathBuf::from("/opt/edudisplej"),
            update_script: PathBuf::from("/opt/edudisplej/init/update.sh"),
        }
    }
}

impl AgentConfig {
    /// Load config from OS-specific location
    pub async fn load() -> Result<Self> {
        Self::load_from(&Self::config_file_path()?).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("kiosk-agent");
        path.push("config.toml");
        Ok(path)
    }

    /// Token courant du kiosque (fichier écrit par le token swap)
    pub async fn read_token(&self) -> Result<String> {
        let raw = tokio::fs::read_to_string(&self.token_path)
            .await
            .with_context(|| format!("failed to read token {}", self.token_path.display()))?;
        let token = raw.trim().to_string();
        if token.is_empty() {
            anyhow::bail!("token file {} is empty", self.token_path.display());
        }
        Ok(token)
    }
}
