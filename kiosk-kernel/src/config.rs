use crate::controls::PollIntervals;
use crate::status::StatusPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub listen_addr: String,
    pub database_path: PathBuf,
    /// Vide : l'API admin refuse tout
    pub admin_api_key: String,
    pub status: StatusConf,
    pub commands: CommandsConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StatusConf {
    pub offline_threshold_secs: i64,
    pub upgrade_grace_secs: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CommandsConf {
    pub claim_timeout_secs: i64,
    pub sweep_interval_secs: u64,
    pub fast_poll_interval_secs: u32,
    pub normal_poll_interval_secs: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            database_path: PathBuf::from("./data/kiosk.db"),
            admin_api_key: String::new(),
            status: StatusConf::default(),
            commands: CommandsConf::default(),
        }
    }
}

impl Default for StatusConf {
    fn default() -> Self {
        Self { offline_threshold_secs: 600, upgrade_grace_secs: 1800 }
    }
}

impl Default for CommandsConf {
    fn default() -> Self {
        Self {
            claim_timeout_secs: 900,
            sweep_interval_secs: 60,
            fast_poll_interval_secs: 10,
            normal_poll_interval_secs: 300,
        }
    }
}

impl KernelConfig {
    pub fn status_policy(&self) -> StatusPolicy {
        StatusPolicy {
            offline_threshold: time::Duration::seconds(self.status.offline_threshold_secs),
            upgrade_grace: time::Duration::seconds(self.status.upgrade_grace_secs),
        }
    }

    pub fn poll_intervals(&self) -> PollIntervals {
        PollIntervals {
            fast_secs: self.commands.fast_poll_interval_secs,
            normal_secs: self.commands.normal_poll_interval_secs,
        }
    }

    pub fn claim_timeout(&self) -> time::Duration {
        time::Duration::seconds(self.commands.claim_timeout_secs)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.commands.sweep_interval_secs.max(1))
    }

    fn apply_env(mut self) -> Self {
        if let Ok(path) = std::env::var("KIOSK_DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Ok(addr) = std::env::var("KIOSK_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(key) = std::env::var("KIOSK_ADMIN_API_KEY") {
            self.admin_api_key = key;
        }
        self
    }
}

/// YAML → config, chaîne vide → défauts
pub fn parse_config(txt: &str) -> Result<KernelConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt)
}

async fn read_file(path: &Path) -> KernelConfig {
    if !path.exists() {
        info!(path = %path.display(), "no kernel config file, using defaults");
        return KernelConfig::default();
    }
    let txt = match fs::read_to_string(path).await {
        Ok(txt) => txt,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read kernel config, using defaults");
            return KernelConfig::default();
        }
    };
    parse_config(&txt).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "invalid kernel config, using defaults");
        KernelConfig::default()
    })
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("KIOSK_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    read_file(Path::new(&path)).await.apply_env()
}
