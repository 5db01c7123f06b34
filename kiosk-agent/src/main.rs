//! Kiosk Agent - poll loop running on each display device
//!
//! Every cycle:
//! - heartbeat to the kernel, picking up the desired poll interval
//! - claim the next pending command, execute it locally, report the outcome
//! - after a token swap, reboot once the result is reported

mod client;
mod config;
mod execution;

use anyhow::{Context, Result};
use client::{ClaimedCommand, KernelClient};
use config::AgentConfig;
use execution::{CommandExecutor, PostAction};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kiosk_agent=info")))
        .init();

    let config = AgentConfig::load().await.context("failed to load agent config")?;
    if config.device_id <= 0 {
        anyhow::bail!("device_id is not configured in {}", AgentConfig::config_file_path()?.display());
    }
    let client = KernelClient::new(&config.server_url).context("failed to build http client")?;

    info!(
        device_id = config.device_id,
        device = %config.device_name,
        server = %config.server_url,
        "kiosk agent starting"
    );

    let mut poll_interval = config.poll_interval_secs;
    loop {
        match poll_cycle(&config, &client).await {
            Ok(Some(interval)) if interval != poll_interval && interval > 0 => {
                info!(from = poll_interval, to = interval, "poll interval changed");
                poll_interval = interval;
            }
            Ok(_) => {}
            Err(e) => error!("poll cycle failed: {e:#}"),
        }
        tokio::time::sleep(Duration::from_secs(poll_interval)).await;
    }
}

/// Un cycle heartbeat → claim → execute → report. Renvoie l'intervalle désiré.
async fn poll_cycle(config: &AgentConfig, client: &KernelClient) -> Result<Option<u64>> {
    let token = config.read_token().await?;

    let interval = match client.heartbeat(&token, config.device_id).await {
        Ok(reply) => {
            debug!(debug_mode = reply.debug_mode, fast_loop = reply.fast_loop_enabled, "heartbeat ok");
            Some(reply.poll_interval_secs)
        }
        Err(e) => {
            warn!("heartbeat failed: {e}");
            None
        }
    };

    if let Some(claimed) = client.claim(&token, config.device_id).await? {
        run_command(config, client, &token, claimed).await?;
    }
    Ok(interval)
}

async fn run_command(config: &AgentConfig, client: &KernelClient, token: &str, claimed: ClaimedCommand) -> Result<()> {
    info!(command_id = claimed.id, kind = %claimed.command_type, "command claimed");

    let result = match claimed.decode() {
        Ok(command) => CommandExecutor::new(config).execute(&command).await,
        Err(e) => {
            warn!(command_id = claimed.id, "cannot decode command: {e}");
            client.report(token, claimed.id, false, "", Some(&format!("unsupported command: {e}"))).await?;
            return Ok(());
        }
    };

    info!(
        command_id = claimed.id,
        success = result.success,
        elapsed_ms = result.execution_time_ms as u64,
        "command executed"
    );

    // le report part avec le token en mémoire, même après un token swap
    let ack = client
        .report(token, claimed.id, result.success, &result.output, result.error.as_deref())
        .await?;
    if ack["ignored"] == true {
        warn!(command_id = claimed.id, "kernel ignored result: {}", ack["message"]);
    }

    if result.post_action == PostAction::Reboot {
        info!("rebooting after token swap");
        execution::reboot_now().await?;
    }
    Ok(())
}
