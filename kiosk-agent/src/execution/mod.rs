//! Command execution for kiosk agents
//!
//! Handles each command kind delivered by the kernel:
//! - Custom shell command via `bash -c` with timeout
//! - Token swap: write the new tenant token, then reboot after reporting
//! - Fast loop / debug toggles: flag files in `flag_dir`
//! - Reboot scheduling and forced update script

use crate::config::AgentConfig;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

pub const FAST_LOOP_FLAG: &str = ".fast_loop_enabled";
pub const DEBUG_FLAG: &str = ".debug_mode_enabled";

/// Command kinds understood by the agent (wire format `{"type", "payload"}`)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum AgentCommand {
    CustomShell { command: String },
    TokenSwapReboot { token: String },
    ToggleFastLoop { enable: bool, interval_secs: u64 },
    ToggleDebug { enable: bool },
    Reboot { delay_seconds: u64 },
    ForcedUpdate,
}

/// Action to run once the result has been reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostAction {
    None,
    Reboot,
}

/// Command execution result
#[derive(Debug)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub execution_time_ms: u128,
    pub post_action: PostAction,
}

pub struct CommandExecutor<'a> {
    config: &'a AgentConfig,
}

impl<'a> CommandExecutor<'a> {
    pub fn new(config: &'a AgentConfig) -> Self {
        Self { config }
    }

    pub async fn execute(&self, command: &AgentCommand) -> ExecutionResult {
        let start_time = Instant::now();
        let mut post_action = PostAction::None;

        let result = match command {
            AgentCommand::CustomShell { command } => self.shell(command).await,
            AgentCommand::TokenSwapReboot { token } => {
                let written = write_token(&self.config.token_path, token).await;
                if written.is_ok() {
                    post_action = PostAction::Reboot;
                }
                written
            }
            AgentCommand::ToggleFastLoop { enable, interval_secs } => {
                set_flag(&self.config.flag_dir, FAST_LOOP_FLAG, *enable)
                    .await
                    .map(|msg| format!("{msg} (interval {interval_secs}s)"))
            }
            AgentCommand::ToggleDebug { enable } => set_flag(&self.config.flag_dir, DEBUG_FLAG, *enable).await,
            AgentCommand::Reboot { delay_seconds } => schedule_reboot(*delay_seconds).await,
            AgentCommand::ForcedUpdate => {
                let script = self.config.update_script.display().to_string();
                self.shell(&script).await
            }
        };

        let execution_time_ms = start_time.elapsed().as_millis();
        match result {
            Ok(output) => ExecutionResult { success: true, output, error: None, execution_time_ms, post_action },
            Err(e) => ExecutionResult {
                success: false,
                output: String::new(),
                error: Some(format!("{e:#}")),
                execution_time_ms,
                post_action,
            },
        }
    }

    async fn shell(&self, command: &str) -> Result<String> {
        let (output, exit_code) = execute_unix_command(command, self.config.command_timeout_secs).await?;
        if exit_code != 0 {
            return Err(anyhow!("exit code {exit_code}: {output}"));
        }
        Ok(output)
    }
}

async fn execute_unix_command(command: &str, timeout_secs: u64) -> Result<(String, i32)> {
    debug!("Executing shell command: {} (timeout: {}s)", command, timeout_secs);
    let output = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        AsyncCommand::new("bash")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .context("Command timed out")?
    .context("Failed to execute command")?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let combined = if stderr.is_empty() { stdout.to_string() } else { format!("{stdout}{stderr}") };
    Ok((combined, output.status.code().unwrap_or(-1)))
}

async fn write_token(path: &Path, token: &str) -> Result<String> {
    let token = token.trim();
    if token.is_empty() {
        return Err(anyhow!("refusing to write an empty token"));
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("new");
    tokio::fs::write(&tmp, format!("{token}\n")).await.context("failed to write token")?;
    tokio::fs::rename(&tmp, path).await.context("failed to replace token")?;
    info!(path = %path.display(), "token replaced, reboot pending");
    Ok("token updated, rebooting".to_string())
}

async fn set_flag(dir: &Path, name: &str, enable: bool) -> Result<String> {
    let path = dir.join(name);
    if enable {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, b"1\n").await?;
        Ok(format!("{name} enabled"))
    } else {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("failed to remove flag"),
        }
        Ok(format!("{name} disabled"))
    }
}

async fn schedule_reboot(delay_seconds: u64) -> Result<String> {
    let when = if delay_seconds == 0 { "now".to_string() } else { format!("+{}", delay_seconds.div_ceil(60)) };
    let output = AsyncCommand::new("sudo")
        .args(["shutdown", "-r", &when])
        .output()
        .await
        .context("Failed to execute reboot command")?;
    if output.status.success() {
        Ok(format!("reboot scheduled ({when})"))
    } else {
        Err(anyhow!("Reboot failed: {}", String::from_utf8_lossy(&output.stderr)))
    }
}

/// Reboot immediately (after a token swap has been reported)
pub async fn reboot_now() -> Result<String> {
    schedule_reboot(0).await
}
