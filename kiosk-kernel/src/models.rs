/**
 * MODELS - Types du domaine kiosque
 *
 * RÔLE : Device, Tenant, Command (union fermée de types de commandes),
 * Migration et entrées du journal d'audit, tels que persistés et exposés en JSON.
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Statut brut stocké pour un kiosque
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
    Pending,
    Unconfigured,
    Upgrading,
    Error,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Pending => "pending",
            Self::Unconfigured => "unconfigured",
            Self::Upgrading => "upgrading",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            "pending" => Some(Self::Pending),
            "unconfigured" => Some(Self::Unconfigured),
            "upgrading" => Some(Self::Upgrading),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Institution propriétaire des kiosques
#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    pub is_active: bool,
}

impl Tenant {
    /// Token utilisable pour une migration : non vide, institution active
    pub fn active_token(&self) -> Option<&str> {
        if !self.is_active {
            return None;
        }
        self.api_token.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: i64,
    pub name: String,
    pub tenant_id: Option<i64>,
    pub status: DeviceStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_heartbeat: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub upgrade_started_at: Option<OffsetDateTime>,
    pub debug_mode: bool,
    pub fast_loop_enabled: bool,
    pub poll_interval_secs: u32,
    pub license_active: bool,
}

/// Données d'enregistrement d'un kiosque (fixtures, onboarding)
#[derive(Debug, Clone)]
pub struct NewDevice {
    pub name: String,
    pub tenant_id: Option<i64>,
    pub status: DeviceStatus,
    pub last_heartbeat: Option<OffsetDateTime>,
    pub upgrade_started_at: Option<OffsetDateTime>,
    pub poll_interval_secs: u32,
}

impl NewDevice {
    pub fn new(name: &str, tenant_id: Option<i64>) -> Self {
        Self {
            name: name.to_string(),
            tenant_id,
            status: DeviceStatus::Unconfigured,
            last_heartbeat: None,
            upgrade_started_at: None,
            poll_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Sent,
    Executed,
    Failed,
    Timeout,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Executed => "executed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "executed" => Some(Self::Executed),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Executed | Self::Failed | Self::Timeout)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Résultat rapporté par un kiosque pour une commande réclamée
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutcome {
    Executed,
    Failed,
}

impl ReportOutcome {
    pub fn status(&self) -> CommandStatus {
        match self {
            Self::Executed => CommandStatus::Executed,
            Self::Failed => CommandStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellPayload {
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSwapPayload {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastLoopPayload {
    pub enable: bool,
    pub interval_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TogglePayload {
    pub enable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootPayload {
    pub delay_seconds: u32,
}

/// Types de commandes supportés, chacun avec son payload typé.
/// Sérialisé en `{"type": "...", "payload": {...}}` vers les kiosques.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum CommandKind {
    CustomShell(ShellPayload),
    TokenSwapReboot(TokenSwapPayload),
    ToggleFastLoop(FastLoopPayload),
    ToggleDebug(TogglePayload),
    Reboot(RebootPayload),
    ForcedUpdate,
}

impl CommandKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::CustomShell(_) => "custom_shell",
            Self::TokenSwapReboot(_) => "token_swap_reboot",
            Self::ToggleFastLoop(_) => "toggle_fast_loop",
            Self::ToggleDebug(_) => "toggle_debug",
            Self::Reboot(_) => "reboot",
            Self::ForcedUpdate => "forced_update",
        }
    }

    /// Payload seul, pour la colonne `payload`
    pub fn payload_json(&self) -> serde_json::Result<String> {
        match self {
            Self::CustomShell(p) => serde_json::to_string(p),
            Self::TokenSwapReboot(p) => serde_json::to_string(p),
            Self::ToggleFastLoop(p) => serde_json::to_string(p),
            Self::ToggleDebug(p) => serde_json::to_string(p),
            Self::Reboot(p) => serde_json::to_string(p),
            Self::ForcedUpdate => Ok("{}".to_string()),
        }
    }

    /// Reconstruit la commande depuis (`command_type`, `payload`)
    pub fn from_parts(tag: &str, payload: &str) -> serde_json::Result<Self> {
        use serde::de::Error as _;

        Ok(match tag {
            "custom_shell" => Self::CustomShell(serde_json::from_str(payload)?),
            "token_swap_reboot" => Self::TokenSwapReboot(serde_json::from_str(payload)?),
            "toggle_fast_loop" => Self::ToggleFastLoop(serde_json::from_str(payload)?),
            "toggle_debug" => Self::ToggleDebug(serde_json::from_str(payload)?),
            "reboot" => Self::Reboot(serde_json::from_str(payload)?),
            "forced_update" => Self::ForcedUpdate,
            other => return Err(serde_json::Error::custom(format!("unknown command type '{other}'"))),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Command {
    pub id: i64,
    pub device_id: i64,
    #[serde(flatten)]
    pub kind: CommandKind,
    pub status: CommandStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub claimed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub executed_at: Option<OffsetDateTime>,
    pub output: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Migration {
    pub id: i64,
    pub device_id: i64,
    pub source_tenant_id: Option<i64>,
    pub target_tenant_id: i64,
    #[serde(skip_serializing)]
    pub target_token: String,
    pub status: MigrationStatus,
    pub command_id: Option<i64>,
    pub requested_by: Option<String>,
    pub note: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

/// Ligne migration à insérer ou écraser (upsert par device_id)
#[derive(Debug, Clone)]
pub struct NewMigration<'a> {
    pub device_id: i64,
    pub source_tenant_id: Option<i64>,
    pub target_tenant_id: i64,
    pub target_token: &'a str,
    pub command_id: i64,
    pub requested_by: &'a str,
    pub note: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Queued,
    FastLoopControl,
    DebugModeControl,
    RebootRequested,
    FullUpdateQueued,
    MigrationQueued,
    Claimed,
    Executed,
    Failed,
    Timeout,
    LateResult,
    Superseded,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::FastLoopControl => "fast_loop_control",
            Self::DebugModeControl => "debug_mode_control",
            Self::RebootRequested => "reboot_requested",
            Self::FullUpdateQueued => "full_update_queued",
            Self::MigrationQueued => "migration_queued",
            Self::Claimed => "claimed",
            Self::Executed => "executed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::LateResult => "late_result",
            Self::Superseded => "superseded",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "fast_loop_control" => Some(Self::FastLoopControl),
            "debug_mode_control" => Some(Self::DebugModeControl),
            "reboot_requested" => Some(Self::RebootRequested),
            "full_update_queued" => Some(Self::FullUpdateQueued),
            "migration_queued" => Some(Self::MigrationQueued),
            "claimed" => Some(Self::Claimed),
            "executed" => Some(Self::Executed),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            "late_result" => Some(Self::LateResult),
            "superseded" => Some(Self::Superseded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub device_id: i64,
    pub command_id: i64,
    pub action: AuditAction,
    pub details: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
