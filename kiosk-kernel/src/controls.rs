/**
 * COMMANDES DE CONTRÔLE - Producteurs fast loop, debug, reboot, mise à jour, shell
 *
 * RÔLE :
 * Enveloppes fines au-dessus de la file : valider le kiosque, construire un
 * payload typé, enqueue, journaliser. Chaque appel est une transaction.
 *
 * ÉTAT DÉSIRÉ :
 * fast loop et debug écrivent aussi le flag/intervalle voulu sur le kiosque,
 * en une seule mise à jour atomique, pour affichage avant confirmation.
 */

use crate::context::RequestContext;
use crate::error::{DispatchError, DispatchResult};
use crate::models::{
    AuditAction, CommandKind, FastLoopPayload, RebootPayload, ShellPayload, TogglePayload,
};
use crate::store::{AuditSink, CommandStore, Database, DeviceStore};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::info;

const DANGEROUS_PATTERNS: [&str; 5] = ["rm -rf", "dd if=", "mkfs", "`", "$("];

/// Intervalles de poll appliqués par le toggle fast loop
#[derive(Debug, Clone, Copy)]
pub struct PollIntervals {
    pub fast_secs: u32,
    pub normal_secs: u32,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self { fast_secs: 10, normal_secs: 300 }
    }
}

fn enqueue_audited<R>(
    repo: &R,
    device_id: i64,
    kind: &CommandKind,
    action: AuditAction,
    mut details: Value,
    ctx: &RequestContext,
    now: OffsetDateTime,
) -> DispatchResult<i64>
where
    R: CommandStore + AuditSink,
{
    let command_id = repo.enqueue(device_id, kind, now)?;
    details["requested_by"] = json!(ctx.operator);
    details["command_type"] = json!(kind.tag());
    repo.append_audit(device_id, command_id, action, &details, now)?;
    info!(device_id, command_id, kind = kind.tag(), operator = %ctx.operator, "control command queued");
    Ok(command_id)
}

fn require_device<R: DeviceStore>(repo: &R, device_id: i64) -> DispatchResult<()> {
    repo.device(device_id)?
        .map(|_| ())
        .ok_or_else(|| DispatchError::not_found("device", device_id))
}

pub fn set_fast_loop(
    db: &Database,
    ctx: &RequestContext,
    device_id: i64,
    enable: bool,
    intervals: PollIntervals,
    now: OffsetDateTime,
) -> DispatchResult<i64> {
    let interval_secs = if enable { intervals.fast_secs } else { intervals.normal_secs };
    db.transaction(|repo| {
        require_device(repo, device_id)?;
        let kind = CommandKind::ToggleFastLoop(FastLoopPayload { enable, interval_secs });
        let id = enqueue_audited(
            repo,
            device_id,
            &kind,
            AuditAction::FastLoopControl,
            json!({ "enable": enable, "interval_secs": interval_secs }),
            ctx,
            now,
        )?;
        repo.set_fast_loop(device_id, enable, interval_secs)?;
        Ok(id)
    })
}

pub fn set_debug_mode(
    db: &Database,
    ctx: &RequestContext,
    device_id: i64,
    enable: bool,
    now: OffsetDateTime,
) -> DispatchResult<i64> {
    db.transaction(|repo| {
        require_device(repo, device_id)?;
        let kind = CommandKind::ToggleDebug(TogglePayload { enable });
        let id = enqueue_audited(
            repo,
            device_id,
            &kind,
            AuditAction::DebugModeControl,
            json!({ "enable": enable }),
            ctx,
            now,
        )?;
        repo.set_debug_mode(device_id, enable)?;
        Ok(id)
    })
}

pub fn request_reboot(
    db: &Database,
    ctx: &RequestContext,
    device_id: i64,
    delay_seconds: u32,
    now: OffsetDateTime,
) -> DispatchResult<i64> {
    db.transaction(|repo| {
        require_device(repo, device_id)?;
        enqueue_audited(
            repo,
            device_id,
            &CommandKind::Reboot(RebootPayload { delay_seconds }),
            AuditAction::RebootRequested,
            json!({ "delay_seconds": delay_seconds }),
            ctx,
            now,
        )
    })
}

pub fn queue_forced_update(
    db: &Database,
    ctx: &RequestContext,
    device_id: i64,
    now: OffsetDateTime,
) -> DispatchResult<i64> {
    db.transaction(|repo| {
        require_device(repo, device_id)?;
        enqueue_audited(
            repo,
            device_id,
            &CommandKind::ForcedUpdate,
            AuditAction::FullUpdateQueued,
            json!({}),
            ctx,
            now,
        )
    })
}

/// Rejette les commandes vides ou contenant un motif destructeur
pub fn validate_shell_command(command: &str) -> DispatchResult<&str> {
    let command = command.trim();
    if command.is_empty() {
        return Err(DispatchError::InvalidRequest("command is empty".into()));
    }
    if let Some(pattern) = DANGEROUS_PATTERNS.iter().find(|p| command.contains(*p)) {
        return Err(DispatchError::InvalidRequest(format!(
            "command contains forbidden pattern '{pattern}'"
        )));
    }
    Ok(command)
}

pub fn queue_custom_shell(
    db: &Database,
    ctx: &RequestContext,
    device_id: i64,
    command: &str,
    now: OffsetDateTime,
) -> DispatchResult<i64> {
    let command = validate_shell_command(command)?;
    db.transaction(|repo| {
        require_device(repo, device_id)?;
        enqueue_audited(
            repo,
            device_id,
            &CommandKind::CustomShell(ShellPayload { command: command.to_string() }),
            AuditAction::Queued,
            json!({ "command_length": command.len() }),
            ctx,
            now,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CommandStatus, NewDevice};
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2025-03-01 12:00 UTC);

    fn setup() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let id = db.with_repo(|repo| repo.insert_device(&NewDevice::new("lobby", None))).unwrap();
        (db, id)
    }

    #[test]
    fn test_fast_loop_persists_desired_state() {
        let (db, device) = setup();
        let ctx = RequestContext::new("ops");
        let id = set_fast_loop(&db, &ctx, device, true, PollIntervals::default(), NOW).unwrap();

        let (stored, command, audit) = db
            .with_repo(|repo| Ok((repo.device(device)?, repo.command(id)?, repo.audit_for_device(device, 10)?)))
            .unwrap();
        let stored = stored.unwrap();
        assert!(stored.fast_loop_enabled);
        assert_eq!(stored.poll_interval_secs, 10);

        let command = command.unwrap();
        assert_eq!(command.status, CommandStatus::Pending);
        assert_eq!(
            command.kind,
            CommandKind::ToggleFastLoop(FastLoopPayload { enable: true, interval_secs: 10 })
        );
        assert_eq!(audit[0].action, AuditAction::FastLoopControl);
        assert_eq!(audit[0].details["requested_by"], "ops");

        set_fast_loop(&db, &ctx, device, false, PollIntervals::default(), NOW).unwrap();
        let stored = db.with_repo(|repo| repo.device(device)).unwrap().unwrap();
        assert!(!stored.fast_loop_enabled);
        assert_eq!(stored.poll_interval_secs, 300);
    }

    #[test]
    fn test_debug_mode_toggle() {
        let (db, device) = setup();
        set_debug_mode(&db, &RequestContext::new("ops"), device, true, NOW).unwrap();
        let stored = db.with_repo(|repo| repo.device(device)).unwrap().unwrap();
        assert!(stored.debug_mode);
    }

    #[test]
    fn test_unknown_device_writes_nothing() {
        let (db, device) = setup();
        let ctx = RequestContext::new("ops");
        let err = request_reboot(&db, &ctx, 999, 30, NOW).unwrap_err();
        assert!(matches!(err, DispatchError::NotFound { .. }));
        let err = queue_forced_update(&db, &ctx, 999, NOW).unwrap_err();
        assert!(matches!(err, DispatchError::NotFound { .. }));
        assert!(db.with_repo(|repo| repo.commands_for_device(device, 10)).unwrap().is_empty());
    }

    #[test]
    fn test_reboot_payload() {
        let (db, device) = setup();
        let id = request_reboot(&db, &RequestContext::new("ops"), device, 45, NOW).unwrap();
        let command = db.with_repo(|repo| repo.command(id)).unwrap().unwrap();
        assert_eq!(command.kind, CommandKind::Reboot(RebootPayload { delay_seconds: 45 }));
    }

    #[test]
    fn test_shell_command_filter() {
        assert!(validate_shell_command("   ").is_err());
        assert!(validate_shell_command("rm -rf /").is_err());
        assert!(validate_shell_command("echo $(whoami)").is_err());
        assert!(validate_shell_command("echo `id`").is_err());
        assert_eq!(validate_shell_command(" uptime ").unwrap(), "uptime");
    }

    #[test]
    fn test_custom_shell_queued() {
        let (db, device) = setup();
        let id = queue_custom_shell(&db, &RequestContext::new("ops"), device, "uptime", NOW).unwrap();
        let audit = db.with_repo(|repo| repo.audit_for_device(device, 10)).unwrap();
        assert_eq!(audit[0].command_id, id);
        assert_eq!(audit[0].action, AuditAction::Queued);
    }
}
