/**
 * DISPATCH KIOSQUE - Opérations côté device (heartbeat, claim, report) et sweep
 *
 * RÔLE :
 * Chaque poll est une requête courte contre le store : aucune attente sur un
 * kiosque, la boucle de poll du device est la seule "attente" du système.
 *
 * PORTÉE :
 * Un token d'institution agit pour un kiosque qui lui appartient, qui a une
 * migration ouverte vers elle, ou qui a déjà réclamé un token swap portant ce
 * token (le kiosque l'a installé avant la réaffectation, même si la migration
 * a depuis été redirigée).
 */

use crate::context::RequestContext;
use crate::error::{DispatchError, DispatchResult};
use crate::migration::reconcile_migrations;
use crate::models::{AuditAction, Command, CommandStatus, Device, DeviceStatus, ReportOutcome};
use crate::store::{AuditSink, CommandStore, Database, DeviceStore, MigrationStore, Reported};
use serde_json::json;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

/// Issue d'un report vue par le kiosque
#[derive(Debug, Clone)]
pub enum ReportAck {
    Recorded(Command),
    Duplicate(Command),
    /// Résultat pour une commande déjà close (timeout ou autre issue) : journalisé, ignoré
    Ignored { command_id: i64, status: CommandStatus },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub timed_out: usize,
    pub migrations_finished: usize,
}

fn authorize<R>(repo: &R, tenant_id: i64, device_id: i64) -> DispatchResult<Device>
where
    R: DeviceStore + MigrationStore + CommandStore,
{
    let device = repo
        .device(device_id)?
        .ok_or_else(|| DispatchError::not_found("device", device_id))?;
    if device.tenant_id == Some(tenant_id)
        || repo.has_migration_to(device_id, tenant_id)?
        || repo.received_token_of(device_id, tenant_id)?
    {
        return Ok(device);
    }
    warn!(device_id, tenant_id, "device credential does not cover this kiosk");
    Err(DispatchError::Unauthorized)
}

pub fn heartbeat(
    db: &Database,
    tenant_id: i64,
    device_id: i64,
    status: DeviceStatus,
    now: OffsetDateTime,
) -> DispatchResult<Device> {
    db.transaction(|repo| {
        authorize(repo, tenant_id, device_id)?;
        repo.record_heartbeat(device_id, status, now)?;
        repo.device(device_id)?
            .ok_or_else(|| DispatchError::not_found("device", device_id))
    })
}

pub fn claim(
    db: &Database,
    tenant_id: i64,
    device_id: i64,
    now: OffsetDateTime,
) -> DispatchResult<Option<Command>> {
    db.transaction(|repo| {
        authorize(repo, tenant_id, device_id)?;
        let Some(command) = repo.claim_next(device_id, now)? else {
            return Ok(None);
        };
        if repo.mark_migration_running(command.id, now)? {
            info!(device_id, command_id = command.id, "migration running");
        }
        repo.append_audit(
            device_id,
            command.id,
            AuditAction::Claimed,
            &json!({ "command_type": command.kind.tag() }),
            now,
        )?;
        debug!(device_id, command_id = command.id, "command claimed");
        Ok(Some(command))
    })
}

pub fn report(
    db: &Database,
    tenant_id: i64,
    command_id: i64,
    outcome: ReportOutcome,
    output: Option<&str>,
    error: Option<&str>,
    now: OffsetDateTime,
) -> DispatchResult<ReportAck> {
    db.transaction(|repo| {
        let command = repo
            .command(command_id)?
            .ok_or_else(|| DispatchError::not_found("command", command_id))?;
        match authorize(repo, tenant_id, command.device_id) {
            Ok(_) => {}
            Err(DispatchError::Unauthorized) => return Err(DispatchError::not_found("command", command_id)),
            Err(e) => return Err(e),
        }

        match repo.report_result(command_id, outcome, output, error, now) {
            Ok(Reported { command, duplicate: true }) => {
                debug!(command_id, "duplicate result ignored");
                Ok(ReportAck::Duplicate(command))
            }
            Ok(Reported { command, duplicate: false }) => {
                let action = match outcome {
                    ReportOutcome::Executed => AuditAction::Executed,
                    ReportOutcome::Failed => AuditAction::Failed,
                };
                repo.append_audit(
                    command.device_id,
                    command_id,
                    action,
                    &json!({
                        "command_type": command.kind.tag(),
                        "output_length": output.map_or(0, str::len),
                        "error_length": error.map_or(0, str::len),
                    }),
                    now,
                )?;
                info!(device_id = command.device_id, command_id, status = %command.status, "command result recorded");
                reconcile_migrations(repo, now)?;
                Ok(ReportAck::Recorded(command))
            }
            Err(DispatchError::AlreadyResolved { command_id, status }) => {
                warn!(command_id, %status, reported = ?outcome, "result for expired or resolved command");
                repo.append_audit(
                    command.device_id,
                    command_id,
                    AuditAction::LateResult,
                    &json!({
                        "reported": outcome.status().as_str(),
                        "current_status": status.as_str(),
                    }),
                    now,
                )?;
                Ok(ReportAck::Ignored { command_id, status })
            }
            Err(e) => Err(e),
        }
    })
}

/// Expire les commandes réclamées sans résultat puis réconcilie les migrations
pub fn sweep(
    db: &Database,
    ctx: &RequestContext,
    claim_timeout: Duration,
    now: OffsetDateTime,
) -> DispatchResult<SweepSummary> {
    db.transaction(|repo| {
        let expired = repo.sweep_timeouts(now - claim_timeout, now)?;
        for command in &expired {
            repo.append_audit(
                command.device_id,
                command.id,
                AuditAction::Timeout,
                &json!({
                    "command_type": command.kind.tag(),
                    "claimed_at": command.claimed_at.map(|t| t.unix_timestamp()),
                    "requested_by": ctx.operator,
                }),
                now,
            )?;
            warn!(
                device_id = command.device_id,
                command_id = command.id,
                request_id = %ctx.request_id,
                "command timed out"
            );
        }
        let migrations_finished = reconcile_migrations(repo, now)?;
        Ok(SweepSummary { timed_out: expired.len(), migrations_finished })
    })
}
