/**
 * ORCHESTRATEUR DE MIGRATION - Déplacement en masse de kiosques entre institutions
 *
 * RÔLE :
 * Pour chaque kiosque éligible : enqueue un token swap + reboot portant le token
 * de l'institution cible, upsert la ligne de migration, journaliser.
 *
 * FONCTIONNEMENT :
 * - Préconditions vérifiées avant toute écriture (institution active avec token)
 * - Boucle entière dans une seule transaction
 * - Kiosque inconnu ou déjà dans la cible : compté en `skipped`, la boucle continue
 * - Un token swap encore pending d'une migration précédente est annulé (`failed`)
 *   avant l'enqueue du nouveau : le kiosque ne reçoit que le token de la cible courante
 * - Toute autre erreur annule le lot complet
 * - La migration suit ensuite la commande liée (running, completed, failed)
 *   via `reconcile_migrations`, appelée au report et par le sweeper
 */

use crate::context::RequestContext;
use crate::error::{DispatchError, DispatchResult};
use crate::models::{
    AuditAction, CommandKind, CommandStatus, MigrationStatus, NewMigration, Tenant, TokenSwapPayload,
};
use crate::store::{AuditSink, CommandStore, Database, DeviceStore, MigrationStore};
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub const SUPERSEDED_ERROR: &str = "superseded by a newer migration";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub queued_count: usize,
    pub skipped_count: usize,
}

/// Dédoublonne en gardant l'ordre, écarte les ids non positifs
fn normalize_ids(device_ids: &[i64]) -> Vec<i64> {
    let mut seen = HashSet::new();
    device_ids
        .iter()
        .copied()
        .filter(|id| *id > 0 && seen.insert(*id))
        .collect()
}

fn check_target<R: DeviceStore>(repo: &R, target_tenant_id: i64) -> DispatchResult<(Tenant, String)> {
    let tenant = repo.tenant(target_tenant_id)?.ok_or_else(|| {
        DispatchError::PreconditionFailed(format!("target tenant {target_tenant_id} does not exist"))
    })?;
    let token = tenant
        .active_token()
        .ok_or_else(|| {
            DispatchError::PreconditionFailed(format!(
                "target tenant {target_tenant_id} has no active API token"
            ))
        })?
        .to_string();
    Ok((tenant, token))
}

pub fn queue_bulk_migration(
    db: &Database,
    ctx: &RequestContext,
    target_tenant_id: i64,
    device_ids: &[i64],
    now: OffsetDateTime,
) -> DispatchResult<MigrationReport> {
    if device_ids.is_empty() {
        return Err(DispatchError::InvalidRequest("select at least one kiosk".into()));
    }
    let ids = normalize_ids(device_ids);

    let (tenant, token) = db.with_repo(|repo| check_target(repo, target_tenant_id))?;

    let report = db.transaction(|repo| migrate_batch(repo, ctx, &tenant, &token, &ids, now))?;

    info!(
        target_tenant_id,
        queued = report.queued_count,
        skipped = report.skipped_count,
        kiosk_ids = ?ids,
        operator = %ctx.operator,
        request_id = %ctx.request_id,
        "security: bulk migration queued"
    );
    Ok(report)
}

fn migrate_batch<R>(
    repo: &R,
    ctx: &RequestContext,
    tenant: &Tenant,
    token: &str,
    ids: &[i64],
    now: OffsetDateTime,
) -> DispatchResult<MigrationReport>
where
    R: DeviceStore + CommandStore + MigrationStore + AuditSink,
{
    let mut report = MigrationReport { queued_count: 0, skipped_count: 0 };
    let kind = CommandKind::TokenSwapReboot(TokenSwapPayload { token: token.to_string() });

    for &device_id in ids {
        let Some(device) = repo.device(device_id)? else {
            debug!(device_id, "migration skipped: unknown kiosk");
            report.skipped_count += 1;
            continue;
        };
        if device.tenant_id == Some(tenant.id) {
            debug!(device_id, tenant_id = tenant.id, "migration skipped: already in target tenant");
            report.skipped_count += 1;
            continue;
        }

        let superseded = repo.supersede_pending(device_id, kind.tag(), SUPERSEDED_ERROR, now)?;
        let command_id = repo.enqueue(device_id, &kind, now)?;
        for old in superseded {
            debug!(device_id, command_id = old, replaced_by = command_id, "pending token swap superseded");
            repo.append_audit(
                device_id,
                old,
                AuditAction::Superseded,
                &json!({ "replaced_by": command_id, "requested_by": ctx.operator }),
                now,
            )?;
        }
        repo.upsert_migration(
            &NewMigration {
                device_id,
                source_tenant_id: device.tenant_id,
                target_tenant_id: tenant.id,
                target_token: token,
                command_id,
                requested_by: &ctx.operator,
                note: format!("Bulk migration to tenant #{}", tenant.id),
            },
            now,
        )?;
        repo.append_audit(
            device_id,
            command_id,
            AuditAction::MigrationQueued,
            &json!({
                "target_tenant_id": tenant.id,
                "target_tenant_name": tenant.name,
                "requested_by": ctx.operator,
                "command_id": command_id,
                "action": "token_swap_and_reboot",
            }),
            now,
        )?;
        report.queued_count += 1;
    }

    Ok(report)
}

/// Fait suivre aux migrations ouvertes l'issue de leur commande liée.
/// executed → completed (le kiosque passe à l'institution cible), failed/timeout → failed.
pub fn reconcile_migrations<R>(repo: &R, now: OffsetDateTime) -> DispatchResult<usize>
where
    R: DeviceStore + MigrationStore,
{
    let mut finished = 0;
    for (migration, command_status) in repo.resolved_open_migrations()? {
        let target = match command_status {
            CommandStatus::Executed => MigrationStatus::Completed,
            CommandStatus::Failed | CommandStatus::Timeout => MigrationStatus::Failed,
            CommandStatus::Pending | CommandStatus::Sent => continue,
        };
        if !repo.finish_migration(migration.id, target, now)? {
            continue;
        }
        if target == MigrationStatus::Completed {
            repo.assign_tenant(migration.device_id, migration.target_tenant_id)?;
            info!(
                device_id = migration.device_id,
                tenant_id = migration.target_tenant_id,
                "migration completed"
            );
        } else {
            warn!(
                device_id = migration.device_id,
                command_status = %command_status,
                "migration failed"
            );
        }
        finished += 1;
    }
    Ok(finished)
}
