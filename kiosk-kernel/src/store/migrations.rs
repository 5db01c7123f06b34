use super::{col_opt_ts, col_ts, parse_column, ts, Repo};
use crate::error::DispatchResult;
use crate::models::{CommandStatus, Migration, MigrationStatus, NewMigration};
use rusqlite::{params, OptionalExtension, Row};
use time::OffsetDateTime;

const MIGRATION_COLUMNS: &str = "m.id, m.device_id, m.source_tenant_id, m.target_tenant_id, \
     m.target_token, m.status, m.command_id, m.requested_by, m.note, m.created_at, m.updated_at, m.completed_at";

/// Une ligne de migration par kiosque (UNIQUE device_id)
pub trait MigrationStore {
    /// Insère ou écrase la migration du kiosque, remise à `queued`
    fn upsert_migration(&self, migration: &NewMigration<'_>, now: OffsetDateTime) -> DispatchResult<i64>;
    fn migration_for_device(&self, device_id: i64) -> DispatchResult<Option<Migration>>;
    fn list_migrations(&self, limit: u32) -> DispatchResult<Vec<Migration>>;
    /// queued → running quand le kiosque réclame la commande liée
    fn mark_migration_running(&self, command_id: i64, now: OffsetDateTime) -> DispatchResult<bool>;
    /// Migrations ouvertes dont la commande liée est terminale
    fn resolved_open_migrations(&self) -> DispatchResult<Vec<(Migration, CommandStatus)>>;
    /// Passe une migration ouverte en `completed` ou `failed`; false si déjà close
    fn finish_migration(&self, id: i64, status: MigrationStatus, now: OffsetDateTime) -> DispatchResult<bool>;
    /// Migration encore ouverte (queued/running) du kiosque vers cette institution
    fn has_migration_to(&self, device_id: i64, tenant_id: i64) -> DispatchResult<bool>;
}

fn migration_from_row(row: &Row<'_>) -> rusqlite::Result<Migration> {
    Ok(Migration {
        id: row.get(0)?,
        device_id: row.get(1)?,
        source_tenant_id: row.get(2)?,
        target_tenant_id: row.get(3)?,
        target_token: row.get(4)?,
        status: parse_column(row, 5, MigrationStatus::parse)?,
        command_id: row.get(6)?,
        requested_by: row.get(7)?,
        note: row.get(8)?,
        created_at: col_ts(row, 9)?,
        updated_at: col_ts(row, 10)?,
        completed_at: col_opt_ts(row, 11)?,
    })
}

impl MigrationStore for Repo<'_> {
    fn upsert_migration(&self, migration: &NewMigration<'_>, now: OffsetDateTime) -> DispatchResult<i64> {
        let id = self.conn.query_row(
            "INSERT INTO migrations (device_id, source_tenant_id, target_tenant_id, target_token, \
                 status, command_id, requested_by, note, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?6, ?7, ?8, ?8) \
             ON CONFLICT(device_id) DO UPDATE SET \
                 source_tenant_id = excluded.source_tenant_id, \
                 target_tenant_id = excluded.target_tenant_id, \
                 target_token = excluded.target_token, \
                 status = 'queued', \
                 command_id = excluded.command_id, \
                 requested_by = excluded.requested_by, \
                 note = excluded.note, \
                 updated_at = excluded.updated_at, \
                 completed_at = NULL \
             RETURNING id",
            params![
                migration.device_id,
                migration.source_tenant_id,
                migration.target_tenant_id,
                migration.target_token,
                migration.command_id,
                migration.requested_by,
                migration.note,
                ts(now),
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn migration_for_device(&self, device_id: i64) -> DispatchResult<Option<Migration>> {
        let sql = format!("SELECT {MIGRATION_COLUMNS} FROM migrations m WHERE m.device_id = ?1");
        Ok(self.conn.query_row(&sql, params![device_id], migration_from_row).optional()?)
    }

    fn list_migrations(&self, limit: u32) -> DispatchResult<Vec<Migration>> {
        let sql = format!(
            "SELECT {MIGRATION_COLUMNS} FROM migrations m ORDER BY m.updated_at DESC, m.id DESC LIMIT ?1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit], migration_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn mark_migration_running(&self, command_id: i64, now: OffsetDateTime) -> DispatchResult<bool> {
        let changed = self.conn.execute(
            "UPDATE migrations SET status = 'running', updated_at = ?2 \
             WHERE command_id = ?1 AND status = 'queued'",
            params![command_id, ts(now)],
        )?;
        Ok(changed > 0)
    }

    fn resolved_open_migrations(&self) -> DispatchResult<Vec<(Migration, CommandStatus)>> {
        let sql = format!(
            "SELECT {MIGRATION_COLUMNS}, c.status FROM migrations m \
             JOIN commands c ON c.id = m.command_id \
             WHERE m.status IN ('queued', 'running') \
               AND c.status IN ('executed', 'failed', 'timeout') \
             ORDER BY m.id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((migration_from_row(row)?, parse_column(row, 12, CommandStatus::parse)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn finish_migration(&self, id: i64, status: MigrationStatus, now: OffsetDateTime) -> DispatchResult<bool> {
        let completed_at = (status == MigrationStatus::Completed).then(|| ts(now));
        let changed = self.conn.execute(
            "UPDATE migrations SET status = ?2, updated_at = ?3, completed_at = ?4 \
             WHERE id = ?1 AND status IN ('queued', 'running')",
            params![id, status.as_str(), ts(now), completed_at],
        )?;
        Ok(changed > 0)
    }

    fn has_migration_to(&self, device_id: i64, tenant_id: i64) -> DispatchResult<bool> {
        Ok(self
            .conn
            .query_row(
                "SELECT 1 FROM migrations WHERE device_id = ?1 AND target_tenant_id = ?2 \
                 AND status IN ('queued', 'running')",
                params![device_id, tenant_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }
}
