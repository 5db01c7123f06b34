use super::{col_ts, parse_column, ts, Repo};
use crate::error::DispatchResult;
use crate::models::{AuditAction, AuditLogEntry};
use rusqlite::{params, Row};
use serde_json::Value;
use time::OffsetDateTime;

/// Journal append-only des décisions de dispatch (triggers SQL anti-update/delete)
pub trait AuditSink {
    fn append_audit(
        &self,
        device_id: i64,
        command_id: i64,
        action: AuditAction,
        details: &Value,
        now: OffsetDateTime,
    ) -> DispatchResult<i64>;
    fn audit_for_device(&self, device_id: i64, limit: u32) -> DispatchResult<Vec<AuditLogEntry>>;
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<AuditLogEntry> {
    let details: String = row.get(4)?;
    Ok(AuditLogEntry {
        id: row.get(0)?,
        device_id: row.get(1)?,
        command_id: row.get(2)?,
        action: parse_column(row, 3, AuditAction::parse)?,
        details: serde_json::from_str(&details).unwrap_or(Value::String(details)),
        created_at: col_ts(row, 5)?,
    })
}

impl AuditSink for Repo<'_> {
    fn append_audit(
        &self,
        device_id: i64,
        command_id: i64,
        action: AuditAction,
        details: &Value,
        now: OffsetDateTime,
    ) -> DispatchResult<i64> {
        self.conn.execute(
            "INSERT INTO command_audit_log (device_id, command_id, action, details, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![device_id, command_id, action.as_str(), serde_json::to_string(details)?, ts(now)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn audit_for_device(&self, device_id: i64, limit: u32) -> DispatchResult<Vec<AuditLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, device_id, command_id, action, details, created_at FROM command_audit_log \
             WHERE device_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![device_id, limit], entry_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
