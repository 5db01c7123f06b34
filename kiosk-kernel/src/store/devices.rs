use super::{col_opt_ts, parse_column, ts, Repo};
use crate::error::{DispatchError, DispatchResult};
use crate::models::{Device, DeviceStatus, NewDevice, Tenant};
use rusqlite::{params, OptionalExtension, Row};
use time::OffsetDateTime;

const DEVICE_COLUMNS: &str = "id, name, tenant_id, status, last_heartbeat, last_seen, \
     upgrade_started_at, debug_mode, fast_loop_enabled, poll_interval_secs, license_active";

/// Kiosques et institutions (colonnes statut/heartbeat comprises)
pub trait DeviceStore {
    fn tenant(&self, id: i64) -> DispatchResult<Option<Tenant>>;
    fn tenant_by_token(&self, token: &str) -> DispatchResult<Option<Tenant>>;
    fn insert_tenant(&self, name: &str, api_token: Option<&str>, is_active: bool) -> DispatchResult<i64>;
    fn device(&self, id: i64) -> DispatchResult<Option<Device>>;
    fn list_devices(&self) -> DispatchResult<Vec<Device>>;
    fn insert_device(&self, device: &NewDevice) -> DispatchResult<i64>;
    /// Check-in périodique : heartbeat, statut brut rapporté, fin d'upgrade
    fn record_heartbeat(&self, id: i64, status: DeviceStatus, now: OffsetDateTime) -> DispatchResult<()>;
    /// État désiré fast loop, écrit en une seule mise à jour
    fn set_fast_loop(&self, id: i64, enable: bool, interval_secs: u32) -> DispatchResult<()>;
    fn set_debug_mode(&self, id: i64, enable: bool) -> DispatchResult<()>;
    fn assign_tenant(&self, id: i64, tenant_id: i64) -> DispatchResult<()>;
}

fn tenant_from_row(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        api_token: row.get(2)?,
        is_active: row.get(3)?,
    })
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        id: row.get(0)?,
        name: row.get(1)?,
        tenant_id: row.get(2)?,
        status: parse_column(row, 3, DeviceStatus::parse)?,
        last_heartbeat: col_opt_ts(row, 4)?,
        last_seen: col_opt_ts(row, 5)?,
        upgrade_started_at: col_opt_ts(row, 6)?,
        debug_mode: row.get(7)?,
        fast_loop_enabled: row.get(8)?,
        poll_interval_secs: row.get(9)?,
        license_active: row.get(10)?,
    })
}

fn expect_one(changed: usize, id: i64) -> DispatchResult<()> {
    if changed == 0 {
        return Err(DispatchError::not_found("device", id));
    }
    Ok(())
}

impl DeviceStore for Repo<'_> {
    fn tenant(&self, id: i64) -> DispatchResult<Option<Tenant>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, api_token, is_active FROM tenants WHERE id = ?1",
                params![id],
                tenant_from_row,
            )
            .optional()?)
    }

    fn tenant_by_token(&self, token: &str) -> DispatchResult<Option<Tenant>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, api_token, is_active FROM tenants WHERE api_token = ?1",
                params![token.trim()],
                tenant_from_row,
            )
            .optional()?)
    }

    fn insert_tenant(&self, name: &str, api_token: Option<&str>, is_active: bool) -> DispatchResult<i64> {
        // stocké tel qu'envoyé aux kiosques et comparé à l'authentification
        let api_token = api_token.map(str::trim).filter(|t| !t.is_empty());
        self.conn.execute(
            "INSERT INTO tenants (name, api_token, is_active) VALUES (?1, ?2, ?3)",
            params![name, api_token, is_active],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn device(&self, id: i64) -> DispatchResult<Option<Device>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1");
        Ok(self.conn.query_row(&sql, params![id], device_from_row).optional()?)
    }

    fn list_devices(&self) -> DispatchResult<Vec<Device>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], device_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn insert_device(&self, device: &NewDevice) -> DispatchResult<i64> {
        let heartbeat = device.last_heartbeat.map(ts);
        self.conn.execute(
            "INSERT INTO devices (name, tenant_id, status, last_heartbeat, last_seen, \
             upgrade_started_at, poll_interval_secs) VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6)",
            params![
                device.name,
                device.tenant_id,
                device.status.as_str(),
                heartbeat,
                device.upgrade_started_at.map(ts),
                device.poll_interval_secs,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn record_heartbeat(&self, id: i64, status: DeviceStatus, now: OffsetDateTime) -> DispatchResult<()> {
        let changed = self.conn.execute(
            "UPDATE devices SET status = ?2, last_heartbeat = ?3, last_seen = ?3, \
             upgrade_started_at = CASE \
                 WHEN ?2 = 'online' THEN NULL \
                 WHEN ?2 = 'upgrading' THEN COALESCE(upgrade_started_at, ?3) \
                 ELSE upgrade_started_at END \
             WHERE id = ?1",
            params![id, status.as_str(), ts(now)],
        )?;
        expect_one(changed, id)
    }

    fn set_fast_loop(&self, id: i64, enable: bool, interval_secs: u32) -> DispatchResult<()> {
        let changed = self.conn.execute(
            "UPDATE devices SET fast_loop_enabled = ?2, poll_interval_secs = ?3 WHERE id = ?1",
            params![id, enable, interval_secs],
        )?;
        expect_one(changed, id)
    }

    fn set_debug_mode(&self, id: i64, enable: bool) -> DispatchResult<()> {
        let changed = self.conn.execute(
            "UPDATE devices SET debug_mode = ?2 WHERE id = ?1",
            params![id, enable],
        )?;
        expect_one(changed, id)
    }

    fn assign_tenant(&self, id: i64, tenant_id: i64) -> DispatchResult<()> {
        let changed = self.conn.execute(
            "UPDATE devices SET tenant_id = ?2 WHERE id = ?1",
            params![id, tenant_id],
        )?;
        expect_one(changed, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use time::macros::datetime;

    #[test]
    fn test_heartbeat_clears_upgrade_marker() {
        let db = Database::open_in_memory().unwrap();
        let now = datetime!(2025-03-01 12:00 UTC);
        let mut new = NewDevice::new("lobby", None);
        new.status = DeviceStatus::Upgrading;
        new.upgrade_started_at = Some(now);
        let id = db.with_repo(|repo| repo.insert_device(&new)).unwrap();

        db.with_repo(|repo| repo.record_heartbeat(id, DeviceStatus::Online, now)).unwrap();
        let device = db.with_repo(|repo| repo.device(id)).unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.upgrade_started_at, None);
        assert_eq!(device.last_heartbeat, Some(now));
    }

    #[test]
    fn test_heartbeat_unknown_device() {
        let db = Database::open_in_memory().unwrap();
        let err = db
            .with_repo(|repo| repo.record_heartbeat(99, DeviceStatus::Online, OffsetDateTime::now_utc()))
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound { .. }));
    }

    #[test]
    fn test_tenant_lookup_by_token() {
        let db = Database::open_in_memory().unwrap();
        let id = db.with_repo(|repo| repo.insert_tenant("School", Some("tok-1"), true)).unwrap();
        let tenant = db.with_repo(|repo| repo.tenant_by_token("tok-1")).unwrap().unwrap();
        assert_eq!(tenant.id, id);
        assert!(db.with_repo(|repo| repo.tenant_by_token("nope")).unwrap().is_none());
    }

    #[test]
    fn test_stored_token_matches_what_kiosks_receive() {
        let db = Database::open_in_memory().unwrap();
        let id = db.with_repo(|repo| repo.insert_tenant("School", Some("  tok-2\n"), true)).unwrap();
        let tenant = db.with_repo(|repo| repo.tenant(id)).unwrap().unwrap();
        assert_eq!(tenant.api_token.as_deref(), Some("tok-2"));

        let sent = tenant.active_token().unwrap();
        let found = db.with_repo(|repo| repo.tenant_by_token(sent)).unwrap().unwrap();
        assert_eq!(found.id, id);

        let blank = db.with_repo(|repo| repo.insert_tenant("Blank", Some("   "), true)).unwrap();
        assert_eq!(db.with_repo(|repo| repo.tenant(blank)).unwrap().unwrap().api_token, None);
    }
}
