//! Schéma SQLite du sous-système de dispatch.
//!
//! Créé de façon idempotente à l'ouverture. Les horodatages sont des secondes
//! unix UTC.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    api_token   TEXT,
    is_active   INTEGER NOT NULL DEFAULT 1
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_tenants_token ON tenants(api_token);

CREATE TABLE IF NOT EXISTS devices (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    name                TEXT NOT NULL,
    tenant_id           INTEGER REFERENCES tenants(id),
    status              TEXT NOT NULL DEFAULT 'unconfigured',
    last_heartbeat      INTEGER,
    last_seen           INTEGER,
    upgrade_started_at  INTEGER,
    debug_mode          INTEGER NOT NULL DEFAULT 0,
    fast_loop_enabled   INTEGER NOT NULL DEFAULT 0,
    poll_interval_secs  INTEGER NOT NULL DEFAULT 300,
    license_active      INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS commands (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id     INTEGER NOT NULL REFERENCES devices(id),
    command_type  TEXT NOT NULL,
    payload       TEXT NOT NULL,
    status        TEXT NOT NULL DEFAULT 'pending',
    created_at    INTEGER NOT NULL,
    claimed_at    INTEGER,
    executed_at   INTEGER,
    output        TEXT,
    error         TEXT
);

CREATE INDEX IF NOT EXISTS idx_commands_device_status
    ON commands(device_id, status, created_at);

CREATE TABLE IF NOT EXISTS migrations (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id         INTEGER NOT NULL UNIQUE REFERENCES devices(id),
    source_tenant_id  INTEGER,
    target_tenant_id  INTEGER NOT NULL REFERENCES tenants(id),
    target_token      TEXT NOT NULL,
    status            TEXT NOT NULL DEFAULT 'queued',
    command_id        INTEGER REFERENCES commands(id),
    requested_by      TEXT,
    note              TEXT,
    created_at        INTEGER NOT NULL,
    updated_at        INTEGER NOT NULL,
    completed_at      INTEGER
);

CREATE TABLE IF NOT EXISTS command_audit_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id   INTEGER NOT NULL,
    command_id  INTEGER NOT NULL,
    action      TEXT NOT NULL,
    details     TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_device ON command_audit_log(device_id, id);

CREATE TRIGGER IF NOT EXISTS audit_no_update
BEFORE UPDATE ON command_audit_log
BEGIN
    SELECT RAISE(ABORT, 'command_audit_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_no_delete
BEFORE DELETE ON command_audit_log
BEGIN
    SELECT RAISE(ABORT, 'command_audit_log is append-only');
END;
"#;
