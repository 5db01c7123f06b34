/**
 * STORE SQLITE - Persistance relationnelle du dispatch
 *
 * RÔLE :
 * Une connexion SQLite unique protégée par un mutex. Chaque composant reçoit
 * un `Repo` (vue sur la connexion ou sur une transaction) et n'en voit que
 * les traits dont il a besoin : DeviceStore, CommandStore, MigrationStore, AuditSink.
 *
 * FONCTIONNEMENT :
 * - `with_repo` : opérations autonomes (claim, lectures)
 * - `transaction` : commit si Ok, rollback au drop sinon
 * - Horodatages stockés en secondes unix UTC
 */

mod audit;
mod commands;
mod devices;
mod migrations;
pub mod schema;

pub use audit::AuditSink;
pub use commands::{CommandStore, Reported};
pub use devices::DeviceStore;
pub use migrations::MigrationStore;

use crate::error::DispatchResult;
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use std::path::Path;
use time::OffsetDateTime;
use tracing::info;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> DispatchResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let db = Self::init(conn)?;
        info!(path = %path.display(), "database opened");
        Ok(db)
    }

    pub fn open_in_memory() -> DispatchResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> DispatchResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(schema::SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Exécute `f` sur la connexion, hors transaction explicite
    pub fn with_repo<T>(&self, f: impl FnOnce(&Repo<'_>) -> DispatchResult<T>) -> DispatchResult<T> {
        let conn = self.conn.lock();
        f(&Repo { conn: &conn })
    }

    /// Exécute `f` dans une transaction. Toute erreur annule l'ensemble des écritures.
    pub fn transaction<T>(&self, f: impl FnOnce(&Repo<'_>) -> DispatchResult<T>) -> DispatchResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&Repo { conn: &tx })?;
        tx.commit()?;
        Ok(out)
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> DispatchResult<()> {
        Ok(self.conn.lock().execute_batch(sql)?)
    }
}

/// Vue sur une connexion (ou une transaction) implémentant les traits de store
pub struct Repo<'c> {
    conn: &'c Connection,
}

#[derive(Debug, thiserror::Error)]
#[error("unexpected column value '{0}'")]
struct UnknownValue(String);

pub(crate) fn ts(at: OffsetDateTime) -> i64 {
    at.unix_timestamp()
}

fn from_ts(idx: usize, secs: i64) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn col_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    from_ts(idx, row.get(idx)?)
}

fn col_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<OffsetDateTime>> {
    row.get::<_, Option<i64>>(idx)?.map(|secs| from_ts(idx, secs)).transpose()
}

/// Colonne texte vers enum fermé (statuts, actions)
fn parse_column<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(UnknownValue(raw)))
    })
}
