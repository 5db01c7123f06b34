/**
 * FILE DE COMMANDES - Cycle de vie pending → sent → executed | failed | timeout
 *
 * RÔLE :
 * File durable par kiosque. Le claim est une mise à jour conditionnelle
 * (`WHERE status = 'pending'`) dont on vérifie le nombre de lignes modifiées :
 * deux polls concurrents ne peuvent jamais obtenir la même commande.
 *
 * Aucun état terminal n'est jamais quitté.
 */

use super::{col_opt_ts, col_ts, parse_column, ts, Repo};
use crate::error::{DispatchError, DispatchResult};
use crate::models::{Command, CommandKind, CommandStatus, ReportOutcome};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use time::OffsetDateTime;
use tracing::debug;

const COMMAND_COLUMNS: &str =
    "id, device_id, command_type, payload, status, created_at, claimed_at, executed_at, output, error";

const CLAIM_ATTEMPTS: usize = 3;

pub const TIMEOUT_ERROR: &str = "no result reported before timeout";

const TOKEN_SWAP_TAG: &str = "token_swap_reboot";

/// Issue d'un report : `duplicate` si le même résultat était déjà enregistré
#[derive(Debug, Clone)]
pub struct Reported {
    pub command: Command,
    pub duplicate: bool,
}

pub trait CommandStore {
    fn enqueue(&self, device_id: i64, kind: &CommandKind, now: OffsetDateTime) -> DispatchResult<i64>;
    fn command(&self, id: i64) -> DispatchResult<Option<Command>>;
    /// Transition atomique pending → sent. `Conflict` si la commande n'est plus pending.
    fn claim(&self, command_id: i64, now: OffsetDateTime) -> DispatchResult<Command>;
    /// Plus ancienne commande pending du kiosque, réclamée atomiquement
    fn claim_next(&self, device_id: i64, now: OffsetDateTime) -> DispatchResult<Option<Command>>;
    fn report_result(
        &self,
        command_id: i64,
        outcome: ReportOutcome,
        output: Option<&str>,
        error: Option<&str>,
        now: OffsetDateTime,
    ) -> DispatchResult<Reported>;
    /// sent depuis avant `older_than` → timeout. Renvoie les commandes expirées.
    fn sweep_timeouts(&self, older_than: OffsetDateTime, now: OffsetDateTime) -> DispatchResult<Vec<Command>>;
    fn commands_for_device(&self, device_id: i64, limit: u32) -> DispatchResult<Vec<Command>>;
    /// Passe en `failed` les commandes pending d'un type, remplacées par une plus récente.
    /// Les commandes `sent` ne sont jamais touchées.
    fn supersede_pending(
        &self,
        device_id: i64,
        kind_tag: &str,
        reason: &str,
        now: OffsetDateTime,
    ) -> DispatchResult<Vec<i64>>;
    /// Le kiosque a réclamé un token swap portant le token de cette institution
    /// (sans l'avoir rapporté en échec)
    fn received_token_of(&self, device_id: i64, tenant_id: i64) -> DispatchResult<bool>;
}

fn command_from_row(row: &Row<'_>) -> rusqlite::Result<Command> {
    let tag: String = row.get(2)?;
    let payload: String = row.get(3)?;
    let kind = CommandKind::from_parts(&tag, &payload)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    Ok(Command {
        id: row.get(0)?,
        device_id: row.get(1)?,
        kind,
        status: parse_column(row, 4, CommandStatus::parse)?,
        created_at: col_ts(row, 5)?,
        claimed_at: col_opt_ts(row, 6)?,
        executed_at: col_opt_ts(row, 7)?,
        output: row.get(8)?,
        error: row.get(9)?,
    })
}

impl Repo<'_> {
    fn device_exists(&self, device_id: i64) -> DispatchResult<bool> {
        Ok(self
            .conn
            .query_row("SELECT 1 FROM devices WHERE id = ?1", params![device_id], |_| Ok(()))
            .optional()?
            .is_some())
    }

    fn require_command(&self, id: i64) -> DispatchResult<Command> {
        self.command(id)?.ok_or_else(|| DispatchError::not_found("command", id))
    }
}

impl CommandStore for Repo<'_> {
    fn enqueue(&self, device_id: i64, kind: &CommandKind, now: OffsetDateTime) -> DispatchResult<i64> {
        if !self.device_exists(device_id)? {
            return Err(DispatchError::not_found("device", device_id));
        }
        self.conn.execute(
            "INSERT INTO commands (device_id, command_type, payload, status, created_at) \
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![device_id, kind.tag(), kind.payload_json()?, ts(now)],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!(device_id, command_id = id, kind = kind.tag(), "command enqueued");
        Ok(id)
    }

    fn command(&self, id: i64) -> DispatchResult<Option<Command>> {
        let sql = format!("SELECT {COMMAND_COLUMNS} FROM commands WHERE id = ?1");
        Ok(self.conn.query_row(&sql, params![id], command_from_row).optional()?)
    }

    fn claim(&self, command_id: i64, now: OffsetDateTime) -> DispatchResult<Command> {
        let changed = self.conn.execute(
            "UPDATE commands SET status = 'sent', claimed_at = ?2 WHERE id = ?1 AND status = 'pending'",
            params![command_id, ts(now)],
        )?;
        let command = self.require_command(command_id)?;
        if changed != 1 {
            return Err(DispatchError::Conflict(format!(
                "command {command_id} is {} and cannot be claimed",
                command.status
            )));
        }
        Ok(command)
    }

    fn claim_next(&self, device_id: i64, now: OffsetDateTime) -> DispatchResult<Option<Command>> {
        if !self.device_exists(device_id)? {
            return Err(DispatchError::not_found("device", device_id));
        }

        for _ in 0..CLAIM_ATTEMPTS {
            let next: Option<i64> = self
                .conn
                .query_row(
                    "SELECT id FROM commands WHERE device_id = ?1 AND status = 'pending' \
                     ORDER BY created_at, id LIMIT 1",
                    params![device_id],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(id) = next else { return Ok(None) };
            match self.claim(id, now) {
                Ok(command) => return Ok(Some(command)),
                Err(DispatchError::Conflict(reason)) => {
                    debug!(device_id, command_id = id, %reason, "claim race lost, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(DispatchError::Conflict(format!("claim for device {device_id} kept losing races")))
    }

    fn report_result(
        &self,
        command_id: i64,
        outcome: ReportOutcome,
        output: Option<&str>,
        error: Option<&str>,
        now: OffsetDateTime,
    ) -> DispatchResult<Reported> {
        let target = outcome.status();
        let changed = self.conn.execute(
            "UPDATE commands SET status = ?2, executed_at = ?3, output = ?4, error = ?5 \
             WHERE id = ?1 AND status = 'sent'",
            params![command_id, target.as_str(), ts(now), output, error],
        )?;

        let command = self.require_command(command_id)?;
        if changed == 1 {
            return Ok(Reported { command, duplicate: false });
        }

        match command.status {
            status if status == target => Ok(Reported { command, duplicate: true }),
            status if status.is_terminal() => Err(DispatchError::AlreadyResolved { command_id, status }),
            status => Err(DispatchError::Conflict(format!(
                "command {command_id} is {status} and has not been claimed"
            ))),
        }
    }

    fn sweep_timeouts(&self, older_than: OffsetDateTime, now: OffsetDateTime) -> DispatchResult<Vec<Command>> {
        let sql = format!(
            "UPDATE commands SET status = 'timeout', executed_at = ?2, error = ?3 \
             WHERE status = 'sent' AND claimed_at < ?1 RETURNING {COMMAND_COLUMNS}"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![ts(older_than), ts(now), TIMEOUT_ERROR], command_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn commands_for_device(&self, device_id: i64, limit: u32) -> DispatchResult<Vec<Command>> {
        let sql = format!(
            "SELECT {COMMAND_COLUMNS} FROM commands WHERE device_id = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![device_id, limit], command_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn supersede_pending(
        &self,
        device_id: i64,
        kind_tag: &str,
        reason: &str,
        now: OffsetDateTime,
    ) -> DispatchResult<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "UPDATE commands SET status = 'failed', executed_at = ?3, error = ?4 \
             WHERE device_id = ?1 AND command_type = ?2 AND status = 'pending' RETURNING id",
        )?;
        let rows = stmt.query_map(params![device_id, kind_tag, ts(now), reason], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn received_token_of(&self, device_id: i64, tenant_id: i64) -> DispatchResult<bool> {
        Ok(self
            .conn
            .query_row(
                "SELECT 1 FROM commands c JOIN tenants t ON t.id = ?2 \
                 WHERE c.device_id = ?1 AND c.command_type = ?3 \
                   AND c.status IN ('sent', 'executed', 'timeout') \
                   AND t.api_token IS NOT NULL \
                   AND json_extract(c.payload, '$.token') = t.api_token \
                 LIMIT 1",
                params![device_id, tenant_id, TOKEN_SWAP_TAG],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }
}
