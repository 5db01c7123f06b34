/**
 * ERREURS DISPATCH - Taxonomie unique des échecs du sous-système
 *
 * RÔLE : Chaque opération (store, producteurs, orchestrateur, HTTP) renvoie
 * `DispatchError`. Les conditions métier attendues (NotFound, AlreadyResolved...)
 * restent distinctes des pannes techniques (Unexpected).
 */

use crate::models::CommandStatus;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("command {command_id} already resolved as {status}")]
    AlreadyResolved { command_id: i64, status: CommandStatus },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl DispatchError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }

    /// DB/worker failures: batch-fatal, surfaced generically.
    pub fn is_unexpected(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Serialization(_) | Self::Worker(_))
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_classification() {
        assert!(DispatchError::Database(rusqlite::Error::QueryReturnedNoRows).is_unexpected());
        assert!(!DispatchError::not_found("device", 3).is_unexpected());
        assert!(!DispatchError::PreconditionFailed("no token".into()).is_unexpected());
    }

    #[tokio::test]
    async fn test_worker_failure_is_unexpected() {
        let join = tokio::task::spawn_blocking(|| panic!("store worker")).await.unwrap_err();
        assert!(DispatchError::from(join).is_unexpected());
    }

    #[test]
    fn test_messages() {
        assert_eq!(DispatchError::not_found("command", 42).to_string(), "command 42 not found");
        let err = DispatchError::AlreadyResolved { command_id: 7, status: CommandStatus::Executed };
        assert_eq!(err.to_string(), "command 7 already resolved as executed");
    }
}
