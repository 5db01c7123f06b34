use uuid::Uuid;

/// Identité et référence d'une requête admin, passées explicitement à chaque opération
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub operator: String,
    pub request_id: Uuid,
}

impl RequestContext {
    pub fn new(operator: impl Into<String>) -> Self {
        Self { operator: operator.into(), request_id: Uuid::new_v4() }
    }

    /// Contexte des tâches internes, utilisé par le sweeper pour signer ses entrées d'audit
    pub fn system() -> Self {
        Self::new("system")
    }
}
