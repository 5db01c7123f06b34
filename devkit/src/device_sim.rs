/*!
Kiosque simulé

Joue la boucle de poll d'un kiosque contre le harness : heartbeat, claim,
exécution factice, report. Enregistre chaque échange pour assertions.
*/

use crate::fixtures::TestHarness;
use anyhow::{bail, Result};
use axum::http::StatusCode;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

/// Un aller-retour avec le kernel
#[derive(Debug, Clone)]
pub struct Exchange {
    pub endpoint: &'static str,
    pub status: StatusCode,
    pub body: Value,
}

#[derive(Clone)]
pub struct SimulatedKiosk {
    pub device_id: i64,
    token: Arc<Mutex<String>>,
    exchanges: Arc<Mutex<Vec<Exchange>>>,
}

impl SimulatedKiosk {
    pub fn new(device_id: i64, token: &str) -> Self {
        Self {
            device_id,
            token: Arc::new(Mutex::new(token.to_string())),
            exchanges: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn token(&self) -> String {
        self.token.lock().clone()
    }

    async fn post(&self, harness: &TestHarness, endpoint: &'static str, body: Value) -> Result<Exchange> {
        let (status, body) = harness.device_post(&self.token(), endpoint, body).await?;
        let exchange = Exchange { endpoint, status, body };
        self.exchanges.lock().push(exchange.clone());
        Ok(exchange)
    }

    pub async fn heartbeat(&self, harness: &TestHarness) -> Result<Exchange> {
        self.post(harness, "/heartbeat", json!({ "device_id": self.device_id, "status": "online" }))
            .await
    }

    /// Claim seul ; renvoie la commande JSON si une était en attente
    pub async fn claim(&self, harness: &TestHarness) -> Result<Option<Value>> {
        let exchange = self.post(harness, "/claim", json!({ "device_id": self.device_id })).await?;
        if exchange.status != StatusCode::OK {
            bail!("claim rejected with {}: {}", exchange.status, exchange.body);
        }
        Ok(exchange.body.get("command").filter(|c| !c.is_null()).cloned())
    }

    pub async fn report(
        &self,
        harness: &TestHarness,
        command_id: i64,
        status: &str,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<Exchange> {
        self.post(
            harness,
            "/report",
            json!({ "command_id": command_id, "status": status, "output": output, "error": error }),
        )
        .await
    }

    /// Un cycle complet : claim puis report `executed`. Un token swap réussi
    /// remplace le token du kiosque, comme le ferait l'agent après reboot.
    pub async fn poll_once(&self, harness: &TestHarness) -> Result<Option<Value>> {
        let Some(command) = self.claim(harness).await? else {
            return Ok(None);
        };
        let Some(id) = command["id"].as_i64() else {
            bail!("claimed command without id: {command}");
        };

        self.report(harness, id, "executed", Some("ok"), None).await?;

        if command["type"] == "token_swap_reboot" {
            if let Some(token) = command["payload"]["token"].as_str() {
                *self.token.lock() = token.to_string();
            }
        }
        Ok(Some(command))
    }

    pub fn exchanges(&self) -> Vec<Exchange> {
        self.exchanges.lock().clone()
    }

    pub fn claimed_ids(&self) -> Vec<i64> {
        self.exchanges
            .lock()
            .iter()
            .filter(|e| e.endpoint == "/claim")
            .filter_map(|e| e.body["command"]["id"].as_i64())
            .collect()
    }
}
