/*!
Test Harness pour le kernel kiosque

Monte le routeur réel sur une base en mémoire et envoie les requêtes via
`tower::ServiceExt::oneshot`. Les réponses sont rendues en (StatusCode, JSON).
*/

use anyhow::Result;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use kiosk_kernel::config::KernelConfig;
use kiosk_kernel::http::{build_router, AppState};
use kiosk_kernel::models::{DeviceStatus, NewDevice};
use kiosk_kernel::store::{Database, DeviceStore};
use serde_json::Value;
use std::sync::Arc;
use time::OffsetDateTime;
use tower::ServiceExt;

pub const ADMIN_KEY: &str = "devkit-admin-key";

/// Harness de test : base en mémoire + routeur kernel complet
pub struct TestHarness {
    pub db: Arc<Database>,
    pub config: Arc<KernelConfig>,
    router: Router,
}

impl TestHarness {
    pub fn new() -> Result<Self> {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(mut config: KernelConfig) -> Result<Self> {
        tracing_subscriber::fmt().with_test_writer().try_init().ok();

        config.admin_api_key = ADMIN_KEY.to_string();
        let db = Arc::new(Database::open_in_memory()?);
        let config = Arc::new(config);
        let router = build_router(AppState { db: db.clone(), config: config.clone() });
        Ok(Self { db, config, router })
    }

    pub fn seed_tenant(&self, name: &str, token: Option<&str>) -> Result<i64> {
        Ok(self.db.with_repo(|repo| repo.insert_tenant(name, token, true))?)
    }

    /// Kiosque en ligne avec un heartbeat frais
    pub fn seed_device(&self, name: &str, tenant_id: Option<i64>) -> Result<i64> {
        let mut device = NewDevice::new(name, tenant_id);
        device.status = DeviceStatus::Online;
        device.last_heartbeat = Some(OffsetDateTime::now_utc());
        Ok(self.db.with_repo(|repo| repo.insert_device(&device))?)
    }

    pub fn seed_raw_device(&self, device: &NewDevice) -> Result<i64> {
        Ok(self.db.with_repo(|repo| repo.insert_device(device))?)
    }

    pub async fn admin_get(&self, path: &str) -> Result<(StatusCode, Value)> {
        let req = Request::get(path).header("x-api-key", ADMIN_KEY).body(Body::empty())?;
        self.send(req).await
    }

    pub async fn admin_post(&self, path: &str, body: Value) -> Result<(StatusCode, Value)> {
        let req = Request::post(path)
            .header("content-type", "application/json")
            .header("x-api-key", ADMIN_KEY)
            .header("x-operator", "devkit")
            .body(Body::from(serde_json::to_vec(&body)?))?;
        self.send(req).await
    }

    pub async fn device_post(&self, token: &str, path: &str, body: Value) -> Result<(StatusCode, Value)> {
        let req = Request::post(path)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(serde_json::to_vec(&body)?))?;
        self.send(req).await
    }

    pub async fn send(&self, req: Request<Body>) -> Result<(StatusCode, Value)> {
        let resp = self.router.clone().oneshot(req).await?;
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await?;
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        Ok((status, body))
    }
}
