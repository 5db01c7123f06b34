/**
 * API REST KIOSK - Surfaces HTTP device (poll) et admin
 *
 * RÔLE :
 * Expose la file de commandes aux kiosques (heartbeat, claim, report) et les
 * opérations admin (migrations en masse, commandes de contrôle, vues).
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, réponses JSON `{"success": bool, "message": str, ...}`
 * - /health toujours accessible
 * - Surface device : `Authorization: Bearer <token institution>` → `DeviceAuth`
 * - Surface admin : header x-api-key obligatoire, `x-operator` optionnel → `RequestContext`
 * - Conditions métier attendues en 4xx, pannes techniques en 500 avec référence
 * - Les appels au store (SQLite synchrone sous mutex) passent par `spawn_blocking`
 *
 * SÉCURITÉ :
 * - Clé admin vide = API admin fermée
 * - Les tentatives refusées sont journalisées
 */

use crate::config::KernelConfig;
use crate::context::RequestContext;
use crate::controls;
use crate::dispatch::{self, ReportAck};
use crate::error::{DispatchError, DispatchResult};
use crate::migration::queue_bulk_migration;
use crate::models::{Device, DeviceStatus, ReportOutcome};
use crate::status::{effective_status, StatusPolicy};
use crate::store::{AuditSink, CommandStore, Database, DeviceStore, MigrationStore};
use axum::extract::{FromRequest, FromRequestParts, Path, Request, State};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, error, warn};
use uuid::Uuid;

const COMMAND_HISTORY_LIMIT: u32 = 50;
const AUDIT_HISTORY_LIMIT: u32 = 100;
const MIGRATION_LIST_LIMIT: u32 = 200;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub config: Arc<KernelConfig>,
}

impl AppState {
    /// Exécute une opération store hors des workers tokio
    async fn blocking<T, F>(&self, op: F) -> DispatchResult<T>
    where
        F: FnOnce(&Database) -> DispatchResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db)).await?
    }
}

// --- erreurs -------------------------------------------------------------

/// Erreur HTTP : l'erreur métier et la référence de la requête
#[derive(Debug)]
pub struct ApiError {
    error: DispatchError,
    reference: Uuid,
}

impl ApiError {
    fn within(ctx: &RequestContext) -> impl FnOnce(DispatchError) -> ApiError + '_ {
        move |error| ApiError { error, reference: ctx.request_id }
    }
}

impl From<DispatchError> for ApiError {
    fn from(error: DispatchError) -> Self {
        Self { error, reference: Uuid::new_v4() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.error {
            DispatchError::NotFound { .. } => StatusCode::NOT_FOUND,
            DispatchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::Unauthorized => StatusCode::UNAUTHORIZED,
            DispatchError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            DispatchError::Conflict(_) | DispatchError::AlreadyResolved { .. } => StatusCode::CONFLICT,
            DispatchError::Database(_) | DispatchError::Serialization(_) | DispatchError::Worker(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = if self.error.is_unexpected() {
            error!(reference = %self.reference, error = %self.error, "unexpected failure");
            format!("internal error, reference {}", self.reference)
        } else {
            debug!(reference = %self.reference, error = %self.error, "request rejected");
            self.error.to_string()
        };

        (status, Json(json!({ "success": false, "message": message }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

// --- extracteurs ---------------------------------------------------------

/// Json dont les rejets sont rendus comme `InvalidRequest`
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| DispatchError::InvalidRequest(rejection.body_text()))?;
        Ok(Self(value))
    }
}

impl<S: Send + Sync> FromRequestParts<S> for RequestContext {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let operator = parts
            .headers
            .get("x-operator")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or("admin");
        Ok(RequestContext::new(operator))
    }
}

/// Institution authentifiée par son token bearer
#[derive(Debug, Clone, Copy)]
pub struct DeviceAuth {
    pub tenant_id: i64,
}

impl FromRequestParts<AppState> for DeviceAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or(DispatchError::Unauthorized)?;

        let tenant = state
            .blocking(move |db| db.with_repo(|repo| repo.tenant_by_token(&token)))
            .await?;
        match tenant {
            Some(tenant) if tenant.active_token().is_some() => Ok(DeviceAuth { tenant_id: tenant.id }),
            _ => {
                warn!(path = %parts.uri.path(), "SECURITY: rejected device credential");
                Err(DispatchError::Unauthorized.into())
            }
        }
    }
}

async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, ApiError> {
    let expected = state.config.admin_api_key.as_str();
    if expected.is_empty() {
        warn!("SECURITY: admin api key not configured - admin access denied");
        return Err(DispatchError::Unauthorized.into());
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!(path = %req.uri().path(), "SECURITY: rejected admin api key");
        return Err(DispatchError::Unauthorized.into());
    }
    Ok(next.run(req).await)
}

pub fn build_router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/migrations", get(list_migrations))
        .route("/migrations/bulk", post(bulk_migration))
        .route("/commands/fast-loop", post(fast_loop))
        .route("/commands/debug-mode", post(debug_mode))
        .route("/commands/reboot", post(reboot))
        .route("/commands/full-update", post(full_update))
        .route("/commands/execute", post(execute))
        .route("/commands/{id}", get(get_command))
        .route("/devices", get(list_devices))
        .route("/devices/{id}", get(get_device))
        .route("/devices/{id}/commands", get(device_commands))
        .route("/devices/{id}/audit", get(device_audit))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    let device = Router::new()
        .route("/heartbeat", post(heartbeat))
        .route("/claim", post(claim))
        .route("/report", post(report));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(device)
        .merge(admin)
        .with_state(state)
}

// --- surface device ------------------------------------------------------

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    device_id: i64,
    #[serde(default)]
    status: Option<DeviceStatus>,
}

#[derive(Debug, Deserialize)]
struct ClaimRequest {
    device_id: i64,
}

#[derive(Debug, Deserialize)]
struct ReportRequest {
    command_id: i64,
    status: ReportOutcome,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

async fn heartbeat(State(state): State<AppState>, auth: DeviceAuth, ApiJson(req): ApiJson<HeartbeatRequest>) -> ApiResult {
    let status = req.status.unwrap_or(DeviceStatus::Online);
    let device = state
        .blocking(move |db| dispatch::heartbeat(db, auth.tenant_id, req.device_id, status, OffsetDateTime::now_utc()))
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": "heartbeat recorded",
        "poll_interval_secs": device.poll_interval_secs,
        "debug_mode": device.debug_mode,
        "fast_loop_enabled": device.fast_loop_enabled,
    })))
}

async fn claim(State(state): State<AppState>, auth: DeviceAuth, ApiJson(req): ApiJson<ClaimRequest>) -> ApiResult {
    let command = state
        .blocking(move |db| dispatch::claim(db, auth.tenant_id, req.device_id, OffsetDateTime::now_utc()))
        .await?;
    let message = if command.is_some() { "command claimed" } else { "no pending command" };
    Ok(Json(json!({ "success": true, "message": message, "command": command })))
}

async fn report(State(state): State<AppState>, auth: DeviceAuth, ApiJson(req): ApiJson<ReportRequest>) -> ApiResult {
    let ack = state
        .blocking(move |db| {
            dispatch::report(
                db,
                auth.tenant_id,
                req.command_id,
                req.status,
                req.output.as_deref(),
                req.error.as_deref(),
                OffsetDateTime::now_utc(),
            )
        })
        .await?;

    let body = match ack {
        ReportAck::Recorded(command) => json!({
            "success": true,
            "message": format!("result recorded as {}", command.status),
            "status": command.status,
        }),
        ReportAck::Duplicate(command) => json!({
            "success": true,
            "message": "result already recorded",
            "status": command.status,
        }),
        ReportAck::Ignored { command_id, status } => json!({
            "success": true,
            "ignored": true,
            "message": format!("command {command_id} already resolved as {status}, result ignored"),
            "status": status,
        }),
    };
    Ok(Json(body))
}

// --- surface admin -------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BulkMigrationRequest {
    target_company_id: i64,
    kiosk_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct FastLoopRequest {
    kiosk_id: i64,
    enable: bool,
}

#[derive(Debug, Deserialize)]
struct DebugModeRequest {
    kiosk_id: i64,
    debug_mode: bool,
}

#[derive(Debug, Deserialize)]
struct RebootRequest {
    kiosk_id: i64,
    #[serde(default)]
    delay: u32,
}

#[derive(Debug, Deserialize)]
struct KioskRequest {
    kiosk_id: i64,
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    kiosk_id: i64,
    command: String,
}

fn queued(command_id: i64, message: &str) -> Json<Value> {
    Json(json!({ "success": true, "message": message, "command_id": command_id }))
}

async fn bulk_migration(
    State(state): State<AppState>,
    ctx: RequestContext,
    ApiJson(req): ApiJson<BulkMigrationRequest>,
) -> ApiResult {
    let op_ctx = ctx.clone();
    let report = state
        .blocking(move |db| {
            queue_bulk_migration(db, &op_ctx, req.target_company_id, &req.kiosk_ids, OffsetDateTime::now_utc())
        })
        .await
        .map_err(ApiError::within(&ctx))?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Migration queued. Queued: {}, Skipped: {}.", report.queued_count, report.skipped_count),
        "queued_count": report.queued_count,
        "skipped_count": report.skipped_count,
    })))
}

async fn fast_loop(State(state): State<AppState>, ctx: RequestContext, ApiJson(req): ApiJson<FastLoopRequest>) -> ApiResult {
    let intervals = state.config.poll_intervals();
    let op_ctx = ctx.clone();
    let id = state
        .blocking(move |db| {
            controls::set_fast_loop(db, &op_ctx, req.kiosk_id, req.enable, intervals, OffsetDateTime::now_utc())
        })
        .await
        .map_err(ApiError::within(&ctx))?;
    let message = if req.enable { "fast loop enabled" } else { "fast loop disabled" };
    Ok(queued(id, message))
}

async fn debug_mode(State(state): State<AppState>, ctx: RequestContext, ApiJson(req): ApiJson<DebugModeRequest>) -> ApiResult {
    let op_ctx = ctx.clone();
    let id = state
        .blocking(move |db| controls::set_debug_mode(db, &op_ctx, req.kiosk_id, req.debug_mode, OffsetDateTime::now_utc()))
        .await
        .map_err(ApiError::within(&ctx))?;
    let message = if req.debug_mode { "debug mode enabled" } else { "debug mode disabled" };
    Ok(queued(id, message))
}

async fn reboot(State(state): State<AppState>, ctx: RequestContext, ApiJson(req): ApiJson<RebootRequest>) -> ApiResult {
    let op_ctx = ctx.clone();
    let id = state
        .blocking(move |db| controls::request_reboot(db, &op_ctx, req.kiosk_id, req.delay, OffsetDateTime::now_utc()))
        .await
        .map_err(ApiError::within(&ctx))?;
    Ok(queued(id, "reboot queued"))
}

async fn full_update(State(state): State<AppState>, ctx: RequestContext, ApiJson(req): ApiJson<KioskRequest>) -> ApiResult {
    let op_ctx = ctx.clone();
    let id = state
        .blocking(move |db| controls::queue_forced_update(db, &op_ctx, req.kiosk_id, OffsetDateTime::now_utc()))
        .await
        .map_err(ApiError::within(&ctx))?;
    Ok(queued(id, "full update queued"))
}

async fn execute(State(state): State<AppState>, ctx: RequestContext, ApiJson(req): ApiJson<ExecuteRequest>) -> ApiResult {
    let op_ctx = ctx.clone();
    let id = state
        .blocking(move |db| {
            controls::queue_custom_shell(db, &op_ctx, req.kiosk_id, &req.command, OffsetDateTime::now_utc())
        })
        .await
        .map_err(ApiError::within(&ctx))?;
    Ok(queued(id, "command queued"))
}

async fn get_command(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let command = state
        .blocking(move |db| db.with_repo(|repo| repo.command(id)))
        .await?
        .ok_or_else(|| DispatchError::not_found("command", id))?;
    Ok(Json(json!({ "success": true, "message": "ok", "command": command })))
}

#[derive(Serialize)]
struct DeviceView {
    #[serde(flatten)]
    device: Device,
    effective_status: DeviceStatus,
}

fn to_view(policy: &StatusPolicy, device: Device, now: OffsetDateTime) -> DeviceView {
    let effective_status = effective_status(&device, now, policy);
    DeviceView { device, effective_status }
}

async fn list_devices(State(state): State<AppState>) -> ApiResult {
    let policy = state.config.status_policy();
    let now = OffsetDateTime::now_utc();
    let devices: Vec<DeviceView> = state
        .blocking(|db| db.with_repo(|repo| repo.list_devices()))
        .await?
        .into_iter()
        .map(|d| to_view(&policy, d, now))
        .collect();
    Ok(Json(json!({ "success": true, "message": "ok", "devices": devices })))
}

async fn get_device(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let (device, migration) = state
        .blocking(move |db| {
            db.with_repo(|repo| {
                let device = repo.device(id)?.ok_or_else(|| DispatchError::not_found("device", id))?;
                Ok((device, repo.migration_for_device(id)?))
            })
        })
        .await?;
    let view = to_view(&state.config.status_policy(), device, OffsetDateTime::now_utc());
    Ok(Json(json!({ "success": true, "message": "ok", "device": view, "migration": migration })))
}

async fn device_commands(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let commands = state
        .blocking(move |db| {
            db.with_repo(|repo| {
                repo.device(id)?.ok_or_else(|| DispatchError::not_found("device", id))?;
                repo.commands_for_device(id, COMMAND_HISTORY_LIMIT)
            })
        })
        .await?;
    Ok(Json(json!({ "success": true, "message": "ok", "commands": commands })))
}

async fn device_audit(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let entries = state
        .blocking(move |db| {
            db.with_repo(|repo| {
                repo.device(id)?.ok_or_else(|| DispatchError::not_found("device", id))?;
                repo.audit_for_device(id, AUDIT_HISTORY_LIMIT)
            })
        })
        .await?;
    Ok(Json(json!({ "success": true, "message": "ok", "entries": entries })))
}

async fn list_migrations(State(state): State<AppState>) -> ApiResult {
    let migrations = state
        .blocking(|db| db.with_repo(|repo| repo.list_migrations(MIGRATION_LIST_LIMIT)))
        .await?;
    Ok(Json(json!({ "success": true, "message": "ok", "migrations": migrations })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewDevice;
    use axum::body::Body;
    use tower::ServiceExt;

    fn app() -> (Router, i64) {
        let db = Database::open_in_memory().unwrap();
        let device = db
            .with_repo(|repo| {
                let tenant = repo.insert_tenant("School", Some("tok"), true)?;
                repo.insert_device(&NewDevice::new("k1", Some(tenant)))
            })
            .unwrap();
        let config = KernelConfig { admin_api_key: "secret".into(), ..KernelConfig::default() };
        let state = AppState { db: Arc::new(db), config: Arc::new(config) };
        (build_router(state), device)
    }

    async fn call(router: Router, req: axum::http::Request<Body>) -> (StatusCode, Value) {
        let resp = router.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_health_needs_no_key() {
        let (router, _) = app();
        let req = axum::http::Request::get("/health").body(Body::empty()).unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_requires_api_key() {
        let (router, _) = app();
        let req = axum::http::Request::get("/devices").body(Body::empty()).unwrap();
        let (status, body) = call(router, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_device_requires_bearer() {
        let (router, device) = app();
        let req = axum::http::Request::post("/claim")
            .header("content-type", "application/json")
            .header("authorization", "Bearer wrong")
            .body(Body::from(json!({ "device_id": device }).to_string()))
            .unwrap();
        let (status, _) = call(router, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let (router, _) = app();
        let req = axum::http::Request::post("/commands/reboot")
            .header("content-type", "application/json")
            .header("x-api-key", "secret")
            .body(Body::from("{\"kiosk_id\": \"nope\"}"))
            .unwrap();
        let (status, body) = call(router, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_reboot_unknown_device_is_not_found() {
        let (router, _) = app();
        let req = axum::http::Request::post("/commands/reboot")
            .header("content-type", "application/json")
            .header("x-api-key", "secret")
            .body(Body::from(json!({ "kiosk_id": 999, "delay": 5 }).to_string()))
            .unwrap();
        let (status, body) = call(router, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "device 999 not found");
    }

    #[tokio::test]
    async fn test_unexpected_error_hides_detail() {
        let err = ApiError::from(DispatchError::Database(rusqlite::Error::InvalidQuery));
        let reference = err.reference.to_string();
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        let message = body["message"].as_str().unwrap();
        assert!(message.contains(&reference));
        assert!(!message.contains("query"));
    }

    #[tokio::test]
    async fn test_store_worker_panic_is_internal_error() {
        let state = AppState {
            db: Arc::new(Database::open_in_memory().unwrap()),
            config: Arc::new(KernelConfig::default()),
        };
        let err = state
            .blocking(|_| -> DispatchResult<()> { panic!("worker died") })
            .await
            .unwrap_err();
        assert!(err.is_unexpected());
        let resp = ApiError::from(err).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
