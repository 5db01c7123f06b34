/**
 * KIOSK KERNEL - Point d'entrée du serveur de dispatch
 *
 * RÔLE : Bootstrap : config, base SQLite, sweeper de timeouts, API HTTP.
 */

use anyhow::Context;
use kiosk_kernel::config::load_config;
use kiosk_kernel::http::{build_router, AppState};
use kiosk_kernel::store::Database;
use kiosk_kernel::sweeper::spawn_timeout_sweeper;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kiosk_kernel=info")),
        )
        .init();

    let config = load_config().await;
    if config.admin_api_key.is_empty() {
        warn!("SECURITY: KIOSK_ADMIN_API_KEY not set - admin API will deny every request");
    }

    if let Some(dir) = config.database_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create data dir {}", dir.display()))?;
    }
    let db = Arc::new(
        Database::open(&config.database_path)
            .with_context(|| format!("failed to open database {}", config.database_path.display()))?,
    );

    spawn_timeout_sweeper(db.clone(), config.claim_timeout(), config.sweep_interval());

    let listen_addr = config.listen_addr.clone();
    let app = build_router(AppState { db, config: Arc::new(config) });

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!("listening on http://{listen_addr}");
    axum::serve(listener, app).await.context("http server stopped")?;
    Ok(())
}
