/**
 * SWEEPER - Expiration périodique des commandes réclamées sans résultat
 *
 * RÔLE : Tâche tokio qui, à chaque intervalle, passe en `timeout` les commandes
 * `sent` depuis plus que `claim_timeout` puis réconcilie les migrations.
 * Tenue de comptes pour l'admin : la livraison at-most-once n'en dépend pas.
 */

use crate::context::RequestContext;
use crate::dispatch::{self, SweepSummary};
use crate::store::Database;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub fn spawn_timeout_sweeper(
    db: Arc<Database>,
    claim_timeout: time::Duration,
    every: std::time::Duration,
) -> JoinHandle<()> {
    info!(claim_timeout_secs = claim_timeout.whole_seconds(), every_secs = every.as_secs(), "starting timeout sweeper");

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let db = Arc::clone(&db);
            let outcome = tokio::task::spawn_blocking(move || {
                dispatch::sweep(&db, &RequestContext::system(), claim_timeout, OffsetDateTime::now_utc())
            })
            .await;

            match outcome {
                Ok(Ok(SweepSummary { timed_out: 0, migrations_finished: 0 })) => debug!("sweep: nothing to do"),
                Ok(Ok(summary)) => info!(
                    timed_out = summary.timed_out,
                    migrations_finished = summary.migrations_finished,
                    "sweep completed"
                ),
                Ok(Err(e)) => error!(error = %e, "sweep failed"),
                Err(e) => error!(error = %e, "sweep task panicked"),
            }
        }
    })
}
