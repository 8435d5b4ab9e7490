//! Background trigger for scheduled reconciliation passes.

use crate::services::reconciler::Reconciler;
use chrono::Utc;
use croner::Cron;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

/// Default schedule: daily at midnight UTC.
pub const DEFAULT_CLEANUP_SCHEDULE: &str = "0 0 * * *";

/// Parse a cron expression for the cleanup schedule.
pub fn parse_schedule(expr: &str) -> Result<Cron, croner::errors::CronError> {
    Cron::new(expr).parse()
}

/// Spawn a task that runs `reconciler` at every occurrence of `schedule`
/// until `shutdown` flips to `true`.
pub fn spawn_cleanup_schedule(
    reconciler: Reconciler,
    schedule: Cron,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let next = match schedule.find_next_occurrence(&now, false) {
                Ok(next) => next,
                Err(err) => {
                    warn!(error = %err, "cleanup schedule has no next occurrence; stopping");
                    return;
                }
            };
            let wait = (next - now).to_std().unwrap_or_default();
            info!(next = %next, "next scheduled cleanup");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    let count = reconciler.run().await;
                    info!("Auto cleanup completed: {} expired files removed", count);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("cleanup scheduler stopping");
                        return;
                    }
                }
            }
        }
    })
}
