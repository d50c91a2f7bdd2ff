//! Keep-alive watchdog.
//!
//! Provider-side sync state decays if a mailbox is never touched. The
//! watchdog periodically finds groups whose folders have all gone without a
//! sync for [`STALE_AFTER_DAYS`] and submits a `check` probe for each, which
//! fetches a single page without persisting anything.

use std::time::Duration;

use super::pool::TaskRuntime;
use super::task::{TaskPayload, TaskSpec, UserRole};
use crate::store::Store;
use crate::sync::SyncStrategy;

/// A group counts as stale when no folder synced within this window.
pub const STALE_AFTER_DAYS: i64 = 85;

/// Synthetic user the watchdog submits under.
const SYSTEM_USER_ID: i64 = 0;

pub struct MaintenanceWatchdog {
    store: Store,
    runtime: TaskRuntime,
    interval: Duration,
}

impl MaintenanceWatchdog {
    pub fn new(store: Store, runtime: TaskRuntime, interval: Duration) -> Self {
        Self {
            store,
            runtime,
            interval,
        }
    }

    pub async fn run(self) -> ! {
        log::info!(
            "maintenance watchdog started, probing groups idle for {}+ days",
            STALE_AFTER_DAYS
        );

        loop {
            tokio::time::sleep(self.interval).await;

            let stale = match self.find_stale_groups().await {
                Ok(groups) => groups,
                Err(e) => {
                    log::error!("watchdog: stale-group scan failed: {}", e);
                    continue;
                }
            };

            for group_id in stale {
                log::info!("watchdog: submitting keep-alive check for group {}", group_id);
                let spec = TaskSpec {
                    user_id: SYSTEM_USER_ID,
                    role: UserRole::Admin,
                    group_id,
                    payload: TaskPayload::Sync {
                        strategy: SyncStrategy::Check,
                    },
                };
                if let Err(e) = self.runtime.submit(spec).await {
                    log::warn!("watchdog: check submission failed: {}", e);
                }
            }
        }
    }

    /// Groups with a token row whose newest folder sync is older than the
    /// stale window (or that never synced at all).
    async fn find_stale_groups(&self) -> Result<Vec<String>, sqlx::Error> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT f.group_id
             FROM mail_folders f
             JOIN account_token t ON t.group_id = f.group_id
             GROUP BY f.group_id
             HAVING MAX(f.last_sync_at) IS NULL
                 OR MAX(f.last_sync_at) < datetime('now', '-{} days')",
            STALE_AFTER_DAYS
        ))
        .fetch_all(self.store.pool())
        .await?;

        Ok(rows.into_iter().map(|(group_id,)| group_id).collect())
    }
}
