// Crash recovery for the SQLite queue
// A claimed row carries a lease: its channel renews `delivered_at` while it
// is alive. A consumer that dies without closing its channel stops renewing,
// and once the lease runs out the row goes back to READY. Consuming channels
// sweep their queue for expired leases as they poll; the daemon also sweeps
// every queue once at startup.

use crate::broker::{map_sqlx_error, DEFAULT_DELIVERY_LEASE};
use loanq_core::port::{BrokerError, TimeProvider};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Requeue UNACKED rows whose lease was last renewed before `cutoff_millis`
///
/// `queue = None` sweeps every queue. Rows keep their position, so they are
/// redelivered first.
pub(crate) async fn requeue_expired_deliveries(
    pool: &SqlitePool,
    queue: Option<&str>,
    cutoff_millis: i64,
) -> Result<u64, BrokerError> {
    let result = sqlx::query(
        "UPDATE messages SET state = 'READY', consumer_tag = NULL
         WHERE state = 'UNACKED' AND delivered_at < ? AND (? IS NULL OR queue = ?)",
    )
    .bind(cutoff_millis)
    .bind(queue)
    .bind(queue)
    .execute(pool)
    .await
    .map_err(map_sqlx_error)?;
    Ok(result.rows_affected())
}

pub struct SqliteRecovery {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
    recovery_window: Duration,
}

impl SqliteRecovery {
    /// Create a recovery pass over `pool`
    ///
    /// # Arguments
    /// * `recovery_window` - Optional custom window (default: the delivery
    ///   lease, so only deliveries nobody is renewing are touched)
    pub fn new(
        pool: SqlitePool,
        time_provider: Arc<dyn TimeProvider>,
        recovery_window: Option<Duration>,
    ) -> Self {
        Self {
            pool,
            time_provider,
            recovery_window: recovery_window.unwrap_or(DEFAULT_DELIVERY_LEASE),
        }
    }

    /// Requeue UNACKED rows whose lease expired before `now - recovery_window`
    ///
    /// # Returns
    /// Number of deliveries recovered
    pub async fn recover_orphaned_deliveries(&self) -> Result<u64, BrokerError> {
        let cutoff = self.time_provider.now_millis() - self.recovery_window.as_millis() as i64;

        info!(cutoff_time = cutoff, "Starting orphaned delivery recovery");
        let recovered = requeue_expired_deliveries(&self.pool, None, cutoff).await?;
        info!(recovered_count = recovered, "Orphaned delivery recovery completed");
        Ok(recovered)
    }
}
