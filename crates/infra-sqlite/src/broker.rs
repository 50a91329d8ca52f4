// SQLite Broker Adapter
// Implements: BrokerConnector, BrokerChannel, DeliveryStream, Acker
//
// Every channel owns a small pool over the same database file. Messages are
// rows; a delivery is a row claimed by one channel (state UNACKED, stamped
// with the channel's consumer tag) until it is deleted (ack), moved to the
// tail (nack + requeue) or parked as REJECTED (nack, no requeue).
//
// A claim is a lease. While a channel is alive a heartbeat task renews
// `delivered_at` on its rows; consuming channels requeue rows whose lease
// ran out, which is how deliveries of a crashed consumer come back.

use crate::connection::create_pool;
use crate::migration::run_migrations;
use crate::recovery::requeue_expired_deliveries;
use async_trait::async_trait;
use loanq_core::port::{
    Acker, BrokerChannel, BrokerConnector, BrokerError, Delivery, DeliveryStream, TimeProvider,
};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How often an idle consumer looks for work published by other channels
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a claimed delivery stays with its channel without renewal (10s)
pub const DEFAULT_DELIVERY_LEASE: Duration = Duration::from_secs(10);

/// Lease renewals (and expired-lease sweeps) per lease period
const RENEWALS_PER_LEASE: u32 = 5;

const STATE_READY: &str = "READY";
const STATE_UNACKED: &str = "UNACKED";
const STATE_REJECTED: &str = "REJECTED";

/// Helper to convert sqlx::Error to BrokerError
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> BrokerError {
    match &err {
        sqlx::Error::PoolClosed => BrokerError::Closed,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Configuration(_) => {
            BrokerError::Connection(err.to_string())
        }
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            // SQLite error codes: https://www.sqlite.org/rescode.html
            Some("5") | Some("6") => {
                BrokerError::Channel(format!("Database locked or busy: {}", db_err.message()))
            }
            Some("14") => BrokerError::Connection(format!(
                "Unable to open database file: {}",
                db_err.message()
            )),
            _ => BrokerError::Channel(err.to_string()),
        },
        _ => BrokerError::Channel(err.to_string()),
    }
}

/// Connector for `sqlite:` addresses
pub struct SqliteBroker {
    time_provider: Arc<dyn TimeProvider>,
    delivery_lease: Duration,
}

impl SqliteBroker {
    pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            time_provider,
            delivery_lease: DEFAULT_DELIVERY_LEASE,
        }
    }

    /// Override how long an unrenewed delivery stays claimed
    pub fn with_delivery_lease(mut self, lease: Duration) -> Self {
        self.delivery_lease = lease;
        self
    }
}

#[async_trait]
impl BrokerConnector for SqliteBroker {
    async fn connect(&self, address: &str) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let pool = create_pool(address)
            .await
            .map_err(|e| BrokerError::Connection(format!("{}: {}", address, e)))?;
        run_migrations(&pool)
            .await
            .map_err(|e| BrokerError::Connection(format!("schema migration failed: {}", e)))?;

        let channel = SqliteChannel::new(pool, self.time_provider.clone(), self.delivery_lease);
        debug!(consumer_tag = %channel.consumer_tag, "SQLite broker channel opened");
        Ok(Box::new(channel))
    }
}

/// State shared by a channel, its delivery stream and its ackers
struct ChannelShared {
    prefetch: AtomicU16,
    unacked: AtomicUsize,
    closed: AtomicBool,
    consuming: AtomicBool,
    /// Wakes a consumer waiting for prefetch capacity or close
    notify: Notify,
    /// Held while claiming a row, so close never races a claim
    claim_gate: Mutex<()>,
}

impl ChannelShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn has_capacity(&self) -> bool {
        let prefetch = self.prefetch.load(Ordering::SeqCst) as usize;
        prefetch == 0 || self.unacked.load(Ordering::SeqCst) < prefetch
    }

    fn release(&self) {
        let _ = self
            .unacked
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        self.notify.notify_waiters();
    }
}

pub struct SqliteChannel {
    pool: SqlitePool,
    consumer_tag: String,
    time_provider: Arc<dyn TimeProvider>,
    delivery_lease: Duration,
    shared: Arc<ChannelShared>,
    heartbeat: JoinHandle<()>,
}

impl SqliteChannel {
    fn new(
        pool: SqlitePool,
        time_provider: Arc<dyn TimeProvider>,
        delivery_lease: Duration,
    ) -> Self {
        let consumer_tag = format!("ctag-{}", Uuid::new_v4());
        let shared = Arc::new(ChannelShared {
            prefetch: AtomicU16::new(0),
            unacked: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            consuming: AtomicBool::new(false),
            notify: Notify::new(),
            claim_gate: Mutex::new(()),
        });
        let heartbeat = tokio::spawn(renew_leases(
            pool.clone(),
            consumer_tag.clone(),
            time_provider.clone(),
            shared.clone(),
            renewal_interval(delivery_lease),
        ));

        Self {
            pool,
            consumer_tag,
            time_provider,
            delivery_lease,
            shared,
            heartbeat,
        }
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.shared.is_closed() {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    async fn queue_exists(&self, name: &str) -> Result<bool, BrokerError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM queues WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl BrokerChannel for SqliteChannel {
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;

        sqlx::query(
            "INSERT INTO queues (name, durable, created_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(durable)
        .bind(self.time_provider.now_millis())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let existing: bool = sqlx::query_scalar("SELECT durable FROM queues WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        if existing != durable {
            return Err(BrokerError::Precondition(format!(
                "queue '{}' already declared with durable={}",
                name, existing
            )));
        }
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        persistent: bool,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let result = sqlx::query(
            r#"
            INSERT INTO messages (queue, position, payload, persistent, state, published_at)
            SELECT ?,
                   COALESCE((SELECT MAX(position) FROM messages WHERE queue = ?), 0) + 1,
                   ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM queues WHERE name = ?)
            "#,
        )
        .bind(queue)
        .bind(queue)
        .bind(payload)
        .bind(persistent)
        .bind(STATE_READY)
        .bind(self.time_provider.now_millis())
        .bind(queue)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.shared.prefetch.store(count, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        self.ensure_open()?;
        if !self.queue_exists(queue).await? {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        if self.shared.consuming.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Channel("channel already consuming".to_string()));
        }

        info!(queue = %queue, consumer_tag = %self.consumer_tag, "Consumer registered");
        Ok(Box::new(SqliteDeliveryStream {
            pool: self.pool.clone(),
            queue: queue.to_string(),
            consumer_tag: self.consumer_tag.clone(),
            time_provider: self.time_provider.clone(),
            delivery_lease: self.delivery_lease,
            last_sweep: None,
            shared: self.shared.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.notify.notify_waiters();

        // Wait out any claim in flight, then hand unsettled rows back.
        // Original positions are kept, so they return to the head of the queue.
        let _gate = self.shared.claim_gate.lock().await;
        let requeued = sqlx::query(
            "UPDATE messages SET state = ?, consumer_tag = NULL
             WHERE consumer_tag = ? AND state = ?",
        )
        .bind(STATE_READY)
        .bind(&self.consumer_tag)
        .bind(STATE_UNACKED)
        .execute(&self.pool)
        .await
        .map(|r| r.rows_affected());

        match requeued {
            Ok(0) => {}
            Ok(n) => info!(
                consumer_tag = %self.consumer_tag,
                requeued = n,
                "Requeued unacked deliveries"
            ),
            Err(e) => warn!(error = %e, "Failed to requeue unacked deliveries on close"),
        }

        self.heartbeat.abort();
        self.pool.close().await;
        debug!(consumer_tag = %self.consumer_tag, "SQLite broker channel closed");
        Ok(())
    }
}

// A channel dropped without close stops renewing; its leases then expire.
impl Drop for SqliteChannel {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

fn renewal_interval(lease: Duration) -> Duration {
    (lease / RENEWALS_PER_LEASE).max(Duration::from_millis(1))
}

/// Keep the channel's claimed rows leased until it closes
async fn renew_leases(
    pool: SqlitePool,
    consumer_tag: String,
    time_provider: Arc<dyn TimeProvider>,
    shared: Arc<ChannelShared>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if shared.is_closed() {
            break;
        }
        if shared.unacked.load(Ordering::SeqCst) == 0 {
            continue;
        }

        let renewed = sqlx::query(
            "UPDATE messages SET delivered_at = ? WHERE consumer_tag = ? AND state = ?",
        )
        .bind(time_provider.now_millis())
        .bind(&consumer_tag)
        .bind(STATE_UNACKED)
        .execute(&pool)
        .await
        .map_err(map_sqlx_error);

        match renewed {
            Ok(_) => {}
            Err(BrokerError::Closed) => break,
            Err(e) => warn!(
                consumer_tag = %consumer_tag,
                error = %e,
                "Failed to renew delivery leases"
            ),
        }
    }
}

struct SqliteDeliveryStream {
    pool: SqlitePool,
    queue: String,
    consumer_tag: String,
    time_provider: Arc<dyn TimeProvider>,
    delivery_lease: Duration,
    last_sweep: Option<Instant>,
    shared: Arc<ChannelShared>,
}

impl SqliteDeliveryStream {
    /// Hand deliveries whose lease ran out back to the queue, at most once
    /// per renewal interval
    async fn sweep_expired_leases(&mut self) {
        let due = self
            .last_sweep
            .map_or(true, |at| at.elapsed() >= renewal_interval(self.delivery_lease));
        if !due {
            return;
        }
        self.last_sweep = Some(Instant::now());

        let cutoff = self.time_provider.now_millis() - self.delivery_lease.as_millis() as i64;
        match requeue_expired_deliveries(&self.pool, Some(&self.queue), cutoff).await {
            Ok(0) => {}
            Ok(n) => info!(
                queue = %self.queue,
                requeued = n,
                "Requeued deliveries with expired leases"
            ),
            Err(e) => warn!(queue = %self.queue, error = %e, "Expired lease sweep failed"),
        }
    }

    /// Claim the oldest ready row, if any
    async fn claim(&self) -> Result<Option<(i64, Vec<u8>, i64)>, BrokerError> {
        sqlx::query_as::<_, (i64, Vec<u8>, i64)>(
            r#"
            UPDATE messages
            SET state = ?, consumer_tag = ?, delivered_at = ?, delivery_count = delivery_count + 1
            WHERE id = (
                SELECT id FROM messages
                WHERE queue = ? AND state = ?
                ORDER BY position ASC, id ASC
                LIMIT 1
            )
            RETURNING id, payload, delivery_count
            "#,
        )
        .bind(STATE_UNACKED)
        .bind(&self.consumer_tag)
        .bind(self.time_provider.now_millis())
        .bind(&self.queue)
        .bind(STATE_READY)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }

    async fn idle(&self) {
        tokio::select! {
            _ = self.shared.notify.notified() => {}
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

#[async_trait]
impl DeliveryStream for SqliteDeliveryStream {
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        loop {
            if self.shared.is_closed() {
                return None;
            }
            if !self.shared.has_capacity() {
                self.idle().await;
                continue;
            }
            self.sweep_expired_leases().await;

            let claimed = {
                let _gate = self.shared.claim_gate.lock().await;
                if self.shared.is_closed() {
                    return None;
                }
                match self.claim().await {
                    Ok(Some(row)) => {
                        self.shared.unacked.fetch_add(1, Ordering::SeqCst);
                        Some(row)
                    }
                    Ok(None) => None,
                    Err(BrokerError::Closed) => return None,
                    Err(e) => return Some(Err(e)),
                }
            };

            match claimed {
                Some((id, payload, delivery_count)) => {
                    let acker = SqliteAcker {
                        pool: self.pool.clone(),
                        queue: self.queue.clone(),
                        consumer_tag: self.consumer_tag.clone(),
                        id,
                        time_provider: self.time_provider.clone(),
                        shared: self.shared.clone(),
                    };
                    return Some(Ok(Delivery::new(
                        id as u64,
                        payload,
                        delivery_count > 1,
                        Box::new(acker),
                    )));
                }
                None => self.idle().await,
            }
        }
    }
}

struct SqliteAcker {
    pool: SqlitePool,
    queue: String,
    consumer_tag: String,
    id: i64,
    time_provider: Arc<dyn TimeProvider>,
    shared: Arc<ChannelShared>,
}

impl SqliteAcker {
    fn settled(&self, rows_affected: u64) -> Result<(), BrokerError> {
        if rows_affected == 0 {
            return Err(BrokerError::Channel(format!(
                "unknown delivery tag {}",
                self.id
            )));
        }
        self.shared.release();
        Ok(())
    }
}

#[async_trait]
impl Acker for SqliteAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        if self.shared.is_closed() {
            return Err(BrokerError::Closed);
        }
        let result =
            sqlx::query("DELETE FROM messages WHERE id = ? AND consumer_tag = ? AND state = ?")
                .bind(self.id)
                .bind(&self.consumer_tag)
                .bind(STATE_UNACKED)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        self.settled(result.rows_affected())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        if self.shared.is_closed() {
            return Err(BrokerError::Closed);
        }

        let result = if requeue {
            sqlx::query(
                r#"
                UPDATE messages
                SET state = ?, consumer_tag = NULL,
                    position = (SELECT COALESCE(MAX(position), 0) + 1 FROM messages WHERE queue = ?)
                WHERE id = ? AND consumer_tag = ? AND state = ?
                "#,
            )
            .bind(STATE_READY)
            .bind(&self.queue)
            .bind(self.id)
            .bind(&self.consumer_tag)
            .bind(STATE_UNACKED)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                "UPDATE messages SET state = ?, consumer_tag = NULL, rejected_at = ?
                 WHERE id = ? AND consumer_tag = ? AND state = ?",
            )
            .bind(STATE_REJECTED)
            .bind(self.time_provider.now_millis())
            .bind(self.id)
            .bind(&self.consumer_tag)
            .bind(STATE_UNACKED)
            .execute(&self.pool)
            .await
        }
        .map_err(map_sqlx_error)?;

        self.settled(result.rows_affected())
    }
}

/// Message counts for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub unacked: usize,
    pub rejected: usize,
}

/// Count messages in `queue` by state
pub async fn queue_stats(pool: &SqlitePool, queue: &str) -> Result<QueueStats, BrokerError> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT state, COUNT(*) FROM messages WHERE queue = ? GROUP BY state")
            .bind(queue)
            .fetch_all(pool)
            .await
            .map_err(map_sqlx_error)?;

    let mut stats = QueueStats::default();
    for (state, count) in rows {
        let count = count as usize;
        match state.as_str() {
            STATE_READY => stats.ready = count,
            STATE_UNACKED => stats.unacked = count,
            STATE_REJECTED => stats.rejected = count,
            other => warn!(state = %other, "Unknown message state"),
        }
    }
    Ok(stats)
}

/// Payloads nacked without requeue, oldest first
pub async fn rejected_payloads(
    pool: &SqlitePool,
    queue: &str,
) -> Result<Vec<Vec<u8>>, BrokerError> {
    sqlx::query_scalar(
        "SELECT payload FROM messages WHERE queue = ? AND state = ?
         ORDER BY rejected_at ASC, id ASC",
    )
    .bind(queue)
    .bind(STATE_REJECTED)
    .fetch_all(pool)
    .await
    .map_err(map_sqlx_error)
}
