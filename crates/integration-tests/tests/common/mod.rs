//! Shared fixtures: temp-file queues, consumers and polling helpers

#![allow(dead_code)]

use loanq_core::application::{
    shutdown_channel, ConsumerStats, DecisionConsumer, RequestProducer, ShutdownSender,
    ThresholdPolicy,
};
use loanq_core::domain::{LoanApprovalRequest, QueueSettings};
use loanq_core::port::decision_sink::mocks::RecordingSink;
use loanq_core::port::time_provider::SystemTimeProvider;
use loanq_core::port::BrokerConnector;
use loanq_infra_sqlite::{create_pool, queue_stats, run_migrations, QueueStats, SqliteBroker};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const QUEUE: &str = "loan_approval_queue";

pub fn temp_queue_url(tag: &str) -> String {
    let path = std::env::temp_dir().join(format!("loanq-it-{}-{}.db", tag, uuid::Uuid::new_v4()));
    format!("sqlite:{}", path.display())
}

pub fn connector() -> Arc<dyn BrokerConnector> {
    Arc::new(SqliteBroker::new(Arc::new(SystemTimeProvider)))
}

pub fn settings(processing_delay: Duration) -> QueueSettings {
    QueueSettings::new(QUEUE).with_processing_delay(processing_delay)
}

pub async fn connected_producer(url: &str) -> RequestProducer {
    let producer = RequestProducer::new(url, settings(Duration::ZERO), connector());
    producer.connect().await.unwrap();
    producer
}

pub fn request(id: i64, amount: Decimal, term: u32) -> LoanApprovalRequest {
    LoanApprovalRequest::new(id, id, format!("Borrower {}", id), amount, term, chrono::Utc::now())
}

/// A consumer running on its own task until `stop` is called
pub struct RunningConsumer {
    pub sink: Arc<RecordingSink>,
    shutdown: ShutdownSender,
    handle: JoinHandle<ConsumerStats>,
}

impl RunningConsumer {
    pub async fn start(url: &str, processing_delay: Duration) -> Self {
        Self::start_with_sink(url, processing_delay, Arc::new(RecordingSink::new())).await
    }

    pub async fn start_with_sink(
        url: &str,
        processing_delay: Duration,
        sink: Arc<RecordingSink>,
    ) -> Self {
        let mut consumer = DecisionConsumer::new(
            url,
            settings(processing_delay),
            connector(),
            Arc::new(ThresholdPolicy::default()),
            sink.clone(),
            Arc::new(SystemTimeProvider),
        );
        consumer.connect().await.unwrap();

        let (shutdown, token) = shutdown_channel();
        let handle = tokio::spawn(async move {
            let stats = consumer.start_consuming(token).await.unwrap();
            consumer.close().await;
            stats
        });

        Self {
            sink,
            shutdown,
            handle,
        }
    }

    pub async fn stop(self) -> ConsumerStats {
        self.shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("consumer did not stop")
            .unwrap()
    }
}

pub async fn stats(url: &str) -> QueueStats {
    let pool = create_pool(url).await.unwrap();
    run_migrations(&pool).await.unwrap();
    let stats = queue_stats(&pool, QUEUE).await.unwrap();
    pool.close().await;
    stats
}

/// Poll until `done` holds or 10s pass
pub async fn eventually<F>(what: &str, done: F)
where
    F: FnMut() -> bool,
{
    eventually_within(what, Duration::from_secs(10), done).await
}

pub async fn eventually_within<F>(what: &str, timeout: Duration, mut done: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Poll until the queue holds nothing ready or in flight
pub async fn drained(url: &str) {
    for _ in 0..500 {
        let s = stats(url).await;
        if s.ready == 0 && s.unacked == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("queue did not drain");
}
