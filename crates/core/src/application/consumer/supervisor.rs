// Consumer supervision: (re)connect under a retry policy and keep consuming
// until shutdown.

use super::constants::ERROR_RECOVERY_SLEEP_DURATION;
use super::{ConsumerStats, DecisionConsumer, ShutdownToken};
use crate::application::retry::{RetryDecision, RetryPolicy};
use crate::error::{AppError, Result};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

const CONNECT_RETRY_KEY: &str = "consumer-connect";

impl DecisionConsumer {
    /// Connect, consume and reconnect after broker loss, until shutdown
    ///
    /// Each (re)connection gets `connect_retry.max_attempts` tries. Running
    /// out, or a configuration the broker can never accept, is returned as an
    /// error. A session that fails (including a failed ack or nack) is closed,
    /// which hands unsettled deliveries back, and then reconnected.
    /// Counters accumulate across sessions.
    pub async fn run(
        &mut self,
        connect_retry: &RetryPolicy,
        mut shutdown: ShutdownToken,
    ) -> Result<ConsumerStats> {
        let mut total = ConsumerStats::default();

        loop {
            if !self.connect_with_retry(connect_retry, &mut shutdown).await? {
                return Ok(total);
            }

            let session = self.start_consuming(shutdown.clone()).await;
            self.close().await;

            match session {
                Ok(stats) => {
                    total.acked += stats.acked;
                    total.rejected += stats.rejected;
                }
                Err(e @ AppError::InvalidState(_)) => return Err(e),
                Err(e) => warn!(error = %e, "Consumer session failed"),
            }

            if shutdown.is_shutdown() {
                return Ok(total);
            }

            warn!(
                delay_ms = ERROR_RECOVERY_SLEEP_DURATION.as_millis() as u64,
                "Lost broker connection, reconnecting"
            );
            if !pause(ERROR_RECOVERY_SLEEP_DURATION, &mut shutdown).await {
                return Ok(total);
            }
        }
    }

    /// `Ok(false)` when shutdown arrived before a connection was made
    async fn connect_with_retry(
        &mut self,
        connect_retry: &RetryPolicy,
        shutdown: &mut ShutdownToken,
    ) -> Result<bool> {
        let mut attempt = 1;
        loop {
            if shutdown.is_shutdown() {
                return Ok(false);
            }
            match self.connect().await {
                Ok(()) => return Ok(true),
                Err(e @ AppError::Config(_)) => {
                    error!(error = %e, "Consumer configuration rejected");
                    return Err(e);
                }
                Err(e) => match connect_retry.should_retry(attempt, CONNECT_RETRY_KEY) {
                    RetryDecision::Retry(delay) => {
                        warn!(attempt, error = %e, "Consumer connect failed, retrying");
                        if !pause(delay, shutdown).await {
                            return Ok(false);
                        }
                        attempt += 1;
                    }
                    RetryDecision::GiveUp => {
                        error!(attempts = attempt, error = %e, "Consumer could not connect");
                        return Err(e);
                    }
                },
            }
        }
    }
}

/// Sleep unless shutdown comes first; `false` means shutdown
async fn pause(delay: Duration, shutdown: &mut ShutdownToken) -> bool {
    tokio::select! {
        _ = sleep(delay) => true,
        _ = shutdown.wait() => {
            info!("Shutdown requested while waiting to reconnect");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::consumer::shutdown_channel;
    use crate::application::policy::ThresholdPolicy;
    use crate::domain::{LoanApprovalRequest, QueueSettings};
    use crate::port::broker::mocks::InMemoryBroker;
    use crate::port::decision_sink::mocks::RecordingSink;
    use crate::port::time_provider::SystemTimeProvider;
    use crate::port::BrokerConnector;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    const QUEUE: &str = "supervised_test";

    fn consumer(broker: &InMemoryBroker, sink: Arc<RecordingSink>) -> DecisionConsumer {
        DecisionConsumer::new(
            "memory://",
            QueueSettings::new(QUEUE).with_processing_delay(Duration::ZERO),
            Arc::new(broker.clone()),
            Arc::new(ThresholdPolicy::default()),
            sink,
            Arc::new(SystemTimeProvider),
        )
    }

    async fn publish(broker: &InMemoryBroker, id: i64) {
        let request = LoanApprovalRequest::new(id, 1, "Borrower 1", dec!(1000), 12, Utc::now());
        let channel = broker.connect("memory://").await.unwrap();
        channel.declare_queue(QUEUE, true).await.unwrap();
        channel.publish(QUEUE, &request.to_wire().unwrap(), true).await.unwrap();
        channel.close().await.unwrap();
    }

    async fn wait_for_acks(broker: &InMemoryBroker, expected: usize) {
        for _ in 0..400 {
            if broker.acked_count(QUEUE) >= expected {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {} acks", expected);
    }

    #[tokio::test]
    async fn test_connect_retries_until_broker_answers() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(2);
        let sink = Arc::new(RecordingSink::new());
        let mut consumer = consumer(&broker, sink.clone());
        let (tx, token) = shutdown_channel();

        let retry = RetryPolicy::new(3, Duration::from_millis(1));
        let task = tokio::spawn(async move { consumer.run(&retry, token).await });

        publish(&broker, 1).await;
        wait_for_acks(&broker, 1).await;
        tx.shutdown();

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.acked, 1);
        assert_eq!(sink.decisions().len(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_configured_attempts() {
        let broker = InMemoryBroker::new();
        broker.set_unreachable(true);
        let mut consumer = consumer(&broker, Arc::new(RecordingSink::new()));
        let (_tx, token) = shutdown_channel();

        let err = consumer
            .run(&RetryPolicy::new(2, Duration::from_millis(1)), token)
            .await
            .unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn test_reconnects_after_broker_restart() {
        let broker = InMemoryBroker::new();
        let sink = Arc::new(RecordingSink::new());
        let mut consumer = consumer(&broker, sink.clone());
        let (tx, token) = shutdown_channel();

        let task = tokio::spawn(async move { consumer.run(&RetryPolicy::none(), token).await });

        publish(&broker, 1).await;
        wait_for_acks(&broker, 1).await;

        broker.restart();
        publish(&broker, 2).await;
        wait_for_acks(&broker, 2).await;
        tx.shutdown();

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.acked, 2);
        assert_eq!(sink.decisions().len(), 2);
        assert_eq!(broker.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_ack_is_redelivered_after_reconnect() {
        let broker = InMemoryBroker::new();
        let sink = Arc::new(RecordingSink::new());
        let mut consumer = consumer(&broker, sink.clone());
        let (tx, token) = shutdown_channel();

        broker.fail_next_settles(1);
        let task = tokio::spawn(async move { consumer.run(&RetryPolicy::none(), token).await });

        publish(&broker, 7).await;
        wait_for_acks(&broker, 1).await;
        tx.shutdown();

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.acked, 1);
        // Decided once per delivery: at-least-once
        assert_eq!(sink.decisions().len(), 2);
        assert_eq!(broker.unacked_count(QUEUE), 0);
        assert_eq!(broker.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_prefetch_is_not_retried() {
        let broker = InMemoryBroker::new();
        let mut consumer = DecisionConsumer::new(
            "memory://",
            QueueSettings::new(QUEUE).with_prefetch(0),
            Arc::new(broker.clone()),
            Arc::new(ThresholdPolicy::default()),
            Arc::new(RecordingSink::new()),
            Arc::new(SystemTimeProvider),
        );
        let (_tx, token) = shutdown_channel();

        let retry = RetryPolicy::new(5, Duration::from_secs(30));
        let result = tokio::time::timeout(Duration::from_secs(2), consumer.run(&retry, token))
            .await
            .unwrap();
        assert!(matches!(result, Err(AppError::Config(_))));
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff() {
        let broker = InMemoryBroker::new();
        broker.set_unreachable(true);
        let mut consumer = consumer(&broker, Arc::new(RecordingSink::new()));
        let (tx, token) = shutdown_channel();

        let retry = RetryPolicy::new(10, Duration::from_secs(30));
        let task = tokio::spawn(async move { consumer.run(&retry, token).await });
        sleep(Duration::from_millis(20)).await;
        tx.shutdown();

        let stats = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats, ConsumerStats::default());
    }
}
