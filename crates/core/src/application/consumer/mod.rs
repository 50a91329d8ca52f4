// Decision Consumer - pulls loan requests off the queue, decides, settles

pub mod constants;
mod panic_guard;
mod shutdown;
mod supervisor;

pub use panic_guard::{execute_guarded, PanicGuardResult};
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};

use crate::application::policy::ApprovalPolicy;
use crate::domain::{LoanApprovalRequest, LoanDecision, QueueSettings};
use crate::error::{AppError, Result};
use crate::port::{
    BrokerChannel, BrokerConnector, BrokerError, DecisionSink, Delivery, TimeProvider,
};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Terminal outcome of one delivery
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    /// Decided, reported and acknowledged
    Acked(LoanDecision),
    /// Negatively acknowledged without requeue (poison message or processing failure)
    Rejected(String),
}

/// Counters for one consuming session
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    pub acked: u64,
    pub rejected: u64,
}

/// Consumes loan approval requests one at a time
///
/// Lifecycle: `connect` -> `start_consuming` (until shutdown) -> `close`.
/// Each instance owns its channel; run several instances against the same
/// queue to scale out.
pub struct DecisionConsumer {
    address: String,
    settings: QueueSettings,
    connector: Arc<dyn BrokerConnector>,
    policy: Arc<dyn ApprovalPolicy>,
    sink: Arc<dyn DecisionSink>,
    time_provider: Arc<dyn TimeProvider>,
    channel: Option<Box<dyn BrokerChannel>>,
}

impl DecisionConsumer {
    pub fn new(
        address: impl Into<String>,
        settings: QueueSettings,
        connector: Arc<dyn BrokerConnector>,
        policy: Arc<dyn ApprovalPolicy>,
        sink: Arc<dyn DecisionSink>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            address: address.into(),
            settings,
            connector,
            policy,
            sink,
            time_provider,
            channel: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Acquire a channel, declare the queue and apply the prefetch limit
    ///
    /// # Errors
    /// - AppError::Config if prefetch is 0 (unbounded in-flight deliveries)
    /// - AppError::Broker(Connection) if the broker is unreachable
    /// - AppError::InvalidState if already connected
    pub async fn connect(&mut self) -> Result<()> {
        if self.channel.is_some() {
            return Err(AppError::InvalidState("consumer already connected".to_string()));
        }
        if self.settings.prefetch == 0 {
            return Err(AppError::Config("consumer prefetch must be at least 1".to_string()));
        }

        info!(queue = %self.settings.name, "Connecting consumer to broker...");
        let channel = self.connector.connect(&self.address).await.map_err(|e| {
            error!(error = %e, "Consumer connection error");
            e
        })?;

        if let Err(e) = Self::prepare(channel.as_ref(), &self.settings).await {
            error!(error = %e, "Consumer channel setup failed");
            if let Err(close_err) = channel.close().await {
                warn!(error = %close_err, "Failed to close half-open consumer channel");
            }
            return Err(e.into());
        }

        self.channel = Some(channel);
        info!(
            queue = %self.settings.name,
            prefetch = self.settings.prefetch,
            "Consumer connected"
        );
        Ok(())
    }

    async fn prepare(
        channel: &dyn BrokerChannel,
        settings: &QueueSettings,
    ) -> std::result::Result<(), BrokerError> {
        channel.declare_queue(&settings.name, settings.durable).await?;
        channel.set_prefetch(settings.prefetch).await
    }

    /// Consume until the shutdown token fires or the broker ends the stream
    ///
    /// A message that is already in flight when shutdown is requested is
    /// finished and acknowledged before returning. A failed ack or nack ends
    /// the session with that error: the delivery is still held by this
    /// channel, and only closing it hands the message back.
    pub async fn start_consuming(&self, mut shutdown: ShutdownToken) -> Result<ConsumerStats> {
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| AppError::InvalidState("consumer not connected".to_string()))?;

        let mut stream = channel.consume(&self.settings.name).await?;
        let mut stats = ConsumerStats::default();
        info!(queue = %self.settings.name, "Waiting for loan approval requests...");

        loop {
            if shutdown.is_shutdown() {
                info!("Consumer shutting down");
                break;
            }

            let next = tokio::select! {
                next = stream.next() => next,
                _ = shutdown.wait() => {
                    info!("Consumer interrupted while idle");
                    break;
                }
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!(error = %e, "Delivery stream failed");
                    return Err(e.into());
                }
                None => {
                    warn!(queue = %self.settings.name, "Delivery stream closed by broker");
                    break;
                }
            };

            match self.handle_delivery(delivery).await {
                Ok(MessageOutcome::Acked(_)) => stats.acked += 1,
                Ok(MessageOutcome::Rejected(_)) => stats.rejected += 1,
                Err(e) => {
                    error!(error = %e, "Failed to settle delivery");
                    return Err(e);
                }
            }
        }

        info!(acked = stats.acked, rejected = stats.rejected, "Consumer stopped");
        Ok(stats)
    }

    /// Decode, decide, report and settle one delivery
    ///
    /// Errors only when the settle call itself fails.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<MessageOutcome> {
        debug!(
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            "Received delivery"
        );

        let request = match LoanApprovalRequest::from_wire(&delivery.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Undecodable message, rejecting without requeue"
                );
                delivery.nack(false).await?;
                return Ok(MessageOutcome::Rejected(format!("decode failed: {}", e)));
            }
        };

        if !self.settings.processing_delay.is_zero() {
            sleep(self.settings.processing_delay).await;
        }

        match self.process(request).await {
            Ok(decision) => {
                delivery.ack().await?;
                Ok(MessageOutcome::Acked(decision))
            }
            Err(e) => {
                error!(error = %e, "Processing failed, rejecting without requeue");
                delivery.nack(false).await?;
                Ok(MessageOutcome::Rejected(e.to_string()))
            }
        }
    }

    /// Run the approval policy and report the decision
    pub async fn process(&self, request: LoanApprovalRequest) -> Result<LoanDecision> {
        info!(
            loan_id = request.id,
            borrower = %request.borrower_label,
            amount = %request.amount,
            term_months = request.term,
            "Processing loan request"
        );

        let verdict = match execute_guarded(|| self.policy.decide(&request)) {
            PanicGuardResult::Success(verdict) => verdict?,
            PanicGuardResult::Panicked(msg) => {
                return Err(AppError::Processing(format!("approval policy panicked: {}", msg)));
            }
        };

        let decision = LoanDecision::new(request, verdict, self.time_provider.now());
        self.sink.report(&decision).await?;
        Ok(decision)
    }

    /// Release channel and connection. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Error closing consumer connection");
            }
            info!("Consumer connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::policy::ThresholdPolicy;
    use crate::domain::{Outcome, Verdict};
    use crate::port::broker::mocks::InMemoryBroker;
    use crate::port::decision_sink::mocks::RecordingSink;
    use crate::port::time_provider::SystemTimeProvider;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    const QUEUE: &str = "loans_test";

    fn settings() -> QueueSettings {
        QueueSettings::new(QUEUE).with_processing_delay(Duration::ZERO)
    }

    fn consumer(broker: &InMemoryBroker, sink: Arc<RecordingSink>) -> DecisionConsumer {
        DecisionConsumer::new(
            "memory://",
            settings(),
            Arc::new(broker.clone()),
            Arc::new(ThresholdPolicy::default()),
            sink,
            Arc::new(SystemTimeProvider),
        )
    }

    async fn publish(broker: &InMemoryBroker, payload: &[u8]) {
        let channel = broker.connect("memory://").await.unwrap();
        channel.declare_queue(QUEUE, true).await.unwrap();
        channel.publish(QUEUE, payload, true).await.unwrap();
        channel.close().await.unwrap();
    }

    fn request(id: i64, amount: Decimal) -> LoanApprovalRequest {
        LoanApprovalRequest::new(id, 1, "Borrower 1", amount, 12, Utc::now())
    }

    async fn wait_for_settled(broker: &InMemoryBroker, expected: usize) {
        for _ in 0..200 {
            if broker.acked_count(QUEUE) + broker.dead_lettered(QUEUE).len() >= expected {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {} settled messages", expected);
    }

    struct PanickingPolicy;

    impl ApprovalPolicy for PanickingPolicy {
        fn decide(&self, _request: &LoanApprovalRequest) -> Result<Verdict> {
            panic!("policy exploded")
        }
    }

    #[tokio::test]
    async fn test_connect_twice_is_an_error() {
        let broker = InMemoryBroker::new();
        let mut consumer = consumer(&broker, Arc::new(RecordingSink::new()));

        consumer.connect().await.unwrap();
        assert!(matches!(consumer.connect().await, Err(AppError::InvalidState(_))));
        consumer.close().await;
        consumer.close().await;
        assert_eq!(broker.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_is_connection_error() {
        let broker = InMemoryBroker::new();
        broker.set_unreachable(true);
        let mut consumer = consumer(&broker, Arc::new(RecordingSink::new()));

        let err = consumer.connect().await.unwrap_err();
        assert!(err.is_connection());
        assert!(!consumer.is_connected());
    }

    #[tokio::test]
    async fn test_zero_prefetch_is_refused() {
        let broker = InMemoryBroker::new();
        let mut consumer = DecisionConsumer::new(
            "memory://",
            settings().with_prefetch(0),
            Arc::new(broker.clone()),
            Arc::new(ThresholdPolicy::default()),
            Arc::new(RecordingSink::new()),
            Arc::new(SystemTimeProvider),
        );

        assert!(matches!(consumer.connect().await, Err(AppError::Config(_))));
        assert!(!consumer.is_connected());
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_settle_ends_session() {
        let broker = InMemoryBroker::new();
        let sink = Arc::new(RecordingSink::new());
        let mut consumer = consumer(&broker, sink.clone());
        consumer.connect().await.unwrap();
        publish(&broker, &request(6, dec!(1000)).to_wire().unwrap()).await;
        broker.fail_next_settles(1);

        let (_tx, token) = shutdown_channel();
        let result = tokio::time::timeout(Duration::from_secs(2), consumer.start_consuming(token))
            .await
            .expect("session should end on settle failure");
        assert!(matches!(result, Err(AppError::Broker(BrokerError::Channel(_)))));

        // Still held by this channel until close hands it back
        assert_eq!(broker.unacked_count(QUEUE), 1);
        consumer.close().await;
        assert_eq!(broker.unacked_count(QUEUE), 0);
        assert_eq!(broker.ready_count(QUEUE), 1);
        assert_eq!(sink.decisions().len(), 1);
    }

    #[tokio::test]
    async fn test_start_consuming_requires_connect() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker, Arc::new(RecordingSink::new()));
        let (_tx, token) = shutdown_channel();

        assert!(matches!(
            consumer.start_consuming(token).await,
            Err(AppError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_decisions_are_acked() {
        let broker = InMemoryBroker::new();
        let sink = Arc::new(RecordingSink::new());
        let mut consumer = consumer(&broker, sink.clone());
        consumer.connect().await.unwrap();

        publish(&broker, &request(1, dec!(30000)).to_wire().unwrap()).await;
        publish(&broker, &request(2, dec!(75000)).to_wire().unwrap()).await;

        let (tx, token) = shutdown_channel();
        let run = tokio::spawn(async move {
            let stats = consumer.start_consuming(token).await.unwrap();
            consumer.close().await;
            stats
        });

        wait_for_settled(&broker, 2).await;
        tx.shutdown();
        let stats = run.await.unwrap();

        assert_eq!(stats, ConsumerStats { acked: 2, rejected: 0 });
        let outcomes: Vec<Outcome> = sink.decisions().iter().map(|d| d.outcome).collect();
        assert_eq!(outcomes, vec![Outcome::Approved, Outcome::Rejected]);
        assert_eq!(broker.unacked_count(QUEUE), 0);
        assert_eq!(broker.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_poison_message_is_dead_lettered_not_requeued() {
        let broker = InMemoryBroker::new();
        let sink = Arc::new(RecordingSink::new());
        let mut consumer = consumer(&broker, sink.clone());
        consumer.connect().await.unwrap();

        publish(&broker, b"{not json").await;
        publish(&broker, &request(3, dec!(45000)).to_wire().unwrap()).await;

        let (tx, token) = shutdown_channel();
        let run = tokio::spawn(async move {
            let stats = consumer.start_consuming(token).await.unwrap();
            consumer.close().await;
            stats
        });

        wait_for_settled(&broker, 2).await;
        tx.shutdown();
        let stats = run.await.unwrap();

        assert_eq!(stats, ConsumerStats { acked: 1, rejected: 1 });
        assert_eq!(broker.dead_lettered(QUEUE), vec![b"{not json".to_vec()]);
        assert_eq!(broker.ready_count(QUEUE), 0);
        assert_eq!(sink.decisions().len(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_rejects_message() {
        let broker = InMemoryBroker::new();
        let mut consumer = consumer(&broker, Arc::new(RecordingSink::failing_on(9)));
        consumer.connect().await.unwrap();
        publish(&broker, &request(9, dec!(1000)).to_wire().unwrap()).await;

        let channel = broker.connect("memory://").await.unwrap();
        channel.set_prefetch(1).await.unwrap();
        let mut stream = channel.consume(QUEUE).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        let outcome = consumer.handle_delivery(delivery).await.unwrap();
        assert!(
            matches!(outcome, MessageOutcome::Rejected(reason) if reason.contains("sink refused"))
        );
        assert_eq!(broker.dead_lettered(QUEUE).len(), 1);
    }

    #[tokio::test]
    async fn test_policy_panic_is_contained() {
        let broker = InMemoryBroker::new();
        let consumer = DecisionConsumer::new(
            "memory://",
            settings(),
            Arc::new(broker.clone()),
            Arc::new(PanickingPolicy),
            Arc::new(RecordingSink::new()),
            Arc::new(SystemTimeProvider),
        );

        let err = consumer.process(request(4, dec!(10))).await.unwrap_err();
        assert!(matches!(err, AppError::Processing(msg) if msg.contains("policy exploded")));
    }

    #[tokio::test]
    async fn test_in_flight_message_finishes_before_shutdown() {
        let broker = InMemoryBroker::new();
        let sink = Arc::new(RecordingSink::new());
        let mut consumer = DecisionConsumer::new(
            "memory://",
            QueueSettings::new(QUEUE).with_processing_delay(Duration::from_millis(100)),
            Arc::new(broker.clone()),
            Arc::new(ThresholdPolicy::default()),
            sink.clone(),
            Arc::new(SystemTimeProvider),
        );
        consumer.connect().await.unwrap();
        publish(&broker, &request(5, dec!(20000)).to_wire().unwrap()).await;

        let (tx, token) = shutdown_channel();
        let run = tokio::spawn(async move {
            let stats = consumer.start_consuming(token).await.unwrap();
            consumer.close().await;
            stats
        });

        // Let the consumer pick the message up and enter the processing delay
        sleep(Duration::from_millis(30)).await;
        assert!(sink.decisions().is_empty());
        tx.shutdown();

        let stats = run.await.unwrap();
        assert_eq!(stats.acked, 1);
        assert_eq!(broker.acked_count(QUEUE), 1);
        assert_eq!(sink.decisions()[0].outcome, Outcome::Approved);
    }
}
