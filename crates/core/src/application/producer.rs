// Request Producer - hands loan approval requests to the durable queue

use crate::application::retry::{RetryDecision, RetryPolicy};
use crate::domain::{LoanApprovalRequest, QueueSettings};
use crate::error::{AppError, Result};
use crate::port::{BrokerChannel, BrokerConnector};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Publishes requests as persistent messages
///
/// Owns one channel behind a mutex so a single instance can be shared by
/// concurrent request handlers. There is no reply path: publishing succeeds
/// once the broker accepts the message.
pub struct RequestProducer {
    address: String,
    settings: QueueSettings,
    connector: Arc<dyn BrokerConnector>,
    retry_policy: RetryPolicy,
    channel: Mutex<Option<Box<dyn BrokerChannel>>>,
}

impl RequestProducer {
    pub fn new(
        address: impl Into<String>,
        settings: QueueSettings,
        connector: Arc<dyn BrokerConnector>,
    ) -> Self {
        Self {
            address: address.into(),
            settings,
            connector,
            retry_policy: RetryPolicy::none(),
            channel: Mutex::new(None),
        }
    }

    /// Publish attempts per `submit` (default: one)
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn queue(&self) -> &str {
        &self.settings.name
    }

    pub async fn is_connected(&self) -> bool {
        self.channel.lock().await.is_some()
    }

    /// Acquire a channel and declare the target queue
    ///
    /// # Errors
    /// - AppError::Broker(Connection) if the broker is unreachable; callers
    ///   should degrade (manual approval) rather than fail
    /// - AppError::InvalidState if already connected
    pub async fn connect(&self) -> Result<()> {
        let mut slot = self.channel.lock().await;
        if slot.is_some() {
            return Err(AppError::InvalidState("producer already connected".to_string()));
        }

        info!(queue = %self.settings.name, "Connecting producer to broker...");
        let channel = self.connector.connect(&self.address).await.map_err(|e| {
            error!(error = %e, "Producer connection error");
            e
        })?;

        if let Err(e) = channel
            .declare_queue(&self.settings.name, self.settings.durable)
            .await
        {
            error!(error = %e, "Producer queue declaration failed");
            if let Err(close_err) = channel.close().await {
                warn!(error = %close_err, "Failed to close half-open producer channel");
            }
            return Err(e.into());
        }

        *slot = Some(channel);
        info!(queue = %self.settings.name, "Producer connected, queue ready");
        Ok(())
    }

    /// Serialize and publish; `false` on any failure, never an error
    pub async fn submit(&self, request: &LoanApprovalRequest) -> bool {
        match self.publish(request).await {
            Ok(()) => {
                info!(
                    loan_id = request.id,
                    borrower = %request.borrower_label,
                    amount = %request.amount,
                    term_months = request.term,
                    "Loan request submitted"
                );
                true
            }
            Err(e) => {
                error!(loan_id = request.id, error = %e, "Error sending loan request");
                false
            }
        }
    }

    /// Serialize and publish, reporting why it failed
    pub async fn publish(&self, request: &LoanApprovalRequest) -> Result<()> {
        let payload = request.to_wire()?;
        let retry_key = request.id.to_string();
        let mut attempt = 1;

        loop {
            let outcome = {
                let slot = self.channel.lock().await;
                let channel = slot
                    .as_ref()
                    .ok_or_else(|| AppError::InvalidState("producer not connected".to_string()))?;
                channel
                    .publish(&self.settings.name, &payload, self.settings.persistent)
                    .await
            };

            match outcome {
                Ok(()) => return Ok(()),
                Err(e) => match self.retry_policy.should_retry(attempt, &retry_key) {
                    RetryDecision::Retry(delay) => {
                        warn!(
                            loan_id = request.id,
                            attempt,
                            error = %e,
                            "Publish failed, retrying"
                        );
                        sleep(delay).await;
                        attempt += 1;
                    }
                    RetryDecision::GiveUp => return Err(e.into()),
                },
            }
        }
    }

    /// Release channel and connection. Safe to call repeatedly.
    pub async fn close(&self) {
        if let Some(channel) = self.channel.lock().await.take() {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Error closing producer connection");
            }
            info!("Producer connection closed");
        }
    }
}
