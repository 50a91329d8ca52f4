// Loan Submission Use Case
// The upstream contract: take {borrowerId, amount, term}, enqueue for
// approval, and tell the caller whether the queue took it.

use crate::application::producer::RequestProducer;
use crate::domain::{BorrowerId, LoanApprovalRequest, LoanId};
use crate::error::{AppError, Result};
use crate::port::{IdProvider, TimeProvider};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Submission input
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitLoan {
    pub borrower_id: BorrowerId,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub term: u32,
}

/// How the loan will be approved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    /// Enqueued; the decision happens asynchronously
    SubmittedForApproval,
    /// Queue unavailable; someone has to approve this by hand
    ManualApprovalRequired,
}

impl std::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmissionStatus::SubmittedForApproval => write!(f, "SUBMITTED_FOR_APPROVAL"),
            SubmissionStatus::ManualApprovalRequired => write!(f, "MANUAL_APPROVAL_REQUIRED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionReceipt {
    pub loan_id: LoanId,
    pub status: SubmissionStatus,
    pub submitted_at: chrono::DateTime<chrono::Utc>,
}

/// Submission service
///
/// Holds an optional producer: `None` means the queue could not be reached
/// at startup, and every submission degrades to manual approval.
pub struct LoanSubmissionService {
    producer: Option<Arc<RequestProducer>>,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
}

impl LoanSubmissionService {
    pub fn new(
        producer: Option<Arc<RequestProducer>>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            producer,
            id_provider,
            time_provider,
        }
    }

    /// Connect a producer, or degrade to no producer when the broker is down
    pub async fn connect_producer(producer: RequestProducer) -> Option<Arc<RequestProducer>> {
        match producer.connect().await {
            Ok(()) => {
                info!(queue = %producer.queue(), "Submission service connected to message queue");
                Some(Arc::new(producer))
            }
            Err(e) => {
                warn!(error = %e, "Failed to initialize producer, continuing without queue");
                None
            }
        }
    }

    pub fn queue_available(&self) -> bool {
        self.producer.is_some()
    }

    /// Validate, enqueue, and report how approval will happen
    ///
    /// # Errors
    /// - AppError::Validation for bad input. Queue failures are not errors.
    pub async fn submit(&self, req: SubmitLoan) -> Result<SubmissionReceipt> {
        let request = LoanApprovalRequest::new(
            self.id_provider.next_id(),
            req.borrower_id,
            format!("Borrower {}", req.borrower_id),
            req.amount,
            req.term,
            self.time_provider.now(),
        );
        request
            .validate()
            .map_err(|e| AppError::Validation(e.to_string()))?;

        let queued = match &self.producer {
            Some(producer) => producer.submit(&request).await,
            None => {
                warn!(loan_id = request.id, "Approval queue unavailable");
                false
            }
        };

        let status = if queued {
            SubmissionStatus::SubmittedForApproval
        } else {
            warn!(loan_id = request.id, "Loan requires manual approval");
            SubmissionStatus::ManualApprovalRequired
        };

        Ok(SubmissionReceipt {
            loan_id: request.id,
            status,
            submitted_at: request.submitted_at,
        })
    }
}
