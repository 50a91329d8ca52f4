//! RPC Method Handlers
//!
//! Implements the business logic for each JSON-RPC method.

use crate::error::{to_rpc_error, validation_error};
use crate::types::{HealthResponse, SubmitLoanRequest, SubmitLoanResponse};
use jsonrpsee::types::ErrorObjectOwned;
use loanq_core::application::{LoanSubmissionService, SubmissionStatus, SubmitLoan};
use std::sync::Arc;
use tracing::info;

const MSG_SUBMITTED: &str = "Loan created and submitted for approval";
const MSG_QUEUE_UNAVAILABLE: &str = "Loan created (approval queue unavailable)";
const WARN_MANUAL_APPROVAL: &str = "Loan will require manual approval";

/// RPC Handler with injected dependencies
pub struct RpcHandler {
    service: Arc<LoanSubmissionService>,
    queue: String,
    start_time: std::time::Instant,
}

impl RpcHandler {
    pub fn new(service: Arc<LoanSubmissionService>, queue: impl Into<String>) -> Self {
        Self {
            service,
            queue: queue.into(),
            start_time: std::time::Instant::now(),
        }
    }

    /// loans.submit.v1
    pub async fn submit(
        &self,
        params: SubmitLoanRequest,
    ) -> Result<SubmitLoanResponse, ErrorObjectOwned> {
        let (Some(borrower_id), Some(amount), Some(term)) =
            (params.borrower_id, params.amount, params.term)
        else {
            return Err(validation_error("borrowerId, amount, and term are required"));
        };

        let receipt = self
            .service
            .submit(SubmitLoan {
                borrower_id,
                amount,
                term,
            })
            .await
            .map_err(to_rpc_error)?;

        info!(loan_id = receipt.loan_id, status = %receipt.status, "Loan submission handled");

        let (message, warning) = match receipt.status {
            SubmissionStatus::SubmittedForApproval => (MSG_SUBMITTED, None),
            SubmissionStatus::ManualApprovalRequired => {
                (MSG_QUEUE_UNAVAILABLE, Some(WARN_MANUAL_APPROVAL.to_string()))
            }
        };

        Ok(SubmitLoanResponse {
            loan_id: receipt.loan_id,
            status: receipt.status.to_string(),
            message: message.to_string(),
            warning,
            submitted_at: receipt.submitted_at.to_rfc3339(),
        })
    }

    /// system.health.v1
    pub async fn health(&self) -> Result<HealthResponse, ErrorObjectOwned> {
        Ok(HealthResponse {
            version: loanq_core::VERSION.to_string(),
            queue: self.queue.clone(),
            queue_available: self.service.queue_available(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        })
    }
}
