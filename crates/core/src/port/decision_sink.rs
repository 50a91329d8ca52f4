// Decision Sink Port
// Where the consumer reports a finished decision. The pipeline has no reply
// path to the submitter, so the default sink only logs.

use crate::domain::LoanDecision;
use crate::error::Result;
use async_trait::async_trait;
use tracing::info;

#[async_trait]
pub trait DecisionSink: Send + Sync {
    /// Report a decision. An error counts as a processing failure for the message.
    async fn report(&self, decision: &LoanDecision) -> Result<()>;
}

/// Structured log line per decision (production default)
pub struct LogDecisionSink;

#[async_trait]
impl DecisionSink for LogDecisionSink {
    async fn report(&self, decision: &LoanDecision) -> Result<()> {
        info!(
            loan_id = decision.request.id,
            borrower_id = decision.request.borrower_id,
            borrower = %decision.request.borrower_label,
            amount = %decision.request.amount,
            term_months = decision.request.term,
            submitted_at = %decision.request.submitted_at.to_rfc3339(),
            decision = %decision.outcome,
            reason = %decision.reason,
            processed_at = %decision.processed_at.to_rfc3339(),
            "Loan decision"
        );
        Ok(())
    }
}

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::sync::Mutex;

    /// Keeps every reported decision; optionally fails on a given loan id
    #[derive(Default)]
    pub struct RecordingSink {
        decisions: Mutex<Vec<LoanDecision>>,
        fail_on: Option<crate::domain::LoanId>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing_on(loan_id: crate::domain::LoanId) -> Self {
            Self {
                decisions: Mutex::new(Vec::new()),
                fail_on: Some(loan_id),
            }
        }

        pub fn decisions(&self) -> Vec<LoanDecision> {
            self.decisions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DecisionSink for RecordingSink {
        async fn report(&self, decision: &LoanDecision) -> Result<()> {
            if self.fail_on == Some(decision.request.id) {
                return Err(AppError::Processing(format!(
                    "sink refused loan {}",
                    decision.request.id
                )));
            }
            self.decisions.lock().unwrap().push(decision.clone());
            Ok(())
        }
    }
}
