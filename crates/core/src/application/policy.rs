// Approval Policy
// Pure decision rules, isolated from transport so they can be swapped or
// tested with literal inputs.

use crate::domain::{LoanApprovalRequest, Outcome, Verdict};
use crate::error::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Largest amount approved without further review
pub const APPROVAL_THRESHOLD: Decimal = dec!(50000);

/// Reason attached to approvals
pub const REASON_WITHIN_LIMIT: &str = "Amount within approval limit";

/// Decision policy interface
///
/// Fallible so that policies backed by external checks can report a
/// processing failure; the consumer nacks the message in that case.
pub trait ApprovalPolicy: Send + Sync {
    fn decide(&self, request: &LoanApprovalRequest) -> Result<Verdict>;
}

/// Single-threshold rule: approve when `amount <= threshold`
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    threshold: Decimal,
}

impl ThresholdPolicy {
    pub fn new(threshold: Decimal) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> Decimal {
        self.threshold
    }

    /// Infallible form of [`ApprovalPolicy::decide`]
    pub fn verdict(&self, request: &LoanApprovalRequest) -> Verdict {
        if request.amount <= self.threshold {
            Verdict::new(Outcome::Approved, REASON_WITHIN_LIMIT)
        } else {
            Verdict::new(
                Outcome::Rejected,
                format!("Amount exceeds approval threshold ({})", self.threshold),
            )
        }
    }
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self::new(APPROVAL_THRESHOLD)
    }
}

impl ApprovalPolicy for ThresholdPolicy {
    fn decide(&self, request: &LoanApprovalRequest) -> Result<Verdict> {
        Ok(self.verdict(request))
    }
}
