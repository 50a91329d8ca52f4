// Loan Decision Domain Model

use super::loan::LoanApprovalRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Approval outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Approved,
    Rejected,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Approved => write!(f, "APPROVED"),
            Outcome::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Outcome plus the human-readable reason produced by a policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub outcome: Outcome,
    pub reason: String,
}

impl Verdict {
    pub fn new(outcome: Outcome, reason: impl Into<String>) -> Self {
        Self {
            outcome,
            reason: reason.into(),
        }
    }
}

/// Result of evaluating one request. Computed per message, never persisted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanDecision {
    #[serde(flatten)]
    pub request: LoanApprovalRequest,
    #[serde(rename = "decision")]
    pub outcome: Outcome,
    pub reason: String,
    pub processed_at: DateTime<Utc>,
}

impl LoanDecision {
    pub fn new(
        request: LoanApprovalRequest,
        verdict: Verdict,
        processed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            request,
            outcome: verdict.outcome,
            reason: verdict.reason,
            processed_at,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.outcome == Outcome::Approved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_decision_wire_augments_request() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let request = LoanApprovalRequest::new(1, 2, "Borrower 2", dec!(45000), 18, at);
        let decision = LoanDecision::new(
            request,
            Verdict::new(Outcome::Approved, "Amount within approval limit"),
            at,
        );

        let value = serde_json::to_value(&decision).unwrap();
        assert_eq!(value["decision"], "APPROVED");
        assert_eq!(value["reason"], "Amount within approval limit");
        assert_eq!(value["processedAt"], "2024-05-01T10:00:00Z");
        assert_eq!(value["borrower"], "Borrower 2");
        assert_eq!(value["id"], 1);
    }
}
