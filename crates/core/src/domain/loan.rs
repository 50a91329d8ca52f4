// Loan Approval Request - the unit of work carried over the queue

use super::error::{DomainError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Loan ID (caller-assigned, doubles as the correlation id)
pub type LoanId = i64;

/// Borrower ID (opaque reference to an external borrower record)
pub type BorrowerId = i64;

/// Shortest accepted loan term in months
pub const MIN_TERM_MONTHS: u32 = 1;

/// Longest accepted loan term in months
pub const MAX_TERM_MONTHS: u32 = 60;

/// A request for an approval decision.
///
/// Serialized as the queue wire message:
///
/// ```text
/// { "id": 7, "borrowerId": 3, "borrower": "Borrower 3",
///   "amount": 30000, "term": 12, "timestamp": "2024-05-01T10:00:00Z" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanApprovalRequest {
    pub id: LoanId,
    pub borrower_id: BorrowerId,
    #[serde(rename = "borrower")]
    pub borrower_label: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub term: u32,
    #[serde(rename = "timestamp")]
    pub submitted_at: DateTime<Utc>,
}

impl LoanApprovalRequest {
    /// Create a new request
    ///
    /// # Arguments
    ///
    /// * `id` - Loan id (injected, never generated here)
    /// * `borrower_id` - External borrower reference
    /// * `borrower_label` - Display name for logs
    /// * `amount` - Requested principal
    /// * `term` - Term in months
    /// * `submitted_at` - Enqueue timestamp (injected, not system time)
    pub fn new(
        id: LoanId,
        borrower_id: BorrowerId,
        borrower_label: impl Into<String>,
        amount: Decimal,
        term: u32,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            borrower_id,
            borrower_label: borrower_label.into(),
            amount,
            term,
            submitted_at,
        }
    }

    /// Check the request against the intake rules
    pub fn validate(&self) -> Result<()> {
        if self.borrower_id <= 0 {
            return Err(DomainError::InvalidBorrower(self.borrower_id));
        }
        if self.amount <= Decimal::ZERO {
            return Err(DomainError::InvalidAmount(self.amount.to_string()));
        }
        if !(MIN_TERM_MONTHS..=MAX_TERM_MONTHS).contains(&self.term) {
            return Err(DomainError::InvalidTerm(self.term));
        }
        Ok(())
    }

    /// Encode into the queue wire format
    pub fn to_wire(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode from the queue wire format
    pub fn from_wire(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
