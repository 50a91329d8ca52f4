// Domain Layer - Pure business logic and entities

pub mod decision;
pub mod error;
pub mod loan;
pub mod queue;

// Re-exports
pub use decision::{LoanDecision, Outcome, Verdict};
pub use error::DomainError;
pub use loan::{BorrowerId, LoanApprovalRequest, LoanId, MAX_TERM_MONTHS, MIN_TERM_MONTHS};
pub use queue::{QueueId, QueueSettings, DEFAULT_QUEUE_NAME};
