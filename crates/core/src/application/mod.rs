// Application Layer - Use Cases of the approval pipeline

pub mod consumer;
pub mod policy;
pub mod producer;
pub mod retry;
pub mod submission;

// Re-exports
pub use consumer::{
    shutdown_channel, ConsumerStats, DecisionConsumer, MessageOutcome, ShutdownSender,
    ShutdownToken,
};
pub use policy::{ApprovalPolicy, ThresholdPolicy, APPROVAL_THRESHOLD};
pub use producer::RequestProducer;
pub use retry::{RetryDecision, RetryPolicy};
pub use submission::{LoanSubmissionService, SubmissionReceipt, SubmissionStatus, SubmitLoan};
