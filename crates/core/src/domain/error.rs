// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid amount: {0} (must be greater than 0)")]
    InvalidAmount(String),

    #[error("Invalid term: {0} months (must be between 1 and 60)")]
    InvalidTerm(u32),

    #[error("Invalid borrower id: {0}")]
    InvalidBorrower(i64),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
