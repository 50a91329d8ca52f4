// ID Provider Port (for deterministic testing)

use crate::domain::LoanId;
use std::sync::atomic::{AtomicI64, Ordering};

/// ID provider interface (allows deterministic IDs in tests)
pub trait IdProvider: Send + Sync {
    /// Generate a new unique loan ID
    fn next_id(&self) -> LoanId;
}

/// Monotonic sequence starting at a given value
pub struct SequenceIdProvider {
    next: AtomicI64,
}

impl SequenceIdProvider {
    pub fn starting_at(first: LoanId) -> Self {
        Self {
            next: AtomicI64::new(first),
        }
    }
}

impl IdProvider for SequenceIdProvider {
    fn next_id(&self) -> LoanId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

/// Epoch-millisecond seeded sequence (production)
///
/// Ids stay unique across daemon restarts as long as fewer than one id per
/// millisecond is issued on average.
pub struct EpochIdProvider {
    inner: SequenceIdProvider,
}

impl EpochIdProvider {
    pub fn new() -> Self {
        Self {
            inner: SequenceIdProvider::starting_at(chrono::Utc::now().timestamp_millis()),
        }
    }
}

impl Default for EpochIdProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl IdProvider for EpochIdProvider {
    fn next_id(&self) -> LoanId {
        self.inner.next_id()
    }
}
