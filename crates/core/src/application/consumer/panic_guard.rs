// Panic isolation for policy evaluation
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

/// Result of a panic-guarded execution
#[derive(Debug)]
pub enum PanicGuardResult<T> {
    /// Execution completed
    Success(T),
    /// Execution panicked
    Panicked(String),
}

/// Execute a closure with panic isolation
///
/// A panicking policy must cost one message, not the consumer process.
///
/// # Example
/// ```text
/// match execute_guarded(|| policy.decide(&request)) {
///     PanicGuardResult::Success(verdict) => { /* ack */ }
///     PanicGuardResult::Panicked(msg) => { /* nack without requeue */ }
/// }
/// ```
pub fn execute_guarded<F, T>(f: F) -> PanicGuardResult<T>
where
    F: FnOnce() -> T,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => PanicGuardResult::Success(result),
        Err(panic_info) => {
            let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };

            error!(panic_msg = %panic_msg, "Approval policy panicked");
            PanicGuardResult::Panicked(panic_msg)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_passes_through() {
        assert!(matches!(execute_guarded(|| 42), PanicGuardResult::Success(42)));
    }

    #[test]
    fn test_panic_is_captured() {
        let result: PanicGuardResult<()> = execute_guarded(|| panic!("credit bureau down"));
        match result {
            PanicGuardResult::Panicked(msg) => assert_eq!(msg, "credit bureau down"),
            PanicGuardResult::Success(_) => panic!("expected panic to be captured"),
        }
    }
}
