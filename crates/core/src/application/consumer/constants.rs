// Pipeline constants (no magic values)
use std::time::Duration;

/// Unacknowledged deliveries per consumer: one message at a time
pub const DEFAULT_PREFETCH: u16 = 1;

/// Sleep between connection attempts when no retry policy delay applies (1s)
pub const ERROR_RECOVERY_SLEEP_DURATION: Duration = Duration::from_secs(1);

/// Default retry base delay (500ms)
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on how long a graceful shutdown waits for the consumer task (5s)
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
