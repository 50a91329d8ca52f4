// Queue Domain Model

use std::time::Duration;

/// Queue identifier
pub type QueueId = String;

/// Default queue name shared by producer and consumer
pub const DEFAULT_QUEUE_NAME: &str = "loan_approval_queue";

/// Default simulated decision latency (1.5s)
pub const DEFAULT_PROCESSING_DELAY: Duration = Duration::from_millis(1500);

/// Queue configuration shared by both ends of the pipeline
///
/// `durable` and `persistent` must both hold for a request to survive a
/// broker restart. `prefetch` only matters on the consuming side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub name: QueueId,
    pub durable: bool,
    pub persistent: bool,
    pub prefetch: u16,
    pub processing_delay: Duration,
}

impl QueueSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_processing_delay(mut self, delay: Duration) -> Self {
        self.processing_delay = delay;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_QUEUE_NAME.to_string(),
            durable: true,
            persistent: true,
            prefetch: 1,
            processing_delay: DEFAULT_PROCESSING_DELAY,
        }
    }
}
