// Loanq Infrastructure - SQLite Adapter
// Implements: BrokerConnector over a durable single-file work queue

mod broker;
mod connection;
mod migration;
mod recovery;

pub use broker::{
    queue_stats, rejected_payloads, QueueStats, SqliteBroker, SqliteChannel,
    DEFAULT_DELIVERY_LEASE,
};
pub use connection::create_pool;
pub use migration::{run_migrations, SCHEMA_VERSION};
pub use recovery::SqliteRecovery;

// Note: sqlx::Error is mapped to BrokerError by a helper function
// due to Rust's orphan rules (cannot implement From<sqlx::Error> for BrokerError here)

/// Address prefix handled by this adapter
pub const URL_SCHEME: &str = "sqlite:";
