//! Broker selection by URL scheme

use anyhow::{bail, Result};
use loanq_core::port::{BrokerConnector, TimeProvider};
use loanq_infra_amqp::AmqpBroker;
use loanq_infra_sqlite::SqliteBroker;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Sqlite,
    Amqp,
}

pub fn broker_kind(url: &str) -> Result<BrokerKind> {
    if url.starts_with(loanq_infra_sqlite::URL_SCHEME) {
        Ok(BrokerKind::Sqlite)
    } else if loanq_infra_amqp::URL_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
        Ok(BrokerKind::Amqp)
    } else {
        bail!("Unsupported broker URL '{}' (expected sqlite: or amqp://)", url)
    }
}

pub fn connector_for(
    url: &str,
    time_provider: Arc<dyn TimeProvider>,
    delivery_lease: Duration,
) -> Result<Arc<dyn BrokerConnector>> {
    Ok(match broker_kind(url)? {
        BrokerKind::Sqlite => {
            Arc::new(SqliteBroker::new(time_provider).with_delivery_lease(delivery_lease))
        }
        BrokerKind::Amqp => Arc::new(AmqpBroker::new()),
    })
}

/// Make sure the directory holding a `sqlite:` database exists
pub fn ensure_sqlite_parent(url: &str) -> Result<()> {
    let path = url
        .trim_start_matches(loanq_infra_sqlite::URL_SCHEME)
        .trim_start_matches("//");
    if path.starts_with(":memory:") {
        return Ok(());
    }
    let path = path.split('?').next().unwrap_or(path);
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
