// Loanq Infrastructure - AMQP Adapter
// Implements: BrokerConnector against RabbitMQ (or any AMQP 0-9-1 broker)

mod broker;
mod error;

pub use broker::{AmqpBroker, AmqpChannel};
pub use error::map_lapin_error;

/// Address prefixes handled by this adapter
pub const URL_SCHEMES: [&str; 2] = ["amqp://", "amqps://"];
