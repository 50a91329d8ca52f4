// lapin::Error -> BrokerError

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use loanq_core::port::BrokerError;

/// Map a client error, naming the queue involved when the broker reports one
pub fn map_lapin_error(err: lapin::Error, queue: &str) -> BrokerError {
    match &err {
        lapin::Error::IOError(_) => BrokerError::Connection(err.to_string()),
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            BrokerError::Closed
        }
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                BrokerError::Precondition(format!("queue '{}': {}", queue, amqp))
            }
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => {
                BrokerError::QueueNotFound(queue.to_string())
            }
            _ => BrokerError::Channel(err.to_string()),
        },
        _ => BrokerError::Channel(err.to_string()),
    }
}
