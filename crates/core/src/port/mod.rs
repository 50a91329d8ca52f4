// Port Layer - Interfaces for external dependencies

pub mod broker;
pub mod decision_sink;
pub mod id_provider; // For deterministic testing
pub mod time_provider;

// Re-exports
pub use broker::{Acker, BrokerChannel, BrokerConnector, BrokerError, Delivery, DeliveryStream};
pub use decision_sink::{DecisionSink, LogDecisionSink};
pub use id_provider::IdProvider;
pub use time_provider::TimeProvider;
