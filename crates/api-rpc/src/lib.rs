//! JSON-RPC API Layer
//!
//! Implements the JSON-RPC 2.0 server through which upstream services submit
//! loans for asynchronous approval.

pub mod error;
pub mod handler;
pub mod server;
pub mod types;

pub use server::{RpcServer, RpcServerConfig};
