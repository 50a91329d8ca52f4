//! RPC Request/Response Types
//!
//! Defines the JSON-RPC method parameters and results.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// loans.submit.v1 - Submit a loan for asynchronous approval
///
/// Every field is optional on the wire so a missing one gets the
/// "required" message rather than a parse error.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitLoanRequest {
    pub borrower_id: Option<i64>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub amount: Option<Decimal>,
    pub term: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitLoanResponse {
    pub loan_id: i64,
    /// SUBMITTED_FOR_APPROVAL | MANUAL_APPROVAL_REQUIRED
    pub status: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub submitted_at: String,
}

/// system.health.v1 - Daemon and queue status (takes no parameters)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub version: String,
    pub queue: String,
    pub queue_available: bool,
    pub uptime_seconds: u64,
}
