//! Channel transport abstraction for outbound messages and receipts.

pub mod twilio;

pub use twilio::{TwilioConfig, TwilioWhatsApp};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DeliveryError;

/// Receipt state of one attempt, as the transport reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReceiptStatus {
    /// Accepted but not yet delivered (queued, sending, sent).
    Pending,
    Delivered,
    Failed { error_code: Option<String> },
}

impl ReceiptStatus {
    /// Map a transport status string and optional error code.
    pub fn from_transport(status: &str, error_code: Option<&str>) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "delivered" | "read" => Self::Delivered,
            "failed" | "undelivered" => Self::Failed {
                error_code: error_code
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string),
            },
            _ => Self::Pending,
        }
    }
}

/// A previously made attempt found in the transport's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReceipt {
    pub attempt_id: String,
    pub sent_at: DateTime<Utc>,
    pub status: ReceiptStatus,
}

/// Outbound channel the dispatcher sends through.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Channel name, used as the channel rate-limit key.
    fn name(&self) -> &str;

    /// Hand a message to the transport. Returns the transport's attempt id.
    async fn send(&self, address: &str, text: &str) -> Result<String, DeliveryError>;

    /// Current receipt state of an attempt, `None` if the transport has no record.
    async fn attempt_status(&self, attempt_id: &str)
    -> Result<Option<ReceiptStatus>, DeliveryError>;

    /// Most recent attempt to `address` made at or after `since`.
    async fn find_recent_attempt(
        &self,
        address: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<AttemptReceipt>, DeliveryError>;

    /// Receipt error codes that mean the message can never be delivered.
    fn default_fatal_codes(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Normalize a phone-style address: digits only, 10-digit numbers get the
/// `1` country code.
pub fn normalize_address(raw: &str) -> String {
    let without_prefix = raw.trim().trim_start_matches("whatsapp:");
    let digits: String = without_prefix.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 10 && !digits.starts_with('1') {
        format!("1{digits}")
    } else {
        digits
    }
}

/// Whether a failed receipt's error code can be retried.
pub fn is_retryable_code(error_code: Option<&str>, fatal_codes: &[String]) -> bool {
    match error_code {
        Some(code) => !fatal_codes.iter().any(|f| f == code),
        None => true,
    }
}
