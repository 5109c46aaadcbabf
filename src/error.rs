//! Error types for the lead engagement orchestrator.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("Campaign error: {0}")]
    Campaign(#[from] CampaignError),
}

impl Error {
    /// Systemic failures are the only ones escalated beyond the lead they hit.
    pub fn is_systemic(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Config(_))
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Channel transport failures, split by whether another attempt can help.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    /// Network, timeout, rate limiting or 5xx-equivalent. Retried with backoff.
    #[error("Transient delivery failure on {channel}: {reason}")]
    Transient { channel: String, reason: String },

    /// Invalid address or a permanent refusal from the channel.
    #[error("Fatal delivery failure on {channel}: {reason}")]
    Fatal { channel: String, reason: String },
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Transient { reason, .. } | Self::Fatal { reason, .. } => reason,
        }
    }
}

/// Text-generation failures. Always retryable until the attempt cap.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RenderError {
    #[error("Generator {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Generator {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Template for step {step} references unknown field {field}")]
    MissingField { step: u32, field: String },

    #[error("Rendered message for step {step} is empty")]
    Empty { step: u32 },
}

/// Errors raised while routing or applying an event to a lead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EventError {
    #[error("Duplicate event {key}")]
    Duplicate { key: String },

    #[error("Invalid transition for lead {lead_id}: {event} in state {state}")]
    InvalidTransition {
        lead_id: String,
        state: String,
        event: String,
    },

    #[error("No lead matches {reference}")]
    UnknownLead { reference: String },

    #[error("Malformed event: {0}")]
    Malformed(String),
}

/// Campaign lookup and validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CampaignError {
    #[error("Campaign {id} not found")]
    NotFound { id: String },

    #[error("Campaign {id} is inactive")]
    Inactive { id: String },

    #[error("Campaign {id} is invalid: {reason}")]
    Invalid { id: String, reason: String },
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_error_retryability() {
        let transient = DeliveryError::Transient {
            channel: "whatsapp".into(),
            reason: "503".into(),
        };
        let fatal = DeliveryError::Fatal {
            channel: "whatsapp".into(),
            reason: "invalid number".into(),
        };
        assert!(transient.is_retryable());
        assert!(!fatal.is_retryable());
        assert_eq!(fatal.reason(), "invalid number");
    }

    #[test]
    fn only_store_and_config_errors_are_systemic() {
        let db: Error = DatabaseError::Query("locked".into()).into();
        let dup: Error = EventError::Duplicate { key: "SM1:delivered".into() }.into();
        assert!(db.is_systemic());
        assert!(!dup.is_systemic());
    }
}
