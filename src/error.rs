//! Error types for the lead cadence service.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Decision error: {0}")]
    Decision(#[from] DecisionError),

    #[error("Processing error: {0}")]
    Process(#[from] ProcessError),

    #[error("Lead error: {0}")]
    Lead(#[from] LeadError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
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

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Channel gateway errors (SMS, email, voice, CRM, operator notifications).
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway {name} send failed: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Gateway {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Gateway {name} is not configured")]
    NotConfigured { name: String },

    #[error("Gateway {name} rejected the recipient: {reason}")]
    InvalidRecipient { name: String, reason: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decision service errors.
#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error("Decision service timed out after {0:?}")]
    Timeout(Duration),

    #[error("Decision service returned an unusable decision: {0}")]
    Malformed(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Lead state errors.
#[derive(Debug, thiserror::Error)]
pub enum LeadError {
    #[error("Lead {id} cannot transition from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Lead {0} not found")]
    NotFound(Uuid),

    #[error("Appointment {0} not found")]
    AppointmentNotFound(Uuid),

    #[error("Duplicate submission suppressed: {0}")]
    Duplicate(String),

    #[error("Unknown booking {0}")]
    UnknownBooking(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),
}

/// Stage of per-lead processing where a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStage {
    Fetch,
    Context,
    Decision,
    Guardrail,
    Send,
    Persist,
}

impl std::fmt::Display for ProcessStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Fetch => "fetch",
            Self::Context => "context",
            Self::Decision => "decision",
            Self::Guardrail => "guardrail",
            Self::Send => "send",
            Self::Persist => "persist",
        };
        write!(f, "{s}")
    }
}

/// A per-lead processing failure tagged with the stage it happened in.
#[derive(Debug, thiserror::Error)]
#[error("lead {lead_id} failed at {stage}: {reason}")]
pub struct ProcessError {
    pub lead_id: Uuid,
    pub stage: ProcessStage,
    pub reason: String,
}

impl ProcessError {
    pub fn new(lead_id: Uuid, stage: ProcessStage, reason: impl std::fmt::Display) -> Self {
        Self {
            lead_id,
            stage,
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
