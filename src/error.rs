//! Error types for hire-flow.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),
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

/// Channel-related errors (IMAP intake, SMTP notifications).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("IMAP error: {0}")]
    Imap(String),

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Channel health check failed: {name}")]
    HealthCheckFailed { name: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// Errors raised by a step executor. The gateway converts these into a
/// policy-driven result; they never reach the controller.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Step {step_type} failed: {reason}")]
    Failed { step_type: String, reason: String },

    #[error("Step executor timed out after {0:?}")]
    Timeout(Duration),

    #[error("No executor registered for step type {0}")]
    Unsupported(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Workflow engine errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Missing catalog reference or unusable gate configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Approval request {request_id} already has a decision")]
    DuplicateDecision { request_id: Uuid },

    /// Lost update on the instance row; the pass must be retried.
    #[error("Concurrent update on workflow instance {instance_id}")]
    ConcurrencyConflict { instance_id: Uuid },

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Dispatcher is shut down")]
    DispatcherClosed,

    #[error("Progression pass for instance {instance_id} aborted")]
    PassAborted { instance_id: Uuid },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl WorkflowError {
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }
}

/// Inbound event ingestion errors.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Invalid inbound event: {0}")]
    InvalidEvent(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
