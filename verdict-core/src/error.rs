//! Error types for the Verdict research engine.
//!
//! Uses `thiserror` for public API error types with one enum per domain:
//! discovery, inference, queueing, persistence, task lifecycle and
//! notification delivery.

use std::path::PathBuf;
use uuid::Uuid;

/// Top-level error type for the Verdict core library.
#[derive(Debug, thiserror::Error)]
pub enum VerdictError {
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while discovering candidate case records.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Strategy '{strategy}' has no runnable discovery queries")]
    NoRunnableStrategy { strategy: String },

    #[error("No candidate cases found for '{query}' after expansion and fallback")]
    ZeroResultsExhausted { query: String },

    #[error("Search backend failed: {message}")]
    Backend { message: String },
}

/// Errors from the external generative-text service boundary.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Inference call '{label}' timed out after {timeout_secs}s")]
    Timeout { label: String, timeout_secs: u64 },

    #[error("Inference call '{label}' echoed the prompt back")]
    Echo { label: String },

    #[error("Inference request failed: {message}")]
    Request { message: String },

    #[error("Response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Response is missing required sections: {}", missing.join(", "))]
    SchemaValidation { missing: Vec<String> },

    #[error("{phase} gave up after {attempts} attempts: {last_error}")]
    AttemptsExhausted {
        phase: String,
        attempts: u32,
        last_error: String,
    },
}

/// Errors from the request serialization queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is full ({max} jobs waiting)")]
    QueueFull { max: usize },

    #[error("Job {request_id} timed out after {timeout_secs}s")]
    JobTimeout { request_id: Uuid, timeout_secs: u64 },

    #[error("Queue is shutting down")]
    ShutDown,

    #[error("Job {request_id} was dropped before producing a result")]
    Dropped { request_id: Uuid },
}

/// Errors from the durable JSON blob store.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("I/O failure on {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Corrupt document '{key}': {message}")]
    Corrupt { key: String, message: String },
}

/// Errors from the durable task queue and its state machine.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task not found: {id}")]
    NotFound { id: String },

    #[error("Invalid task transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Task {id} has no execution plan")]
    MissingPlan { id: String },

    #[error("Task queue is not ready for report generation: {reason}")]
    NotReady { reason: String },

    #[error("Decomposition produced no valid tasks")]
    DecompositionEmpty,
}

/// Errors from notification delivery.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Invalid address '{address}': {message}")]
    InvalidAddress { address: String, message: String },

    #[error("Delivery failed: {message}")]
    Delivery { message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },
}

/// A type alias for results using the top-level `VerdictError`.
pub type Result<T> = std::result::Result<T, VerdictError>;
