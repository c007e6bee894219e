//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// A precondition failed before anything was submitted to the ledger.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Submission or confirmation failure reported by the ledger gateway.
    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected event shape, missing expected event, or an internal
    /// identity mismatch between a workflow's target and an event's target.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl ServiceError {
    /// HTTP status the error maps to at the REST boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::Validation(_) => 400,
            ServiceError::NotFound(_) => 404,
            ServiceError::Conflict(_) => 409,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
