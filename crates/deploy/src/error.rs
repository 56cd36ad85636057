//! Error taxonomy shared by every stage.

use thiserror::Error;

/// Errors surfaced to the operator by the pipeline stages.
///
/// Stage functions return `anyhow::Result` and bail with one of these variants so
/// callers can recover the category with `downcast_ref::<PipelineError>()`.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A required environment variable or network selection is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The active network differs from the one the record was produced on.
    #[error("network mismatch: expected {expected}, got {actual}")]
    NetworkMismatch { expected: String, actual: String },

    /// The deployment record is missing addresses required by the stage.
    #[error("deployment record is incomplete, missing: {}", missing.join(", "))]
    IncompleteRecord { missing: Vec<String> },

    /// A submitted transaction reverted or failed to confirm.
    #[error("{stage}: {operation} on {contract} ({address}) failed: {reason}")]
    TransactionFailure {
        stage: &'static str,
        operation: String,
        contract: String,
        address: String,
        reason: String,
    },

    /// On-chain state disagrees with the expected configuration.
    #[error("verification mismatch in {check}: {detail}")]
    VerificationMismatch { check: String, detail: String },
}

impl PipelineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether the error happened before any transaction could have been sent.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::NetworkMismatch { .. } | Self::IncompleteRecord { .. }
        )
    }
}
