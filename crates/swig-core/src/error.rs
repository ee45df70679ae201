//! Error taxonomy for the dispatch engine (spec §7).
//!
//! `SwigError` distinguishes errors the enqueuer must see synchronously
//! from errors the worker loop records on a row and keeps going from.
//! Cancellation is deliberately not a variant here: it is a distinct,
//! non-error outcome handled at the call site.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwigError {
    /// The object handed to `register`/`enqueue` does not behave like a handler.
    #[error("handler contract violation: {0}")]
    HandlerContract(String),

    /// JSON (de)serialization of a handler payload failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A caller-supplied transaction was not of a shape this store recognizes.
    #[error("transaction mismatch: {0}")]
    TransactionMismatch(String),

    /// The underlying database refused or failed an operation.
    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),

    /// `stop` did not drain outstanding worker loops within its deadline.
    #[error("shutdown timed out waiting for {outstanding} worker loop(s) to drain")]
    Timeout { outstanding: usize },
}

impl SwigError {
    pub fn store(err: impl Into<anyhow::Error>) -> Self {
        SwigError::Store(err.into())
    }
}

pub type Result<T> = std::result::Result<T, SwigError>;

/// Why a claimed row failed to deserialize into its registered handler type.
#[derive(Debug, Error)]
#[error("failed to deserialize payload for kind {kind:?}: {source}")]
pub struct DeserializationError {
    pub kind: String,
    #[source]
    pub source: serde_json::Error,
}

/// The two terminal outcomes of a single handler invocation, recorded on the row
/// rather than surfaced to the caller (§7: `HandlerExecutionError` / `UnknownKind`).
#[derive(Debug, Error)]
pub enum FailureReason {
    #[error("no handler registered for kind {0}")]
    UnknownKind(String),
    #[error("{0}")]
    Deserialization(#[from] DeserializationError),
    #[error("{0}")]
    HandlerExecution(#[source] anyhow::Error),
}

impl FailureReason {
    /// The text stored in the row's `last_error` column.
    pub fn message(&self) -> String {
        self.to_string()
    }
}
