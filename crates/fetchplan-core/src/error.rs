//! Core error types for fetchplan.
//!
//! [`OptimizerError`] covers the ORM collaborator errors, registry storage
//! failures, configuration problems, serialization, and I/O. Every crate in
//! the workspace returns [`OptimizerResult`].

use thiserror::Error;

/// The primary error type for fetchplan.
///
/// Variants are grouped by the layer that raises them. Registry storage
/// failures are never swallowed: a silently failing registry would corrupt
/// the optimization feedback loop, so they always reach the caller.
#[derive(Error, Debug)]
pub enum OptimizerError {
    // ── ORM errors ───────────────────────────────────────────────────

    /// Raised when a query expected exactly one result but found none.
    #[error("Object does not exist: {0}")]
    DoesNotExist(String),

    /// Raised when a query expected exactly one result but found multiple.
    #[error("Multiple objects returned when one expected: {0}")]
    MultipleObjectsReturned(String),

    /// A generic database error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A database integrity constraint was violated.
    #[error("Integrity error: {0}")]
    IntegrityError(String),

    /// The named field does not exist on the model.
    #[error("Field '{field}' does not exist on {model}")]
    FieldDoesNotExist {
        /// The model label (e.g. `blog.Report`).
        model: String,
        /// The requested field name.
        field: String,
    },

    /// The field exists but was not loaded by the query that produced the record.
    #[error("Field '{field}' of {model} was deferred and has not been loaded")]
    FieldDeferred {
        /// The model label.
        model: String,
        /// The deferred field name.
        field: String,
    },

    // ── Registry ─────────────────────────────────────────────────────

    /// The registry backing store failed to read or write.
    #[error("Registry store error: {0}")]
    StoreError(String),

    // ── Configuration ────────────────────────────────────────────────

    /// A configuration value is missing or invalid.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The optimizer is improperly configured.
    #[error("Improperly configured: {0}")]
    ImproperlyConfigured(String),

    // ── Serialization ────────────────────────────────────────────────

    /// An error occurred during serialization or deserialization.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    // ── IO ───────────────────────────────────────────────────────────

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OptimizerError {
    /// Returns `true` for failures of persistent storage (registry store or
    /// filesystem) as opposed to query-level errors.
    pub const fn is_storage_error(&self) -> bool {
        matches!(self, Self::StoreError(_) | Self::IoError(_))
    }

    /// Shorthand for a [`FieldDoesNotExist`](Self::FieldDoesNotExist) error.
    pub fn no_field(model: impl Into<String>, field: impl Into<String>) -> Self {
        Self::FieldDoesNotExist {
            model: model.into(),
            field: field.into(),
        }
    }
}

impl From<serde_json::Error> for OptimizerError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// A convenience type alias for `Result<T, OptimizerError>`.
pub type OptimizerResult<T> = Result<T, OptimizerError>;
