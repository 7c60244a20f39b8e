//! Error types for kb-core.
//!
//! Uses a hierarchical error enum so callers can pattern-match on
//! the subsystem that failed. Each subsystem classifies the errors it
//! understands and re-emits them here; unclassifiable failures are
//! wrapped as `Internal` with the original message preserved.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for all kb-core operations.
#[derive(Debug, Error)]
pub enum KbError {
    // ---- Recoverable (operation failed, system healthy) ----
    /// A single file failed document conversion. The rest of the ingestion is fine.
    #[error("conversion error for {path}: {message}")]
    Convert {
        /// Path to the file that failed to convert.
        path: PathBuf,
        /// Human-readable error description.
        message: String,
    },

    /// The external converter exceeded its wall-clock deadline.
    #[error("conversion timed out for {path} after {timeout_ms}ms")]
    ConvertTimeout {
        /// Path to the file whose conversion timed out.
        path: PathBuf,
        /// The deadline that was exceeded, in milliseconds.
        timeout_ms: u64,
    },

    /// A file extension no converter handles.
    #[error("unsupported file extension: .{extension}")]
    UnsupportedFormat {
        /// The offending extension, without the leading dot.
        extension: String,
    },

    /// Embedding inference failed for a single input.
    #[error("embedding error: {message}")]
    Embed {
        /// Human-readable error description.
        message: String,
    },

    /// A caller-supplied value failed validation before any work ran.
    #[error("invalid input: {details}")]
    InvalidInput {
        /// What was wrong with the input.
        details: String,
    },

    /// Requested knowledgebase, table, or row was not found.
    #[error("not found: {entity}")]
    NotFound {
        /// Description of what was not found.
        entity: String,
    },

    /// The operation collides with another in-flight or existing one
    /// (concurrent ingestion of the same KB, rename onto an existing name).
    #[error("conflict: {details}")]
    Conflict {
        /// What collided.
        details: String,
    },

    // ---- Degraded (system works with reduced capability) ----
    /// Embedding model could not be loaded. Single-input embedding fails;
    /// batch embedding yields absent results and ingestion skips chunks.
    #[error("embedding model unavailable: {reason}")]
    ModelUnavailable {
        /// Why the model couldn't be loaded.
        reason: String,
    },

    // ---- Fatal (system cannot operate) ----
    /// Configuration is invalid or missing required fields.
    #[error("configuration error: {details}")]
    Config {
        /// What's wrong with the config.
        details: String,
    },

    // ---- Wrapped external errors ----
    /// SQLite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error for unexpected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results in kb-core.
pub type KbResult<T> = Result<T, KbError>;
