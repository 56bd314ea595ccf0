//! Error taxonomy of a synchronization run.
//!
//! Fatal kinds ([`SyncError`]) abort the run and surface to the caller.
//! Recoverable kinds ([`DocumentError`], [`RelocationError`], and the
//! per-id purge failures reported by the reconciler) are collected into
//! the run summary and logged; the run still completes.

use thiserror::Error;

/// Errors that end a run in the `Failed` state (or prevent it starting).
#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing or invalid configuration, detected before the run starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The source listing could not be obtained (or was cut short).
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// The index id set could not be obtained for reconciliation.
    #[error("index unavailable: {0}")]
    IndexUnavailable(String),

    /// The run was cancelled before all listed documents were processed.
    #[error("run cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn config(msg: impl Into<String>) -> Self {
        SyncError::Configuration(msg.into())
    }
}

/// Failure to process one document. Isolated to that document.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("download failed: {0}")]
    Fetch(String),

    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),

    #[error("text extraction failed: {0}")]
    Extract(#[from] crate::extract::ExtractError),

    #[error("upsert rejected: {0}")]
    Upsert(String),
}

/// A content-producing transform operation could not be applied.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("{operation}: invalid parameter: {message}")]
    InvalidParameter { operation: String, message: String },

    #[error("{operation}: cannot process content: {message}")]
    Content { operation: String, message: String },
}

/// The `move` side effect failed. Reported, never fatal to the document.
#[derive(Debug, Clone, Error)]
pub enum RelocationError {
    #[error("no relocation destination is configured")]
    NoDestination,

    #[error("unsupported output format '{0}'")]
    UnsupportedFormat(String),

    #[error("transcoding to '{format}' failed: {message}")]
    Transcode { format: String, message: String },

    #[error("upload of '{name}' failed: {message}")]
    Upload { name: String, message: String },
}
