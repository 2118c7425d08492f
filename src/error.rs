//! Error types for the jail driver.

use std::path::PathBuf;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating jails.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Decoding Errors
    // =========================================================================
    /// Malformed task configuration or persisted driver state.
    #[error("failed to decode {what}: {reason}")]
    Decode { what: String, reason: String },

    // =========================================================================
    // Task Lifecycle Errors
    // =========================================================================
    /// A handle already exists for the task id.
    #[error("task with ID {0:?} already started")]
    AlreadyStarted(String),

    /// No handle is registered for the task id.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Destroy was requested on a running task without `force`.
    #[error("cannot destroy running task {0}")]
    TaskStillRunning(String),

    /// The jail has neither a start command nor the persist flag.
    #[error("jail {name} needs exec.start, command or persist to be set")]
    MissingStartCommand { name: String },

    /// The derived jail name cannot be passed to jail(8).
    #[error("invalid jail name '{name}': {reason}")]
    InvalidJailName { name: String, reason: String },

    /// Exec was called with an empty command list.
    #[error("cmd is required, but was empty")]
    EmptyCommand,

    /// Operation not supported by the jail driver.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    // =========================================================================
    // Resource Limit Errors
    // =========================================================================
    /// A limit amount could not be expanded into a number.
    #[error("amount for {0} is invalid")]
    InvalidLimitAmount(String),

    /// A limit was configured without an action.
    #[error("action for {0} is missing")]
    InvalidLimitAction(String),

    // =========================================================================
    // Image Pipeline Errors
    // =========================================================================
    /// Failed to parse image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// The registry token endpoint did not hand out a pull token.
    #[error("failed to get pull token for {repository}: {reason}")]
    TokenFetchFailed { repository: String, reason: String },

    /// The manifest could not be fetched or parsed.
    #[error("failed to fetch manifest for {reference}: {reason}")]
    ManifestFetchFailed { reference: String, reason: String },

    /// The manifest carries no configuration blob digest.
    #[error("manifest for {reference} has no config digest")]
    ConfigBlobMissing { reference: String },

    /// A blob could not be downloaded or failed verification.
    #[error("failed retrieving image blob {digest}: {reason}")]
    BlobFetchFailed { digest: String, reason: String },

    /// A layer could not be extracted into the rootfs.
    #[error("failed to extract layer {digest}: {reason}")]
    ExtractionFailed { digest: String, reason: String },

    /// Path traversal attempt detected in a layer archive.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    // =========================================================================
    // External Command Errors
    // =========================================================================
    /// An external tool exited unsuccessfully or could not be spawned.
    #[error("{program} {args:?} failed ({status}): stdout={stdout} stderr={stderr}")]
    ExternalCommandFailed {
        program: String,
        args: Vec<String>,
        status: String,
        stdout: String,
        stderr: String,
    },

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    /// Operation was cancelled before it completed.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Driver configuration could not be loaded.
    #[error("invalid driver config at {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Builds a [`Error::Decode`] for the named document.
    pub(crate) fn decode(what: &str, reason: impl std::fmt::Display) -> Self {
        Self::Decode {
            what: what.to_string(),
            reason: reason.to_string(),
        }
    }
}
