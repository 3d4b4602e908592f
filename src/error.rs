//! Error types for the provisioning and orchestration layer.

use std::time::Duration;

/// Result type alias for provisioning operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the provisioning and orchestration layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Command Errors
    // =========================================================================
    /// Command string could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// A required parameter was not supplied.
    #[error("{operation} requires {parameter} parameter")]
    MissingParameter {
        operation: String,
        parameter: String,
    },

    /// A parameter was supplied but its value is unusable.
    #[error("invalid value for {parameter}: {value}")]
    InvalidParameter { parameter: String, value: String },

    /// The operation is not recognized by the handler it was sent to.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    // =========================================================================
    // Policy Errors
    // =========================================================================
    /// A security policy check rejected a resource reference.
    ///
    /// Raised strictly before any external process is spawned.
    #[error("{subject} {value} not allowed by security policy")]
    PolicyViolation { subject: String, value: String },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// A named resource, connection, or deployment does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: String, name: String },

    /// A resource with this name is already registered.
    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: String, name: String },

    /// The registry is at its configured maximum.
    #[error("Maximum number of {kind} ({max}) reached")]
    CapacityExceeded { kind: String, max: usize },

    /// Resource is in the wrong state for the requested operation.
    #[error("{kind} '{name}' is in state '{state}', expected '{expected}'")]
    InvalidState {
        kind: String,
        name: String,
        state: String,
        expected: String,
    },

    // =========================================================================
    // Process Errors
    // =========================================================================
    /// An external tool exited nonzero on a lifecycle-affecting call.
    ///
    /// Retry-eligible: the orchestrator may re-issue the operation.
    #[error("{operation} failed: {stderr}")]
    OperationFailed { operation: String, stderr: String },

    /// The external executable could not be spawned at all.
    ///
    /// Retry-eligible.
    #[error("failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    /// The gateway timeout fired and the process was terminated.
    ///
    /// Retry-eligible.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    // =========================================================================
    // Library Resolution Errors
    // =========================================================================
    /// A require-request named a local library file that does not exist.
    #[error("Local library file not found: {0}")]
    LibraryNotFound(String),

    /// A registry-hosted library could not be fetched over HTTPS.
    #[error("failed to fetch library '{name}': {reason}")]
    LibraryFetchFailed { name: String, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if the orchestrator's retry policy applies to this error.
    ///
    /// Only transient external failures qualify. Validation, policy,
    /// not-found, and capacity errors are terminal by contract.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::OperationFailed { .. } | Error::SpawnFailed { .. } | Error::Timeout { .. }
        )
    }
}
