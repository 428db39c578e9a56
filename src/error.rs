//! Error types for the crucible sandbox, reflection loop and handoff.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type.
#[derive(Error, Debug)]
pub enum Error {
    /// The container engine is unreachable or the workspace clone failed.
    #[error("environment unavailable: {0}")]
    EnvironmentUnavailable(String),

    /// A command exceeded its timeout.
    #[error("command `{command}` timed out after {}s", timeout.as_secs())]
    CommandTimeout {
        command: String,
        timeout: Duration,
        partial_output: String,
    },

    /// A command exited unsuccessfully where success was required.
    #[error("command `{command}` failed (exit {exit_code:?}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// Git operation failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// An operation needed a running sandbox.
    #[error("sandbox is not running")]
    SandboxNotRunning,

    /// No session with this id.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// No artifact with this id.
    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    /// The artifact is not in a state that allows review or execution.
    #[error("artifact {id} cannot be {action} while {status}")]
    ArtifactNotApprovable {
        id: String,
        status: String,
        action: &'static str,
    },

    /// Rollback requested for an artifact that has nothing to restore.
    #[error("artifact {id} cannot be rolled back: {reason}")]
    NotRollbackable { id: String, reason: String },

    /// The reflection result is not promotable.
    #[error("reflection result not ready for promotion: {0}")]
    NotReadyForPromotion(String),

    /// Every changed file was filtered out.
    #[error("nothing to promote: {0}")]
    NothingToPromote(String),

    /// A changed file has no text content to carry in an artifact.
    #[error("binary file cannot be promoted: {0}")]
    BinaryFile(String),

    /// Production tests failed after applying an artifact.
    #[error("production validation failed: {0}")]
    ProductionValidationFailed(String),

    /// One file of a batch could not be applied.
    #[error("failed to apply {path}: {reason}")]
    PartialApplyFailure { path: String, reason: String },

    /// A persisted state file could not be decoded.
    #[error("state file {path} is corrupted: {reason}")]
    StateCorrupted { path: PathBuf, reason: String },

    /// The refinement strategy failed.
    #[error("refinement failed: {0}")]
    Refinement(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
