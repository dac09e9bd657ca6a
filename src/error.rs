//! Harness Error Types
//!
//! Library modules report failures through these enums. Fatal errors abort the
//! run before any report is produced; everything else is turned into a FAIL
//! outcome by the driver so that cleanup still happens.

use std::path::PathBuf;

/// Errors raised while querying or mutating the host firewall
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// The listing command could not be executed or exited nonzero
    #[error("Rule listing failed: {0}")]
    Query(String),

    /// A mutation command (insert/delete) could not be executed or exited nonzero
    #[error("Rule command `{command}` failed: {message}")]
    Command { command: String, message: String },

    /// A firewall command did not complete in time
    #[error("Firewall command `{command}` timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },
}

/// Errors raised by the subject process controller
#[derive(Debug, thiserror::Error)]
pub enum SubjectError {
    /// The executable is missing or could not be launched
    #[error("Failed to spawn subject {path:?}: {reason}")]
    Spawn { path: PathBuf, reason: String },

    /// The scratch working directory could not be prepared
    #[error("Failed to prepare working directory {path:?}: {reason}")]
    WorkingDir { path: PathBuf, reason: String },

    /// The interrupt signal could not be delivered
    #[error("Failed to signal subject (PID {pid}): {reason}")]
    Signal { pid: u32, reason: String },
}

/// Fatal harness errors; these map to a nonzero process exit
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// A precondition for running the protocol is not met
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// The receiving listener could not be bound
    #[error("Failed to bind listener on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}
