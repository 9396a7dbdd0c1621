//! Unified error handling for ipa-dumper
//!
//! Variants follow the failure classes an operator has to tell apart:
//! problems before anything was staged, transfer problems in the middle of a
//! run, and assembly problems at the end.

use std::io;
use thiserror::Error;

/// Main error type for dump operations
#[derive(Debug, Error)]
pub enum DumperError {
    /// Device enumeration itself failed
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The run was interrupted by the operator
    #[error("Dump cancelled")]
    Cancelled,

    /// SSH endpoint could not be reached
    #[error("Unable to connect to {host}:{port}: {source}")]
    SshConnect {
        host: String,
        port: u16,
        #[source]
        source: anyhow::Error,
    },

    /// SSH endpoint rejected the credentials
    #[error("SSH authentication failed for user '{user}': {reason}")]
    SshAuth { user: String, reason: String },

    /// Attaching to an explicit PID failed
    #[error("Failed to attach to PID {pid}: {source}")]
    AttachFailed {
        pid: u32,
        #[source]
        source: anyhow::Error,
    },

    /// Spawning the target bundle failed
    #[error("Failed to spawn '{identifier}': {source}")]
    SpawnFailed {
        identifier: String,
        #[source]
        source: anyhow::Error,
    },

    /// Resolution finished without a live session
    #[error("No session could be established for '{0}'")]
    NoSession(String),

    /// The agent script could not be read, created, loaded, or started
    #[error("Failed to load agent: {0}")]
    AgentLoad(String),

    /// A single remote copy failed
    #[error("Failed to retrieve '{path}': {source}")]
    Transfer {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// The agent finished but at least one artifact is missing
    #[error("Dump finished with {} failed transfer(s): {}", .0.len(), .0.join("; "))]
    TransferIncomplete(Vec<String>),

    /// Manifest has no application bundle entry
    #[error("Manifest has no application bundle entry")]
    MissingBundle,

    /// Moving staged artifacts into place failed
    #[error("Failed to assemble package: {0}")]
    Assembly(String),

    /// Writing the archive failed
    #[error("Failed to write archive '{path}': {source}")]
    Archive {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// File I/O error
    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// FRIDA-related errors
    #[error("FRIDA error: {0}")]
    Frida(String),

    /// Feature not enabled
    #[error("Feature '{0}' not enabled at compile time")]
    FeatureNotEnabled(String),

    /// Generic error for cases not covered above
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for dump operations
pub type Result<T> = std::result::Result<T, DumperError>;

impl DumperError {
    /// Errors raised before any artifact was staged
    pub fn is_fatal_before_start(&self) -> bool {
        matches!(
            self,
            DumperError::DeviceUnavailable(_)
                | DumperError::SshConnect { .. }
                | DumperError::SshAuth { .. }
                | DumperError::AttachFailed { .. }
        )
    }

    /// Retry hint printed under the error, if any
    pub fn hint(&self) -> Option<String> {
        match self {
            DumperError::SshConnect { .. } => {
                Some("Try specifying -H/--host and/or -p/--port".to_string())
            }
            DumperError::SshAuth { .. } => {
                Some("Try specifying -u/--user and/or -P/--password".to_string())
            }
            DumperError::FeatureNotEnabled(feat) => Some(format!(
                "This feature requires rebuilding with '--features {feat}'"
            )),
            DumperError::TransferIncomplete(_) => {
                Some("Re-run with --allow-partial to keep what was retrieved".to_string())
            }
            DumperError::NoSession(_) => {
                Some("Check the target with -l/--list or pass its PID".to_string())
            }
            _ => None,
        }
    }

    pub fn from_io_error(path: impl Into<String>, error: io::Error) -> Self {
        DumperError::Io {
            path: path.into(),
            source: error,
        }
    }
}
