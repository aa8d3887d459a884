//! Error handling module for fanout
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Resolution errors abort an invocation; every other kind is recovered at the
//! host boundary and reported as part of that host's result.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for fanout
#[derive(Error, Debug)]
pub enum FanoutError {
    /// A requested host group is not defined in the groups file
    #[error("host group '{group}' not found in groups file {}", file.display())]
    UnknownGroup { group: String, file: PathBuf },

    /// The groups file could not be read or its variables could not be listed
    #[error("failed to read host groups from {}: {detail}", file.display())]
    GroupsFileUnreadable { file: PathBuf, detail: String },

    /// Sourcing the groups file and expanding the requested groups failed
    #[error("could not expand host groups {groups:?} from {}: {detail}", file.display())]
    ShellExpansionFailed {
        file: PathBuf,
        groups: Vec<String>,
        detail: String,
    },

    /// Dialing or handshaking with a host failed
    #[error("failed to connect to host {host}: {detail}")]
    Connect { host: String, detail: String },

    /// No authentication method was accepted by a host
    #[error("failed to authenticate to host {host}: {detail}")]
    Auth { host: String, detail: String },

    /// A remote command could not be run or exited unsuccessfully
    #[error("command '{command}' failed on host {host}: {detail}")]
    Command {
        host: String,
        command: String,
        detail: String,
    },

    /// The file transfer subsystem could not be started on a host
    #[error("failed to start SFTP subsystem on host {host}: {detail}")]
    Sftp { host: String, detail: String },

    /// A remote directory could not be created
    #[error("failed to create remote dir {path}: {detail}")]
    RemoteDir { path: String, detail: String },

    /// A remote file could not be created or written
    #[error("failed to copy to remote file {path}: {detail}")]
    RemoteFile { path: String, detail: String },

    /// A local source path could not be used
    #[error("local path {}: {detail}", path.display())]
    LocalPath { path: PathBuf, detail: String },

    /// Work for one host panicked; the other hosts are unaffected
    #[error("fanout panicked while working on host {host}: {detail}")]
    HostPanicked { host: String, detail: String },

    /// One or more paths of a copy failed; details are in the host's stderr
    #[error("failed to copy {failed} path(s)")]
    CopyFailed { failed: usize },

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for fanout operations
pub type Result<T> = std::result::Result<T, FanoutError>;

impl FanoutError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connect error for `host`
    pub fn connect(host: &str, detail: impl ToString) -> Self {
        Self::Connect {
            host: host.to_string(),
            detail: detail.to_string(),
        }
    }

    /// Create a local path error
    pub fn local_path(path: impl Into<PathBuf>, detail: impl ToString) -> Self {
        Self::LocalPath {
            path: path.into(),
            detail: detail.to_string(),
        }
    }

    /// True for the errors that abort a whole invocation before any host work.
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            Self::UnknownGroup { .. }
                | Self::GroupsFileUnreadable { .. }
                | Self::ShellExpansionFailed { .. }
        )
    }
}
