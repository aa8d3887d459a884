//! Remote host capabilities
//!
//! The dispatcher and the actions only ever talk to a host through these
//! traits. [`ssh::SshTransport`] is the production implementation.

pub mod ssh;

#[cfg(test)]
pub(crate) mod mock;

use crate::error::{FanoutError, Result};
use std::fs::{File, Metadata};

/// What one unit of remote work produced.
///
/// `stdout` and `stderr` are kept even when `error` is set, so a failing
/// command still shows its output.
#[derive(Debug, Default)]
pub struct Outcome {
    pub stdout: String,
    pub stderr: String,
    pub error: Option<FanoutError>,
}

impl Outcome {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn failed(error: FanoutError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// One live connection to a single host.
///
/// An actor is owned by the dispatch task that created it. The task may use
/// it from two threads at once (hostname lookup alongside the action), so
/// implementations must be `Sync`.
pub trait Actor: Send + Sync {
    /// The address this actor is connected to
    fn host(&self) -> &str;

    /// Run `command` through the remote shell.
    fn run_command(&self, command: &str) -> Outcome;

    /// Create `path` and any missing parents; the leaf gets `mode`.
    ///
    /// An existing directory is success. An existing non-directory is an
    /// error.
    fn create_remote_dir(&self, path: &str, mode: u32) -> Result<()>;

    /// Create or truncate `remote_path` and fill it from `local`, applying
    /// the permission bits and modification time in `meta`.
    fn copy_file_to_remote(&self, local: &mut File, remote_path: &str, meta: &Metadata)
        -> Result<()>;

    /// Disconnect. Called exactly once per successful connection.
    fn close(&self) -> Result<()>;
}

/// Produces actors for host addresses.
pub trait Transport: Send + Sync {
    fn connect(&self, host: &str) -> Result<Box<dyn Actor>>;
}

/// Join a remote directory and a relative path with `/`.
pub fn remote_join(dir: &str, rel: &str) -> String {
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() {
        dir.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, rel)
    } else {
        format!("{}/{}", dir, rel)
    }
}
