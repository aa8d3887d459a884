//! Per-host results and their human-readable report

use crate::error::FanoutError;
use crate::remote::Outcome;
use std::io::{self, Write};

const BANNER: &str = "~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~";

/// Highest exit status a process can report
const MAX_EXIT_STATUS: usize = 255;

/// Process exit status for a run: the failed host count, clamped to 255.
pub fn exit_status(host_errors: usize) -> i32 {
    i32::try_from(host_errors.min(MAX_EXIT_STATUS)).unwrap_or(255)
}

/// The result of dispatching to one address.
#[derive(Debug)]
pub struct HostResult {
    /// The address the host was reached at
    pub address: String,
    /// The host's own name, or [`fallback_hostname`] when it is unknown
    pub hostname: String,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<FanoutError>,
}

/// The name shown for a host whose `hostname` could not be fetched.
pub fn fallback_hostname(address: &str) -> String {
    format!("{}: could not get hostname", address)
}

impl HostResult {
    /// A host whose work ended without any output: unreachable, or panicked
    pub fn unreachable(address: &str, error: FanoutError) -> Self {
        Self {
            address: address.to_string(),
            hostname: fallback_hostname(address),
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error),
        }
    }

    pub fn from_outcome(address: &str, hostname: String, outcome: Outcome) -> Self {
        Self {
            address: address.to_string(),
            hostname,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            error: outcome.error,
        }
    }

    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }

    /// Write the banner and stdout to `out`, stderr and the error to `err`.
    pub fn render(&self, out: &mut impl Write, err: &mut impl Write) -> io::Result<()> {
        write!(out, "{}\n {}\n{}\n\n", BANNER, self.hostname, BANNER)?;

        let stdout = self.stdout.trim_end_matches('\n');
        if !stdout.is_empty() {
            write!(out, "{}\n\n", stdout)?;
        }
        out.flush()?;

        let stderr = self.stderr.trim_end_matches('\n');
        if !stderr.is_empty() {
            write!(err, "Stderr:\n\n{}\n\n", stderr)?;
        }
        if let Some(e) = &self.error {
            write!(err, "Error: {}\n\n", e)?;
        }
        err.flush()
    }

    /// Render to the process's stdout and stderr.
    pub fn print(&self) -> io::Result<()> {
        self.render(&mut io::stdout().lock(), &mut io::stderr().lock())
    }
}
