//! Local shell execution
//!
//! This module is the one place fanout runs local `bash`. Every child:
//!
//! - runs in its own process group with a parent-death signal
//! - is tracked in [`SHELL_CHILDREN`] while it runs
//!
//! [`SHELL_CHILDREN`]: crate::process_guard::SHELL_CHILDREN
//! - receives file paths as positional parameters (`$1`, ...), never
//!   spliced into the script text

use crate::process_guard::{ShellIsolation, TrackedChild};
use std::io;
use std::process::{Command, Stdio};
use tracing::debug;

/// How the child's environment is prepared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellEnv {
    /// Inherit fanout's environment
    Inherit,
    /// Start from an empty environment (`env -i`)
    Empty,
}

/// Output from a finished shell script.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl ShellOutput {
    /// Human-readable failure detail: exit status plus trimmed stderr.
    pub fn failure_detail(&self) -> String {
        let status = match self.exit_code {
            Some(code) => format!("bash exited with status {}", code),
            None => "bash was terminated by a signal".to_string(),
        };
        let stderr = self.stderr.trim_end();
        if stderr.is_empty() {
            status
        } else {
            format!("{}:\n{}", status, stderr)
        }
    }
}

/// Run `script` with `bash -c`, passing `args` as `$1..$n`.
///
/// The `-e` flag is set when `errexit` is true. A non-zero exit is not an
/// `Err`; callers inspect [`ShellOutput::success`].
pub fn run_bash(script: &str, args: &[&str], env: ShellEnv, errexit: bool) -> io::Result<ShellOutput> {
    let mut cmd = match env {
        ShellEnv::Inherit => Command::new("bash"),
        ShellEnv::Empty => {
            let mut c = Command::new("env");
            c.args(["-i", "bash"]);
            c
        }
    };
    cmd.arg(if errexit { "-ec" } else { "-c" })
        .arg(script)
        .arg("bash")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .own_process_group();

    debug!(?env, errexit, "running bash: {}", script);
    let child = cmd.spawn()?;
    let tracked = TrackedChild::new(child.id());
    let output = child.wait_with_output();
    drop(tracked);
    let output = output?;

    Ok(ShellOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
        success: output.status.success(),
    })
}
