//! Host group resolution
//!
//! A groups file is plain shell: each top-level assignment (`web="10.0.0.1
//! 10.0.0.2"`, optionally `export`ed) defines one host group, and values may
//! span lines or reference other variables. Rather than parse shell, the file
//! is sourced by `bash` and the results are read back:
//!
//! 1. The set of group names is the difference between `env` in an empty
//!    environment and `env` after sourcing the file (with `set -a`) in an
//!    otherwise identical empty environment. Lines from `env` that do not
//!    start with a valid variable name are ignored, so multi-line values are
//!    handled.
//! 2. Requested groups are validated against that set, all or nothing.
//! 3. The file is syntax-checked, sourced once more and the requested groups
//!    are echoed; the output is split on whitespace into the address list.
//!    Order is kept and duplicates across groups are kept. Lines that fail
//!    while sourcing (such as `0a=...`) are skipped, as in step 1.

use crate::error::{FanoutError, Result};
use crate::shell::{run_bash, ShellEnv};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const LIST_BASE_ENV: &str = "env";
const LIST_FILE_ENV: &str = "set -a; source \"$1\" >/dev/null 2>&1; env";

/// A groups file on disk. Nothing is cached; every call re-reads the file.
#[derive(Debug, Clone)]
pub struct GroupsFile {
    path: PathBuf,
}

impl GroupsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn path_arg(&self) -> Result<&str> {
        self.path.to_str().ok_or_else(|| FanoutError::GroupsFileUnreadable {
            file: self.path.clone(),
            detail: "path is not valid UTF-8".to_string(),
        })
    }

    fn unreadable(&self, detail: impl ToString) -> FanoutError {
        FanoutError::GroupsFileUnreadable {
            file: self.path.clone(),
            detail: detail.to_string(),
        }
    }

    /// Every group name the file defines.
    pub fn valid_groups(&self) -> Result<BTreeSet<String>> {
        // bash reports a missing file as a sourcing error we discard, so
        // check readability first
        let meta = fs::metadata(&self.path).map_err(|e| self.unreadable(e))?;
        if !meta.is_file() {
            return Err(self.unreadable("not a regular file"));
        }
        File::open(&self.path).map_err(|e| self.unreadable(e))?;
        let file = self.path_arg()?;

        let base = run_bash(LIST_BASE_ENV, &[], ShellEnv::Empty, false)
            .map_err(|e| self.unreadable(format!("failed to list base environment: {}", e)))?;
        if !base.success {
            return Err(self.unreadable(format!(
                "failed to list base environment: {}",
                base.failure_detail()
            )));
        }
        let base_vars: BTreeSet<&str> = base.stdout.lines().filter_map(variable_name).collect();

        let sourced = run_bash(LIST_FILE_ENV, &[file], ShellEnv::Empty, false)
            .map_err(|e| self.unreadable(format!("failed to source file: {}", e)))?;
        if !sourced.success {
            return Err(self.unreadable(sourced.failure_detail()));
        }

        let groups: BTreeSet<String> = sourced
            .stdout
            .lines()
            .filter_map(variable_name)
            .filter(|v| !base_vars.contains(v))
            .map(str::to_string)
            .collect();
        debug!("groups in {}: {:?}", self.path.display(), groups);
        Ok(groups)
    }

    /// Resolve `groups` to a flat, ordered list of host addresses.
    ///
    /// Fails without returning any addresses if a single requested group is
    /// not defined in the file.
    pub fn resolve(&self, groups: &[String]) -> Result<Vec<String>> {
        info!("groups file: {}", self.path.display());
        info!("host groups: {:?}", groups);

        let defined = self.valid_groups()?;
        if let Some(missing) = groups.iter().find(|g| !defined.contains(g.as_str())) {
            return Err(FanoutError::UnknownGroup {
                group: missing.clone(),
                file: self.path.clone(),
            });
        }
        if groups.is_empty() {
            return Ok(Vec::new());
        }

        // Names are validated identifiers at this point, safe to interpolate
        let refs: Vec<String> = groups.iter().map(|g| format!("${{{}}}", g)).collect();
        let script = format!(
            "bash -n \"$1\" || exit 2; source \"$1\" >&2; echo \"{}\"",
            refs.join(" ")
        );

        let expansion_failed = |detail: String| FanoutError::ShellExpansionFailed {
            file: self.path.clone(),
            groups: groups.to_vec(),
            detail,
        };
        let file = self.path_arg()?;
        let out = run_bash(&script, &[file], ShellEnv::Inherit, false)
            .map_err(|e| expansion_failed(e.to_string()))?;
        if !out.success {
            return Err(expansion_failed(out.failure_detail()));
        }

        let addrs: Vec<String> = out
            .stdout
            .trim_end_matches('\n')
            .split_whitespace()
            .map(str::to_string)
            .collect();
        info!("resolved {} host address(es)", addrs.len());
        Ok(addrs)
    }
}

/// Resolve `groups` against the groups file at `file`.
pub fn resolve(groups: &[String], file: &Path) -> Result<Vec<String>> {
    GroupsFile::new(file).resolve(groups)
}

/// Whether `name` is usable as a host group (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn is_valid_group_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The variable name on a line of `env` output, if the line starts one.
///
/// Continuation lines of multi-line values usually fail this test; the ones
/// that pass are filtered by the base-environment diff or simply name an
/// extra group nobody asks for.
fn variable_name(line: &str) -> Option<&str> {
    let (name, _) = line.split_once('=')?;
    is_valid_group_name(name).then_some(name)
}
