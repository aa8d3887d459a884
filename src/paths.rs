//! Local path expansion
//!
//! Paths from the command line and config file may use `~`, `$VAR` and
//! `${VAR}`. They are expanded and made absolute before use.

use crate::error::{FanoutError, Result};
use std::env;
use std::path::{Component, Path, PathBuf};

/// Expand `~` and environment variables in `raw`, then make it absolute and
/// lexically clean (`.` removed, `..` folded).
///
/// A variable that is not set is an error.
pub fn abs_path(raw: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(raw).map_err(|e| FanoutError::local_path(raw, e))?;
    if expanded.is_empty() {
        return Err(FanoutError::local_path(raw, "empty path"));
    }
    if expanded == "~" || expanded.starts_with("~/") {
        return Err(FanoutError::local_path(
            raw,
            "cannot expand '~': home directory unknown",
        ));
    }

    let path = Path::new(&*expanded);
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()
            .map_err(|e| FanoutError::local_path(raw, format!("no working directory: {}", e)))?
            .join(path)
    };
    Ok(clean(&joined))
}

fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                // ".." at the root stays at the root
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
