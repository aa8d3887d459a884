//! Layered run settings
//!
//! Values come from three layers, highest first: the command line, a JSON
//! config file, and built-in defaults. The config file is the first
//! `config.json` found in `./.fanout/`, `$HOME/.fanout/`, `/etc/fanout/`.

use anyhow::{Context, Result as AnyResult};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::dispatch::DEFAULT_MAX_HOSTS;
use crate::error::{FanoutError, Result};
use crate::groups::is_valid_group_name;
use crate::paths::abs_path;
use crate::remote::ssh::SshConfig;

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const DEFAULT_GROUPS_FILE: &str = "_node-list";
pub const DEFAULT_IDENTITY_FILE: &str = "~/.ssh/id_rsa";
pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_USER: &str = "root";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// One layer of optional settings: a config file, or the command line.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsLayer {
    pub groups_file: Option<String>,
    pub host_groups: Option<Vec<String>>,
    pub identity_file: Option<Vec<String>>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub max_hosts: Option<usize>,
    pub connect_timeout: Option<u64>,
}

impl SettingsLayer {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> AnyResult<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let layer: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse configuration JSON in {:?}", path.as_ref()))?;

        Ok(layer)
    }

    /// Where config files are looked for, in order
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![Path::new(".fanout").join(CONFIG_FILE_NAME)];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".fanout").join(CONFIG_FILE_NAME));
        }
        paths.push(Path::new("/etc/fanout").join(CONFIG_FILE_NAME));
        paths
    }

    /// Load the first config file that exists in `paths`.
    ///
    /// No file is not an error; a file that fails to parse is.
    pub fn discover(paths: &[PathBuf]) -> AnyResult<Option<Self>> {
        for path in paths {
            if path.is_file() {
                info!("using config file {}", path.display());
                return Self::load_from_file(path).map(Some);
            }
            debug!("no config file at {}", path.display());
        }
        Ok(None)
    }

    /// Fill every unset field of `self` from `lower`.
    pub fn or(self, lower: SettingsLayer) -> SettingsLayer {
        SettingsLayer {
            groups_file: self.groups_file.or(lower.groups_file),
            host_groups: self.host_groups.or(lower.host_groups),
            identity_file: self.identity_file.or(lower.identity_file),
            port: self.port.or(lower.port),
            user: self.user.or(lower.user),
            max_hosts: self.max_hosts.or(lower.max_hosts),
            connect_timeout: self.connect_timeout.or(lower.connect_timeout),
        }
    }
}

/// Fully resolved settings for one run
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub groups_file: PathBuf,
    pub host_groups: Vec<String>,
    pub identity_files: Vec<PathBuf>,
    pub port: u16,
    pub user: String,
    pub max_hosts: usize,
    pub connect_timeout: Duration,
}

/// Split comma-delimited entries and drop empty names.
fn split_groups(raw: Vec<String>) -> Vec<String> {
    raw.iter()
        .flat_map(|entry| entry.split(','))
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(str::to_string)
        .collect()
}

impl Settings {
    /// Apply defaults under `layer` and expand every path.
    pub fn from_layer(layer: SettingsLayer) -> Result<Self> {
        let groups_file = abs_path(layer.groups_file.as_deref().unwrap_or(DEFAULT_GROUPS_FILE))?;

        let identity_files = match layer.identity_file {
            Some(files) => files.iter().map(|f| abs_path(f)).collect::<Result<Vec<_>>>()?,
            // A missing HOME only loses the default key; the agent may still work
            None => abs_path(DEFAULT_IDENTITY_FILE).map(|p| vec![p]).unwrap_or_default(),
        };

        Ok(Self {
            groups_file,
            host_groups: split_groups(layer.host_groups.unwrap_or_default()),
            identity_files,
            port: layer.port.unwrap_or(DEFAULT_PORT),
            user: layer.user.unwrap_or_else(|| DEFAULT_USER.to_string()),
            max_hosts: layer.max_hosts.unwrap_or(DEFAULT_MAX_HOSTS),
            connect_timeout: Duration::from_secs(
                layer.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            ),
        })
    }

    /// Check settings before use. `needs_hosts` is false for commands that
    /// never contact a host.
    pub fn validate(&self, needs_hosts: bool) -> Result<()> {
        if needs_hosts && self.host_groups.is_empty() {
            return Err(FanoutError::config(
                "no host groups given; use --host-groups or set host_groups in the config file",
            ));
        }
        if let Some(bad) = self.host_groups.iter().find(|g| !is_valid_group_name(g)) {
            return Err(FanoutError::config(format!(
                "invalid host group name '{}': must match [A-Za-z_][A-Za-z0-9_]*",
                bad
            )));
        }
        if self.port == 0 {
            return Err(FanoutError::config("port must be non-zero"));
        }
        if self.max_hosts == 0 {
            return Err(FanoutError::config("max hosts must be non-zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(FanoutError::config("connect timeout must be non-zero"));
        }
        if self.user.is_empty() {
            return Err(FanoutError::config("user must be specified"));
        }
        Ok(())
    }

    pub fn ssh_config(&self) -> SshConfig {
        SshConfig {
            user: self.user.clone(),
            port: self.port,
            identity_files: self.identity_files.clone(),
            connect_timeout: self.connect_timeout,
        }
    }
}
