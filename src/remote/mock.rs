//! Recording in-memory transport for unit tests

use super::{Actor, Outcome, Transport};
use crate::error::{FanoutError, Result};
use std::collections::HashMap;
use std::fs::{File, Metadata};
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Failure knobs. Substring lists match against host or remote path.
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub fail_connect: Vec<String>,
    pub fail_hostname: bool,
    pub fail_commands: bool,
    pub fail_dirs: Vec<String>,
    pub fail_files: Vec<String>,
    /// Remote paths that exist as regular files
    pub existing_files: Vec<String>,
    /// Held inside each file copy, to make overlap observable
    pub copy_delay: Duration,
}

#[derive(Debug, Default)]
pub struct MockState {
    pub connects: Mutex<Vec<String>>,
    pub commands: Mutex<Vec<(String, String)>>,
    pub dirs: Mutex<Vec<(String, u32)>>,
    pub files: Mutex<HashMap<String, (Vec<u8>, u32)>>,
    pub closes: Mutex<HashMap<String, usize>>,
}

impl MockState {
    pub fn close_count(&self, host: &str) -> usize {
        self.closes.lock().unwrap().get(host).copied().unwrap_or(0)
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).map(|(data, _)| data.clone())
    }

    pub fn file_mode(&self, path: &str) -> Option<u32> {
        self.files.lock().unwrap().get(path).map(|(_, mode)| *mode)
    }

    pub fn dir_paths(&self) -> Vec<String> {
        self.dirs.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    pub config: Arc<MockConfig>,
    pub state: Arc<MockState>,
}

impl MockTransport {
    pub fn new(config: MockConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::default(),
        }
    }

    /// A connected actor outside of any dispatch
    pub fn actor(&self, host: &str) -> MockActor {
        MockActor {
            host: host.to_string(),
            config: Arc::clone(&self.config),
            state: Arc::clone(&self.state),
        }
    }
}

impl Transport for MockTransport {
    fn connect(&self, host: &str) -> Result<Box<dyn Actor>> {
        self.state.connects.lock().unwrap().push(host.to_string());
        if self.config.fail_connect.iter().any(|h| host.contains(h.as_str())) {
            return Err(FanoutError::connect(host, "connection refused"));
        }
        Ok(Box::new(self.actor(host)))
    }
}

pub struct MockActor {
    host: String,
    config: Arc<MockConfig>,
    state: Arc<MockState>,
}

fn matches_any(path: &str, needles: &[String]) -> bool {
    needles.iter().any(|n| path.contains(n.as_str()))
}

impl Actor for MockActor {
    fn host(&self) -> &str {
        &self.host
    }

    fn run_command(&self, command: &str) -> Outcome {
        self.state
            .commands
            .lock()
            .unwrap()
            .push((self.host.clone(), command.to_string()));

        let failing = if command == "hostname" {
            self.config.fail_hostname
        } else {
            self.config.fail_commands
        };
        if failing {
            return Outcome {
                stdout: String::new(),
                stderr: format!("{}: not found\n", command),
                error: Some(FanoutError::Command {
                    host: self.host.clone(),
                    command: command.to_string(),
                    detail: "exited with status 127".to_string(),
                }),
            };
        }
        if command == "hostname" {
            Outcome::ok(format!("node-{}\n", self.host))
        } else {
            Outcome::ok(format!("{} on {}\n", command, self.host))
        }
    }

    fn create_remote_dir(&self, path: &str, mode: u32) -> Result<()> {
        let error = |detail: &str| FanoutError::RemoteDir {
            path: path.to_string(),
            detail: detail.to_string(),
        };
        if self.config.existing_files.iter().any(|f| f == path) {
            return Err(error("exists and is not a directory"));
        }
        if matches_any(path, &self.config.fail_dirs) {
            return Err(error("permission denied"));
        }
        self.state
            .dirs
            .lock()
            .unwrap()
            .push((path.to_string(), mode));
        Ok(())
    }

    fn copy_file_to_remote(&self, local: &mut File, remote_path: &str, meta: &Metadata) -> Result<()> {
        std::thread::sleep(self.config.copy_delay);
        if matches_any(remote_path, &self.config.fail_files) {
            return Err(FanoutError::RemoteFile {
                path: remote_path.to_string(),
                detail: "permission denied".to_string(),
            });
        }
        let mut data = Vec::new();
        local.read_to_end(&mut data)?;
        self.state.files.lock().unwrap().insert(
            remote_path.to_string(),
            (data, meta.permissions().mode() & 0o7777),
        );
        Ok(())
    }

    fn close(&self) -> Result<()> {
        *self
            .state
            .closes
            .lock()
            .unwrap()
            .entry(self.host.clone())
            .or_insert(0) += 1;
        Ok(())
    }
}
