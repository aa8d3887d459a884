//! Shared helpers for integration tests: an in-memory transport and
//! groups-file fixtures.

#![allow(dead_code)]

use fanout::{Actor, FanoutError, Outcome, Result, Transport};
use std::collections::HashMap;
use std::fs::{File, Metadata};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

/// Write `contents` to a fresh groups file
pub fn groups_file(contents: &str) -> NamedTempFile {
    let mut f = NamedTempFile::new().expect("create groups file");
    f.write_all(contents.as_bytes()).expect("write groups file");
    f
}

pub fn strings(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Default)]
pub struct Recorded {
    pub commands: Vec<(String, String)>,
    pub dirs: Vec<String>,
    pub files: HashMap<String, Vec<u8>>,
    pub closes: HashMap<String, usize>,
    pub connects: Vec<String>,
}

/// Transport whose hosts fail according to simple host lists
#[derive(Clone, Default)]
pub struct FakeTransport {
    pub unreachable: Vec<String>,
    pub no_hostname: Vec<String>,
    pub failing_command: Vec<String>,
    pub recorded: Arc<Mutex<Recorded>>,
}

impl FakeTransport {
    pub fn closes(&self, host: &str) -> usize {
        self.recorded.lock().unwrap().closes.get(host).copied().unwrap_or(0)
    }
}

impl Transport for FakeTransport {
    fn connect(&self, host: &str) -> Result<Box<dyn Actor>> {
        self.recorded.lock().unwrap().connects.push(host.to_string());
        if self.unreachable.iter().any(|h| h == host) {
            return Err(FanoutError::connect(host, "no route to host"));
        }
        Ok(Box::new(FakeActor {
            host: host.to_string(),
            transport: self.clone(),
        }))
    }
}

pub struct FakeActor {
    host: String,
    transport: FakeTransport,
}

impl Actor for FakeActor {
    fn host(&self) -> &str {
        &self.host
    }

    fn run_command(&self, command: &str) -> Outcome {
        self.transport
            .recorded
            .lock()
            .unwrap()
            .commands
            .push((self.host.clone(), command.to_string()));

        let fails = if command == "hostname" {
            &self.transport.no_hostname
        } else {
            &self.transport.failing_command
        };
        if fails.iter().any(|h| h == &self.host) {
            return Outcome {
                stdout: String::new(),
                stderr: "boom\n".to_string(),
                error: Some(FanoutError::Command {
                    host: self.host.clone(),
                    command: command.to_string(),
                    detail: "exited with status 1".to_string(),
                }),
            };
        }
        if command == "hostname" {
            Outcome::ok(format!("name-of-{}\n", self.host))
        } else {
            Outcome::ok(format!("{}@{}\n", command, self.host))
        }
    }

    fn create_remote_dir(&self, path: &str, _mode: u32) -> Result<()> {
        self.transport.recorded.lock().unwrap().dirs.push(path.to_string());
        Ok(())
    }

    fn copy_file_to_remote(&self, local: &mut File, remote_path: &str, _meta: &Metadata) -> Result<()> {
        let mut data = Vec::new();
        local.read_to_end(&mut data)?;
        self.transport
            .recorded
            .lock()
            .unwrap()
            .files
            .insert(format!("{}:{}", self.host, remote_path), data);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        *self
            .transport
            .recorded
            .lock()
            .unwrap()
            .closes
            .entry(self.host.clone())
            .or_insert(0) += 1;
        Ok(())
    }
}
