//! SSH transport built on `ssh2`
//!
//! Each connection is one SSH session. Commands get a fresh channel each;
//! file operations go through an SFTP subsystem that is started on first use
//! and then shared by every copy worker of that host.

use super::{Actor, Outcome, Transport};
use crate::error::{FanoutError, Result};
use ssh2::{FileStat, Session, Sftp};
use std::fs::{File, Metadata};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{
    Mutex, MutexGuard, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connection parameters shared by every host of a run
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub user: String,
    pub port: u16,
    /// Private keys tried in order before falling back to the agent
    pub identity_files: Vec<PathBuf>,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SshTransport {
    config: SshConfig,
}

impl SshTransport {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn dial(&self, host: &str) -> Result<TcpStream> {
        let addrs = (host, self.config.port)
            .to_socket_addrs()
            .map_err(|e| FanoutError::connect(host, e))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(tcp) => return Ok(tcp),
                Err(e) => {
                    debug!(host, %addr, "dial failed: {}", e);
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) => FanoutError::connect(host, e),
            None => FanoutError::connect(host, "no addresses resolved"),
        })
    }

    fn authenticate(&self, session: &Session, host: &str) -> Result<()> {
        let user = &self.config.user;
        let mut attempts: Vec<String> = Vec::new();

        for key in &self.config.identity_files {
            if !key.exists() {
                attempts.push(format!("{}: not found", key.display()));
                continue;
            }
            match session.userauth_pubkey_file(user, None, key, None) {
                Ok(()) if session.authenticated() => {
                    debug!(host, "authenticated with {}", key.display());
                    return Ok(());
                }
                Ok(()) => attempts.push(format!("{}: rejected", key.display())),
                Err(e) => attempts.push(format!("{}: {}", key.display(), e)),
            }
        }

        match session.userauth_agent(user) {
            Ok(()) if session.authenticated() => {
                debug!(host, "authenticated with ssh-agent");
                return Ok(());
            }
            Ok(()) => attempts.push("agent: rejected".to_string()),
            Err(e) => attempts.push(format!("agent: {}", e)),
        }

        Err(FanoutError::Auth {
            host: host.to_string(),
            detail: attempts.join("; "),
        })
    }

    /// Whether any authentication method could possibly be tried
    fn has_credentials(&self) -> bool {
        self.config.identity_files.iter().any(|k| k.exists())
            || std::env::var_os("SSH_AUTH_SOCK").is_some()
    }
}

impl Transport for SshTransport {
    fn connect(&self, host: &str) -> Result<Box<dyn Actor>> {
        if !self.has_credentials() {
            return Err(FanoutError::Auth {
                host: host.to_string(),
                detail: "no readable identity file and no ssh-agent".to_string(),
            });
        }

        info!(host, port = self.config.port, "dialing");
        let tcp = self.dial(host)?;

        let mut session = Session::new().map_err(|e| FanoutError::connect(host, e))?;
        session.set_tcp_stream(tcp);
        // Bound the handshake and auth only; commands may run as long as they like
        let timeout_ms = u32::try_from(self.config.connect_timeout.as_millis()).unwrap_or(u32::MAX);
        session.set_timeout(timeout_ms);
        session
            .handshake()
            .map_err(|e| FanoutError::connect(host, format!("handshake: {}", e)))?;
        self.authenticate(&session, host)?;
        session.set_timeout(0);

        Ok(Box::new(SshActor {
            host: host.to_string(),
            session: Mutex::new(session),
            blocking: RwLock::new(()),
            sftp: OnceLock::new(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Pause between output polls of a command that has nothing new to read
const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(5);

pub struct SshActor {
    host: String,
    session: Mutex<Session>,
    /// Blocking mode is session-wide: blocking calls hold this shared, the
    /// non-blocking output poll holds it exclusively
    blocking: RwLock<()>,
    /// Started on first file operation; a failure is kept and returned to
    /// every later caller
    sftp: OnceLock<std::result::Result<Mutex<Sftp>, String>>,
    closed: AtomicBool,
}

impl SshActor {
    fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.blocking.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.blocking.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> Result<MutexGuard<'_, Session>> {
        self.session
            .lock()
            .map_err(|_| FanoutError::connect(&self.host, "session lock poisoned"))
    }

    fn sftp(&self) -> Result<MutexGuard<'_, Sftp>> {
        let started = self.sftp.get_or_init(|| {
            info!(host = %self.host, "starting SFTP subsystem");
            self.session()
                .map_err(|e| e.to_string())?
                .sftp()
                .map(Mutex::new)
                .map_err(|e| e.to_string())
        });
        let sftp_error = |detail: String| FanoutError::Sftp {
            host: self.host.clone(),
            detail,
        };
        match started {
            Ok(sftp) => sftp
                .lock()
                .map_err(|_| sftp_error("SFTP lock poisoned".to_string())),
            Err(detail) => Err(sftp_error(detail.clone())),
        }
    }

    /// Run `command` on a fresh channel, reading stdout and stderr together
    /// so neither can fill the channel window while the other is awaited.
    fn exec(&self, command: &str) -> std::result::Result<(String, String, i32), String> {
        let mut channel = {
            let _shared = self.shared();
            let mut channel = self
                .session()
                .map_err(|e| e.to_string())?
                .channel_session()
                .map_err(|e| format!("open channel: {}", e))?;
            channel.exec(command).map_err(|e| format!("exec: {}", e))?;
            channel
        };

        let mut output = CommandOutput::default();
        loop {
            let polled = {
                let _exclusive = self.exclusive();
                let session = self.session().map_err(|e| e.to_string())?;
                session.set_blocking(false);
                let polled = output.drain(&mut channel.stream(0), &mut channel.stderr());
                session.set_blocking(true);
                polled.map_err(|e| format!("read output: {}", e))?
            };
            if polled.at_eof && channel.eof() {
                break;
            }
            if !polled.progressed {
                thread::sleep(OUTPUT_POLL_INTERVAL);
            }
        }

        let _shared = self.shared();
        channel.wait_close().map_err(|e| format!("close channel: {}", e))?;
        let status = channel
            .exit_status()
            .map_err(|e| format!("exit status: {}", e))?;
        drop(channel);
        Ok((
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
            status,
        ))
    }

    fn remote_dir_error(path: &str, detail: impl ToString) -> FanoutError {
        FanoutError::RemoteDir {
            path: path.to_string(),
            detail: detail.to_string(),
        }
    }
}

impl Actor for SshActor {
    fn host(&self) -> &str {
        &self.host
    }

    fn run_command(&self, command: &str) -> Outcome {
        debug!(host = %self.host, "running: {}", command);
        let command_error = |detail: String| FanoutError::Command {
            host: self.host.clone(),
            command: command.to_string(),
            detail,
        };
        match self.exec(command) {
            Ok((stdout, stderr, 0)) => Outcome {
                stdout,
                stderr,
                error: None,
            },
            Ok((stdout, stderr, status)) => Outcome {
                stdout,
                stderr,
                error: Some(command_error(format!("exited with status {}", status))),
            },
            Err(detail) => Outcome::failed(command_error(detail)),
        }
    }

    fn create_remote_dir(&self, path: &str, mode: u32) -> Result<()> {
        let _shared = self.shared();
        let sftp = self.sftp()?;

        match sftp.stat(Path::new(path)) {
            Ok(st) if st.is_dir() => return Ok(()),
            Ok(_) => return Err(Self::remote_dir_error(path, "exists and is not a directory")),
            Err(_) => {}
        }

        let mut acc = String::new();
        if path.starts_with('/') {
            acc.push('/');
        }
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if !acc.is_empty() && !acc.ends_with('/') {
                acc.push('/');
            }
            acc.push_str(part);
            match sftp.stat(Path::new(&acc)) {
                Ok(st) if st.is_dir() => {}
                Ok(_) => {
                    return Err(Self::remote_dir_error(
                        path,
                        format!("{} exists and is not a directory", acc),
                    ));
                }
                Err(_) => {
                    debug!(host = %self.host, "mkdir {}", acc);
                    sftp.mkdir(Path::new(&acc), 0o755)
                        .map_err(|e| Self::remote_dir_error(path, e))?;
                }
            }
        }

        // mkdir is subject to the remote umask
        sftp.setstat(
            Path::new(path),
            FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: Some(mode & 0o7777),
                atime: None,
                mtime: None,
            },
        )
        .map_err(|e| Self::remote_dir_error(path, format!("chmod: {}", e)))
    }

    fn copy_file_to_remote(&self, local: &mut File, remote_path: &str, meta: &Metadata) -> Result<()> {
        let file_error = |detail: String| FanoutError::RemoteFile {
            path: remote_path.to_string(),
            detail,
        };

        // Only opening needs the shared handle; the write streams on its own
        let remote = {
            let _shared = self.shared();
            let sftp = self.sftp()?;
            sftp.create(Path::new(remote_path))
                .map_err(|e| file_error(format!("create: {}", e)))?
        };
        let mut writer = GatedWrite {
            gate: &self.blocking,
            inner: remote,
        };
        io::copy(local, &mut writer).map_err(|e| file_error(format!("write: {}", e)))?;

        let _shared = self.shared();
        let mut remote = writer.inner;
        let stat = remote.setstat(FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(meta.permissions().mode() & 0o7777),
            atime: Some(u64::try_from(meta.atime()).unwrap_or(0)),
            mtime: Some(u64::try_from(meta.mtime()).unwrap_or(0)),
        });
        drop(remote);
        stat.map_err(|e| file_error(format!("set attributes: {}", e)))
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            warn!(host = %self.host, "actor closed twice");
            return Ok(());
        }
        debug!(host = %self.host, "disconnecting");
        let _shared = self.shared();
        self.session()?
            .disconnect(None, "fanout finished", None)
            .map_err(|e| FanoutError::connect(&self.host, format!("disconnect: {}", e)))
    }
}

/// Output collected from a command's two streams
#[derive(Debug, Default)]
struct CommandOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// What one non-blocking pass over both streams found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Polled {
    progressed: bool,
    /// Both streams reported end of file
    at_eof: bool,
}

impl CommandOutput {
    /// Read whatever both streams have ready. `WouldBlock` means "nothing yet".
    fn drain(&mut self, stdout: &mut impl Read, stderr: &mut impl Read) -> io::Result<Polled> {
        let (out_read, out_eof) = drain_ready(stdout, &mut self.stdout)?;
        let (err_read, err_eof) = drain_ready(stderr, &mut self.stderr)?;
        Ok(Polled {
            progressed: out_read + err_read > 0,
            at_eof: out_eof && err_eof,
        })
    }
}

/// Returns the bytes read and whether the stream hit end of file.
fn drain_ready(stream: &mut impl Read, sink: &mut Vec<u8>) -> io::Result<(usize, bool)> {
    let mut buf = [0u8; 16 * 1024];
    let mut total = 0;
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return Ok((total, true)),
            Ok(n) => {
                sink.extend_from_slice(&buf[..n]);
                total += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok((total, false)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// Writes to the remote file one blocking call at a time, each under the
/// shared side of the blocking-mode gate.
struct GatedWrite<'a, W> {
    gate: &'a RwLock<()>,
    inner: W,
}

impl<W: Write> Write for GatedWrite<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _shared = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let _shared = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        self.inner.flush()
    }
}
