//! Lifecycle management for local shell children
//!
//! Group resolution shells out to `bash` to source the groups file. A groups
//! file is arbitrary shell, so a slow or hung one must not outlive fanout:
//!
//! - each child leads its own process group and gets SIGTERM if fanout dies
//! - each child is tracked in [`SHELL_CHILDREN`] for as long as it runs
//! - on SIGINT/SIGTERM/SIGHUP every tracked group is sent SIGTERM, then
//!   SIGKILL once the grace period runs out

use nix::libc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long children get to exit after SIGTERM before they are killed
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Every shell child fanout is currently waiting on
pub static SHELL_CHILDREN: Mutex<ShellChildren> = Mutex::new(ShellChildren::new());

#[derive(Debug, Default)]
pub struct ShellChildren {
    pids: BTreeSet<u32>,
    /// Set by the first shutdown; later ones are no-ops
    shutting_down: bool,
}

impl ShellChildren {
    pub const fn new() -> Self {
        Self {
            pids: BTreeSet::new(),
            shutting_down: false,
        }
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    pub fn insert(&mut self, pid: u32) {
        debug!(pid, "tracking shell child");
        self.pids.insert(pid);
    }

    pub fn remove(&mut self, pid: u32) {
        if self.pids.remove(&pid) {
            debug!(pid, "shell child done");
        }
    }

    /// Stop every tracked child: SIGTERM to each process group, a wait of up
    /// to `grace`, then SIGKILL for the stragglers.
    pub fn shutdown(&mut self, grace: Duration) {
        if std::mem::replace(&mut self.shutting_down, true) || self.pids.is_empty() {
            return;
        }
        let pids = std::mem::take(&mut self.pids);
        info!("stopping {} shell child(ren)", pids.len());

        pids.iter().for_each(|&pid| signal_group(pid, Signal::SIGTERM));

        let deadline = Instant::now() + grace;
        let mut running: Vec<u32> = pids.into_iter().collect();
        loop {
            running.retain(|&pid| still_running(pid));
            if running.is_empty() || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(25));
        }

        for pid in running {
            warn!(pid, "shell child outlived SIGTERM, killing");
            signal_group(pid, Signal::SIGKILL);
        }
    }
}

/// Keeps a child in [`SHELL_CHILDREN`] until dropped.
#[derive(Debug)]
pub struct TrackedChild {
    pid: u32,
}

impl TrackedChild {
    pub fn new(pid: u32) -> Self {
        lock_children().insert(pid);
        Self { pid }
    }
}

impl Drop for TrackedChild {
    fn drop(&mut self) {
        lock_children().remove(self.pid);
    }
}

/// The registry, even if a holder panicked
fn lock_children() -> std::sync::MutexGuard<'static, ShellChildren> {
    SHELL_CHILDREN.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Signal the group led by `pid`; if there is no such group, the process.
fn signal_group(pid: u32, sig: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if kill(Pid::from_raw(-raw), sig).is_ok() {
        return;
    }
    if let Err(e) = kill(Pid::from_raw(raw), sig) {
        debug!(pid, "could not deliver {:?}: {}", sig, e);
    }
}

/// Whether `pid` exists and has not yet exited (zombies count as exited)
fn still_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if kill(Pid::from_raw(raw), None).is_err() {
        return false;
    }
    // /proc/<pid>/stat: "pid (comm) S ..."; the state follows the last ')'
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            let state = stat.rsplit_once(')')?.1.trim_start().chars().next()?;
            Some(!matches!(state, 'Z' | 'X'))
        })
        .unwrap_or(true)
}

/// Stop tracked shell children and exit with `128 + signal` on SIGINT,
/// SIGTERM or SIGHUP. Call once at startup.
pub fn install_signal_handlers() -> std::io::Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!("received signal {}, stopping shell children", sig);
                lock_children().shutdown(SHUTDOWN_GRACE);
                std::process::exit(128 + sig);
            }
        })?;
    Ok(())
}

/// Spawn-time isolation for shell children
pub trait ShellIsolation {
    /// Make the child lead a new process group and receive SIGTERM when
    /// fanout exits.
    fn own_process_group(&mut self) -> &mut Self;
}

impl ShellIsolation for Command {
    fn own_process_group(&mut self) -> &mut Self {
        // SAFETY: only async-signal-safe calls (setpgid, prctl) run between
        // fork and exec.
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                #[cfg(target_os = "linux")]
                {
                    if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
        self
    }
}
