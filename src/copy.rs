//! Copying local files and trees to a remote directory
//!
//! A copy runs in two phases per host:
//!
//! 1. Every source is classified and directory sources are walked. Remote
//!    sub-directories are created as they are found and each regular file
//!    becomes a [`CopyJob`]. A directory that cannot be created remotely is
//!    skipped along with everything under it.
//! 2. The jobs are drained by a worker pool. Each job holds a [`FilePermit`]
//!    for as long as its local file is open, so the number of open local
//!    files stays under the shared [`FilePermits`] ceiling no matter how many
//!    hosts copy at once.
//!
//! Every failure is scoped to one path and collected; sibling paths carry on.

use crate::action::Action;
use crate::error::FanoutError;
use crate::paths::abs_path;
use crate::remote::{remote_join, Actor, Outcome};
use crossbeam_channel::unbounded;
use nix::sys::resource::{getrlimit, Resource};
use std::collections::BTreeSet;
use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Ceiling on copy worker threads per host
pub const MAX_COPY_WORKERS: usize = 64;

/// Ceiling on open local files when the descriptor limit allows more
pub const MAX_OPEN_FILES: usize = 512;

const REMOTE_DIR_MODE: u32 = 0o755;

#[derive(Debug, Default)]
struct PermitCounts {
    in_use: usize,
    peak: usize,
}

/// Counting semaphore over open local files, shared by every copy of a run.
#[derive(Debug)]
pub struct FilePermits {
    capacity: usize,
    counts: Mutex<PermitCounts>,
    released: Condvar,
}

impl FilePermits {
    /// A pool of `capacity` permits (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            counts: Mutex::new(PermitCounts::default()),
            released: Condvar::new(),
        }
    }

    /// A pool sized from the process's open-file limit.
    pub fn from_rlimit() -> Self {
        Self::new(Self::default_capacity())
    }

    /// `min(512, soft RLIMIT_NOFILE / 2)`, never below one.
    pub fn default_capacity() -> usize {
        match getrlimit(Resource::RLIMIT_NOFILE) {
            Ok((soft, _hard)) => {
                let half = usize::try_from(soft / 2).unwrap_or(usize::MAX);
                half.clamp(1, MAX_OPEN_FILES)
            }
            Err(e) => {
                warn!("could not read open file limit, assuming {}: {}", MAX_OPEN_FILES, e);
                MAX_OPEN_FILES
            }
        }
    }

    /// Block until a permit is free and take it.
    pub fn acquire(&self) -> FilePermit<'_> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        while counts.in_use >= self.capacity {
            counts = self
                .released
                .wait(counts)
                .unwrap_or_else(PoisonError::into_inner);
        }
        counts.in_use += 1;
        counts.peak = counts.peak.max(counts.in_use);
        FilePermit { permits: self }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently held
    pub fn in_use(&self) -> usize {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner).in_use
    }

    /// Highest number of permits ever held at once
    pub fn peak(&self) -> usize {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner).peak
    }
}

/// A held permit; released on drop.
#[derive(Debug)]
pub struct FilePermit<'a> {
    permits: &'a FilePermits,
}

impl Drop for FilePermit<'_> {
    fn drop(&mut self) {
        let mut counts = self
            .permits
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        counts.in_use = counts.in_use.saturating_sub(1);
        self.permits.released.notify_one();
    }
}

/// One local file bound for one remote path
#[derive(Debug, Clone)]
struct CopyJob {
    local: PathBuf,
    remote: String,
    /// Index of the source this file came from
    source: usize,
}

/// A path-scoped failure, attributed to the source it came from
#[derive(Debug)]
struct PathFailure {
    source: usize,
    message: String,
}

/// Copies local files and directories into a remote directory.
#[derive(Debug, Clone)]
pub struct FileCopier {
    sources: Vec<String>,
    remote_dir: String,
    recursive: bool,
    permits: Arc<FilePermits>,
}

impl FileCopier {
    pub fn new(
        sources: Vec<String>,
        remote_dir: impl Into<String>,
        recursive: bool,
        permits: Arc<FilePermits>,
    ) -> Self {
        Self {
            sources,
            remote_dir: remote_dir.into(),
            recursive,
            permits,
        }
    }

    /// Classify one source and walk it, creating remote directories and
    /// queueing its files.
    fn plan_source(
        &self,
        actor: &dyn Actor,
        index: usize,
        raw: &str,
        jobs: &mut Vec<CopyJob>,
        failures: &mut Vec<PathFailure>,
    ) {
        let mut fail = |message: String| {
            debug!(host = actor.host(), "{}", message);
            failures.push(PathFailure {
                source: index,
                message,
            });
        };

        let source = match abs_path(raw) {
            Ok(p) => p,
            Err(e) => return fail(format!("cannot use source {}: {}", raw, e)),
        };
        let meta = match std::fs::metadata(&source) {
            Ok(m) => m,
            Err(e) => {
                return fail(format!(
                    "could not get info about source path {}: {}",
                    source.display(),
                    e
                ));
            }
        };
        if meta.is_dir() && !self.recursive {
            return fail(format!(
                "skipping local path {}: it is a directory and recursive copy is not enabled",
                source.display()
            ));
        }

        // Remote paths keep the source's own name: relative to its parent
        let base = source.parent().unwrap_or(&source).to_path_buf();
        let mut walk = WalkDir::new(&source).sort_by_file_name().into_iter();
        while let Some(entry) = walk.next() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    let path = e.path().unwrap_or(source.as_path()).display().to_string();
                    fail(format!("could not access local path {}: {}", path, e));
                    continue;
                }
            };
            let remote = remote_join(&self.remote_dir, &relative_remote(entry.path(), &base));

            if entry.file_type().is_dir() {
                let mode = entry
                    .metadata()
                    .map(|m| m.permissions().mode())
                    .unwrap_or(REMOTE_DIR_MODE);
                if let Err(e) = actor.create_remote_dir(&remote, mode) {
                    fail(e.to_string());
                    walk.skip_current_dir();
                }
            } else {
                jobs.push(CopyJob {
                    local: entry.path().to_path_buf(),
                    remote,
                    source: index,
                });
            }
        }
    }

    /// Drain `jobs` through a bounded worker pool.
    fn run_jobs(&self, actor: &dyn Actor, jobs: Vec<CopyJob>) -> Vec<PathFailure> {
        if jobs.is_empty() {
            return Vec::new();
        }
        let workers = MAX_COPY_WORKERS
            .min(self.permits.capacity())
            .min(jobs.len());
        info!(
            host = actor.host(),
            "copying {} file(s) with {} worker(s)",
            jobs.len(),
            workers
        );

        let (job_tx, job_rx) = unbounded::<CopyJob>();
        for job in jobs {
            // receiver is alive in this scope
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        std::thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    let job_rx = job_rx.clone();
                    s.spawn(move || {
                        let mut failed = Vec::new();
                        for job in job_rx.iter() {
                            if let Err(message) = self.copy_one(actor, &job) {
                                debug!(host = actor.host(), "{}", message);
                                failed.push(PathFailure {
                                    source: job.source,
                                    message,
                                });
                            }
                        }
                        failed
                    })
                })
                .collect();

            let mut failures = Vec::new();
            for handle in handles {
                match handle.join() {
                    Ok(mut failed) => failures.append(&mut failed),
                    Err(_) => failures.push(PathFailure {
                        source: usize::MAX,
                        message: "copy worker panicked".to_string(),
                    }),
                }
            }
            failures
        })
    }

    fn copy_one(&self, actor: &dyn Actor, job: &CopyJob) -> Result<(), String> {
        // Declared before the file so the file is closed first
        let _permit = self.permits.acquire();
        let mut local = File::open(&job.local).map_err(|e| {
            format!(
                "could not open local file {} for reading: {}",
                job.local.display(),
                e
            )
        })?;
        let meta = local
            .metadata()
            .map_err(|e| format!("could not stat local file {}: {}", job.local.display(), e))?;
        actor
            .copy_file_to_remote(&mut local, &job.remote, &meta)
            .map_err(|e| format!("failed to copy {}: {}", job.local.display(), e))
    }
}

/// `path` relative to `base`, as a `/`-separated string
fn relative_remote(path: &Path, base: &Path) -> String {
    let rel = path.strip_prefix(base).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .filter(|c| c != "/")
        .collect::<Vec<_>>()
        .join("/")
}

impl Action for FileCopier {
    fn perform(&self, actor: &dyn Actor) -> Outcome {
        info!(host = actor.host(), "ensuring remote dir {}", self.remote_dir);
        if let Err(e) = actor.create_remote_dir(&self.remote_dir, REMOTE_DIR_MODE) {
            return Outcome::failed(e);
        }

        let mut jobs = Vec::new();
        let mut failures = Vec::new();
        for (index, raw) in self.sources.iter().enumerate() {
            self.plan_source(actor, index, raw, &mut jobs, &mut failures);
        }
        failures.extend(self.run_jobs(actor, jobs));

        let failed_sources: BTreeSet<usize> = failures.iter().map(|f| f.source).collect();
        let total = self.sources.len();
        let copied = total.saturating_sub(failed_sources.len());

        let mut outcome = Outcome::ok(format!(
            "copied {} of {} source(s) to {}\n",
            copied, total, self.remote_dir
        ));
        if !failures.is_empty() {
            for failure in &failures {
                outcome.stderr.push_str(&failure.message);
                outcome.stderr.push('\n');
            }
            outcome.error = Some(FanoutError::CopyFailed {
                failed: failures.len(),
            });
        }
        outcome
    }
}
