//! Fanning an action out to every host of the requested groups
//!
//! Each address gets one dispatch task (a "tentacle"):
//!
//! ```text
//! Connecting ──connect failed──────────────────────────────┐
//!     │                                                    ▼
//!     └─> Acting (hostname lookup ‖ action) ─> Closed ─> Reported
//! ```
//!
//! Tasks run on a bounded pool of worker threads. Their results are
//! streamed back to the caller's report callback as each host finishes, in
//! whatever order they finish.

use crate::action::Action;
use crate::error::{FanoutError, Result};
use crate::groups;
use crate::remote::{Actor, Transport};
use crate::report::{fallback_hostname, HostResult};
use crossbeam_channel::unbounded;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use strum::Display;
use tracing::{debug, info, warn};

/// Default ceiling on hosts worked on at once
pub const DEFAULT_MAX_HOSTS: usize = 256;

const HOSTNAME_COMMAND: &str = "hostname";

/// Where a dispatch task is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TentacleStage {
    Connecting,
    Acting,
    Closed,
    Reported,
}

/// Closes its actor exactly once, on every exit path.
struct ActorGuard {
    actor: Box<dyn Actor>,
}

impl ActorGuard {
    fn actor(&self) -> &dyn Actor {
        self.actor.as_ref()
    }
}

impl Drop for ActorGuard {
    fn drop(&mut self) {
        let host = self.actor.host().to_string();
        if let Err(e) = self.actor.close() {
            warn!(host = %host, "failed to close connection: {}", e);
        }
        debug!(host = %host, stage = %TentacleStage::Closed);
    }
}

/// Runs actions against every address of a set of host groups.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    max_hosts: usize,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            max_hosts: DEFAULT_MAX_HOSTS,
        }
    }

    /// Limit how many hosts are worked on at once (at least one).
    pub fn with_max_hosts(mut self, max_hosts: usize) -> Self {
        self.max_hosts = max_hosts.max(1);
        self
    }

    /// Resolve `groups` from `groups_file` and perform `action` on every
    /// address, passing each host's result to `report` as it arrives.
    ///
    /// Returns the number of hosts whose result carries an error. Only a
    /// resolution failure is an `Err`; in that case no host is contacted.
    pub fn run<A: Action>(
        &self,
        groups: &[String],
        groups_file: &Path,
        action: &A,
        report: impl FnMut(&HostResult),
    ) -> Result<usize> {
        let addresses = groups::resolve(groups, groups_file)?;
        Ok(self.dispatch(&addresses, action, report))
    }

    /// Perform `action` on each of `addresses`. Returns the error count.
    pub fn dispatch<A: Action>(
        &self,
        addresses: &[String],
        action: &A,
        mut report: impl FnMut(&HostResult),
    ) -> usize {
        if addresses.is_empty() {
            return 0;
        }
        let workers = self.max_hosts.min(addresses.len());
        info!("dispatching to {} host(s) with {} worker(s)", addresses.len(), workers);

        let (addr_tx, addr_rx) = unbounded::<&str>();
        for addr in addresses {
            // receiver is alive in this scope
            let _ = addr_tx.send(addr.as_str());
        }
        drop(addr_tx);

        let (result_tx, result_rx) = unbounded::<HostResult>();
        let errors = thread::scope(|s| {
            for _ in 0..workers {
                let addr_rx = addr_rx.clone();
                let result_tx = result_tx.clone();
                s.spawn(move || {
                    for addr in addr_rx.iter() {
                        // the actor guard still closes the connection while unwinding
                        let result =
                            panic::catch_unwind(AssertUnwindSafe(|| self.tentacle(addr, action)));
                        let result = result.unwrap_or_else(|payload| {
                            let detail = panic_message(&*payload);
                            warn!(host = addr, "host work panicked: {}", detail);
                            HostResult::unreachable(
                                addr,
                                FanoutError::HostPanicked {
                                    host: addr.to_string(),
                                    detail,
                                },
                            )
                        });
                        if result_tx.send(result).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            let mut errors = 0;
            for _ in 0..addresses.len() {
                let Ok(result) = result_rx.recv() else {
                    break;
                };
                if result.is_err() {
                    errors += 1;
                }
                report(&result);
                debug!(host = %result.address, stage = %TentacleStage::Reported);
            }
            errors
        });

        info!("{} of {} host(s) reported an error", errors, addresses.len());
        errors
    }

    /// Connect to one host, then look up its name while performing `action`.
    fn tentacle<A: Action>(&self, addr: &str, action: &A) -> HostResult {
        debug!(host = addr, stage = %TentacleStage::Connecting);
        let guard = match self.transport.connect(addr) {
            Ok(actor) => ActorGuard { actor },
            Err(e) => {
                warn!(host = addr, "{}", e);
                return HostResult::unreachable(addr, e);
            }
        };

        debug!(host = addr, stage = %TentacleStage::Acting);
        let (hostname, outcome) = thread::scope(|s| {
            let lookup = s.spawn(|| lookup_hostname(guard.actor()));
            let outcome = action.perform(guard.actor());
            let hostname = lookup
                .join()
                .ok()
                .flatten()
                .unwrap_or_else(|| fallback_hostname(addr));
            (hostname, outcome)
        });
        drop(guard);

        if let Some(e) = &outcome.error {
            warn!(host = addr, "action failed: {}", e);
        }
        HostResult::from_outcome(addr, hostname, outcome)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The host's own name, or None if it could not be fetched.
fn lookup_hostname(actor: &dyn Actor) -> Option<String> {
    debug!(host = actor.host(), "looking up hostname");
    let out = actor.run_command(HOSTNAME_COMMAND);
    if let Some(e) = out.error {
        debug!(host = actor.host(), "hostname lookup failed: {}", e);
        return None;
    }
    let name = out.stdout.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
