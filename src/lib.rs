//! fanout library
//!
//! Resolves host groups from a shell-syntax groups file and runs an action
//! (a command, or a file copy) on every host of those groups at once, with
//! each host's failure kept to its own result.

pub mod action;
pub mod cli;
pub mod copy;
pub mod dispatch;
pub mod error;
pub mod groups;
pub mod paths;
pub mod process_guard;
pub mod remote;
pub mod report;
pub mod settings;
pub mod shell;

// Re-export main types for convenience
pub use action::{Action, CommandRunner};
pub use copy::{FileCopier, FilePermit, FilePermits, MAX_COPY_WORKERS};
pub use dispatch::{Dispatcher, TentacleStage, DEFAULT_MAX_HOSTS};
pub use error::{FanoutError, Result};
pub use groups::GroupsFile;
pub use process_guard::{ShellIsolation, TrackedChild};
pub use remote::ssh::{SshConfig, SshTransport};
pub use remote::{Actor, Outcome, Transport};
pub use report::{exit_status, fallback_hostname, HostResult};
pub use settings::{Settings, SettingsLayer};
