//! Units of work performed on each host

use crate::remote::{Actor, Outcome};

/// Something to do on one host through its [`Actor`].
///
/// One action value is shared by every host of a run, hence `Sync`.
pub trait Action: Sync {
    fn perform(&self, actor: &dyn Actor) -> Outcome;
}

/// Runs one shell command on the host.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    command: String,
}

impl CommandRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

impl Action for CommandRunner {
    fn perform(&self, actor: &dyn Actor) -> Outcome {
        actor.run_command(&self.command)
    }
}
