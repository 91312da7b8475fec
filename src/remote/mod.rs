//! # Remote Command Dispatch
//!
//! Master-side half of the master/worker command protocol: the per-connection
//! reference table, the command channel that tracks one in-flight command, and
//! the shell command specialization.

pub mod broker;
pub mod command;
pub mod shell;
pub mod worker;

pub use broker::{Luid, ProcessUniqueId, ReferenceTable};
pub use command::{CommandArgs, CommandListener, CommandOutcome, CommandUpdate, RemoteCommand};
pub use shell::{RemoteShellCommand, ShellCommand, SHELL_COMMAND};
pub use worker::WorkerConnection;

use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("Worker {worker} refused command {command}: {reason}")]
    DispatchFailed {
        worker: String,
        command: String,
        reason: String,
    },

    #[error("Remote command failed on worker: {0}")]
    RemoteFailure(String),

    #[error("Lost connection to worker {0}")]
    ConnectionLost(String),

    #[error("Command {0} was already dispatched")]
    AlreadyStarted(String),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Command cancelled")]
    Cancelled,
}
