//! Remote command channel.
//!
//! A [`RemoteCommand`] is dispatched to a worker once. While it runs it is
//! registered in the worker connection's [`ReferenceTable`] so the worker can
//! stream output back and finally signal completion. Completion releases the
//! reference and wakes the dispatcher exactly once; duplicate completion
//! signals are ignored.

use super::broker::{Luid, ProcessUniqueId, ReferenceTable};
use super::worker::WorkerConnection;
use super::RemoteError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

static NEXT_PROCESS_UNIQUE_ID: AtomicU64 = AtomicU64::new(1);

/// Arguments sent along with a command. Absent keys are never sent, so
/// "not set" and "set to null" stay distinguishable on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandArgs(BTreeMap<String, serde_json::Value>);

impl CommandArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// Incremental update streamed back by the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandUpdate {
    Stdout(String),
    Stderr(String),
    Header(String),
    Rc(i32),
}

/// Callback surface the worker side invokes through the reference table
pub trait CommandListener: Send + Sync {
    fn remote_update(&self, updates: Vec<CommandUpdate>);

    /// `failure` carries the remote error text when the command blew up on the
    /// worker rather than exiting normally
    fn remote_complete(&self, failure: Option<String>);
}

/// Everything collected from a finished command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutcome {
    pub rc: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub header: String,
}

impl CommandOutcome {
    pub fn did_fail(&self) -> bool {
        self.rc != Some(0)
    }
}

#[derive(Default)]
struct CommandState {
    outcome: CommandOutcome,
    broker: Option<Arc<ReferenceTable>>,
    completion: Option<oneshot::Sender<Option<String>>>,
    completed: bool,
}

pub struct RemoteCommand {
    remote_command: String,
    args: CommandArgs,
    puid: ProcessUniqueId,
    state: Mutex<CommandState>,
}

impl RemoteCommand {
    pub fn new(remote_command: impl Into<String>, args: CommandArgs) -> Arc<Self> {
        Arc::new(Self {
            remote_command: remote_command.into(),
            args,
            puid: NEXT_PROCESS_UNIQUE_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(CommandState::default()),
        })
    }

    pub fn remote_command(&self) -> &str {
        &self.remote_command
    }

    pub fn args(&self) -> &CommandArgs {
        &self.args
    }

    pub fn process_unique_id(&self) -> ProcessUniqueId {
        self.puid
    }

    /// Output collected so far
    pub fn outcome(&self) -> CommandOutcome {
        self.state.lock().outcome.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().completed
    }

    /// Remember which reference table this command must be released from
    pub fn bind(&self, broker: Arc<ReferenceTable>) {
        self.state.lock().broker = Some(broker);
    }

    /// Bind to `broker` and register this command in it
    pub fn register_with(self: &Arc<Self>, broker: Arc<ReferenceTable>) -> Luid {
        self.bind(Arc::clone(&broker));
        broker.register(self.puid, Arc::clone(self) as Arc<dyn CommandListener>)
    }

    fn release_reference(&self) {
        let broker = self.state.lock().broker.clone();
        if let Some(broker) = broker {
            if !broker.release(self.puid) {
                tracing::debug!(
                    puid = self.puid,
                    "Command reference already released from broker"
                );
            }
        }
    }

    /// Dispatch to `worker` and wait for the completion callback.
    ///
    /// Cancellation and `timeout` interrupt the command on the worker; in every
    /// case the reference is released before this returns.
    pub async fn run(
        self: &Arc<Self>,
        worker: &dyn WorkerConnection,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<CommandOutcome, RemoteError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if state.completed || state.completion.is_some() {
                return Err(RemoteError::AlreadyStarted(self.remote_command.clone()));
            }
            state.completion = Some(tx);
        }

        let luid = self.register_with(worker.broker());
        tracing::debug!(
            worker = %worker.name(),
            command = %self.remote_command,
            puid = self.puid,
            luid,
            "Dispatching remote command"
        );

        if let Err(e) = worker
            .start_command(luid, &self.remote_command, &self.args)
            .await
        {
            self.state.lock().completion = None;
            self.release_reference();
            return Err(e);
        }

        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let interrupted = tokio::select! {
            signal = rx => {
                return match signal {
                    Ok(None) => Ok(self.outcome()),
                    Ok(Some(failure)) => Err(RemoteError::RemoteFailure(failure)),
                    Err(_) => Err(RemoteError::ConnectionLost(worker.name().to_string())),
                };
            }
            _ = cancel.cancelled() => RemoteError::Cancelled,
            _ = deadline => RemoteError::Timeout(timeout.unwrap_or_default()),
        };

        tracing::info!(
            worker = %worker.name(),
            command = %self.remote_command,
            reason = %interrupted,
            "Interrupting remote command"
        );
        if let Err(e) = worker
            .interrupt_command(luid, &interrupted.to_string())
            .await
        {
            tracing::warn!(error = %e, "Failed to deliver interrupt to worker");
        }
        {
            let mut state = self.state.lock();
            state.completion = None;
            state.completed = true;
        }
        self.release_reference();
        Err(interrupted)
    }
}

impl CommandListener for RemoteCommand {
    fn remote_update(&self, updates: Vec<CommandUpdate>) {
        let mut state = self.state.lock();
        if state.completed {
            return;
        }
        for update in updates {
            match update {
                CommandUpdate::Stdout(text) => state.outcome.stdout.push_str(&text),
                CommandUpdate::Stderr(text) => state.outcome.stderr.push_str(&text),
                CommandUpdate::Header(text) => state.outcome.header.push_str(&text),
                CommandUpdate::Rc(rc) => state.outcome.rc = Some(rc),
            }
        }
    }

    fn remote_complete(&self, failure: Option<String>) {
        let completion = {
            let mut state = self.state.lock();
            if state.completed {
                tracing::debug!(puid = self.puid, "Ignoring duplicate completion signal");
                return;
            }
            state.completed = true;
            state.completion.take()
        };

        self.release_reference();

        if let Some(tx) = completion {
            // The dispatcher may already be gone (cancelled); nothing to wake then.
            let _ = tx.send(failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_complete_unregisters_reference() {
        let broker = Arc::new(ReferenceTable::new());
        let cmd = RemoteCommand::new("shell", CommandArgs::new());
        cmd.register_with(Arc::clone(&broker));
        assert_eq!(broker.len(), 1);

        cmd.remote_complete(None);

        assert!(broker.is_empty());
        assert!(broker.registered().is_empty());
    }

    #[test]
    fn test_remote_complete_when_reference_not_in_broker() {
        let broker = Arc::new(ReferenceTable::new());
        let unrelated = RemoteCommand::new("shell", CommandArgs::new());
        let unrelated_luid = unrelated.register_with(Arc::clone(&broker));

        let cmd = RemoteCommand::new("shell", CommandArgs::new());
        cmd.bind(Arc::clone(&broker));
        cmd.remote_complete(None);

        assert_eq!(broker.len(), 1);
        assert_eq!(
            broker.registered().get(&unrelated.process_unique_id()),
            Some(&unrelated_luid)
        );
    }

    #[test]
    fn test_duplicate_completion_is_noop() {
        let broker = Arc::new(ReferenceTable::new());
        let cmd = RemoteCommand::new("shell", CommandArgs::new());
        cmd.register_with(Arc::clone(&broker));

        cmd.remote_complete(None);
        cmd.remote_complete(Some("late disconnect".to_string()));

        assert!(cmd.is_complete());
        assert!(broker.is_empty());
    }

    #[test]
    fn test_updates_accumulate() {
        let cmd = RemoteCommand::new("shell", CommandArgs::new());
        cmd.remote_update(vec![
            CommandUpdate::Stdout("Normal stdout text\n".to_string()),
            CommandUpdate::Stderr("warning: x".to_string()),
        ]);
        cmd.remote_update(vec![
            CommandUpdate::Stdout("an error".to_string()),
            CommandUpdate::Rc(1),
        ]);

        let outcome = cmd.outcome();
        assert_eq!(outcome.stdout, "Normal stdout text\nan error");
        assert_eq!(outcome.stderr, "warning: x");
        assert_eq!(outcome.rc, Some(1));
        assert!(outcome.did_fail());
    }

    #[test]
    fn test_args_omit_unset_keys() {
        let mut args = CommandArgs::new();
        args.insert("command", "make");
        let json = serde_json::to_value(&args).unwrap();
        assert_eq!(json, serde_json::json!({"command": "make"}));
    }
}
