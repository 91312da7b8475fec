use crate::remote::{
    CommandArgs, CommandUpdate, Luid, ReferenceTable, RemoteError, WorkerConnection,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// How the worker answers one dispatched command
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerScript {
    /// Stream `updates`, report `rc` and complete
    Complete { updates: Vec<CommandUpdate>, rc: i32 },
    /// Like `Complete`, then signal completion a second time
    CompleteTwice { rc: i32 },
    /// Complete with a remote-side failure
    Fail(String),
    /// Accept the command and never answer
    Hang,
    /// Refuse to start the command
    Refuse(String),
}

impl WorkerScript {
    pub fn exit(rc: i32) -> Self {
        Self::Complete {
            updates: Vec::new(),
            rc,
        }
    }

    pub fn output(stdout: &str, rc: i32) -> Self {
        Self::Complete {
            updates: vec![CommandUpdate::Stdout(stdout.to_string())],
            rc,
        }
    }
}

/// A command the worker was asked to start
#[derive(Debug, Clone, PartialEq)]
pub struct StartedCommand {
    pub luid: Luid,
    pub command: String,
    pub args: CommandArgs,
}

/// In-process worker that answers commands from a script.
///
/// Answers are delivered from a spawned task through the reference table,
/// the same way a real connection calls back into registered objects.
pub struct ScriptedWorker {
    name: String,
    broker: Arc<ReferenceTable>,
    scripts: Mutex<VecDeque<WorkerScript>>,
    fallback: WorkerScript,
    started: Mutex<Vec<StartedCommand>>,
    interrupts: Mutex<Vec<(Luid, String)>>,
}

impl ScriptedWorker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            broker: Arc::new(ReferenceTable::new()),
            scripts: Mutex::new(VecDeque::new()),
            fallback: WorkerScript::exit(0),
            started: Mutex::new(Vec::new()),
            interrupts: Mutex::new(Vec::new()),
        }
    }

    /// Answer the next command with `script`
    pub fn with_script(self, script: WorkerScript) -> Self {
        self.scripts.lock().push_back(script);
        self
    }

    /// Answer used once the queued scripts run out
    pub fn with_fallback(mut self, script: WorkerScript) -> Self {
        self.fallback = script;
        self
    }

    pub fn started(&self) -> Vec<StartedCommand> {
        self.started.lock().clone()
    }

    pub fn interrupts(&self) -> Vec<(Luid, String)> {
        self.interrupts.lock().clone()
    }

    pub fn reference_table(&self) -> &Arc<ReferenceTable> {
        &self.broker
    }
}

#[async_trait]
impl WorkerConnection for ScriptedWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn broker(&self) -> Arc<ReferenceTable> {
        Arc::clone(&self.broker)
    }

    async fn start_command(
        &self,
        luid: Luid,
        command: &str,
        args: &CommandArgs,
    ) -> Result<(), RemoteError> {
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        self.started.lock().push(StartedCommand {
            luid,
            command: command.to_string(),
            args: args.clone(),
        });

        let (updates, rc, completions, failure) = match script {
            WorkerScript::Refuse(reason) => {
                return Err(RemoteError::DispatchFailed {
                    worker: self.name.clone(),
                    command: command.to_string(),
                    reason,
                })
            }
            WorkerScript::Hang => return Ok(()),
            WorkerScript::Complete { updates, rc } => (updates, Some(rc), 1, None),
            WorkerScript::CompleteTwice { rc } => (Vec::new(), Some(rc), 2, None),
            WorkerScript::Fail(reason) => (Vec::new(), None, 1, Some(reason)),
        };

        let broker = Arc::clone(&self.broker);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let Some(listener) = broker.lookup(luid) else {
                return;
            };
            let mut updates = updates;
            if let Some(rc) = rc {
                updates.push(CommandUpdate::Rc(rc));
            }
            if !updates.is_empty() {
                listener.remote_update(updates);
            }
            for _ in 0..completions {
                listener.remote_complete(failure.clone());
            }
        });
        Ok(())
    }

    async fn interrupt_command(&self, luid: Luid, why: &str) -> Result<(), RemoteError> {
        self.interrupts.lock().push((luid, why.to_string()));
        Ok(())
    }
}
