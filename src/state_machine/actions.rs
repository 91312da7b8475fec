//! Step actions: what a step does once its gate lets it run.

use super::errors::{StepError, StepResult};
use super::predicates::StepSnapshot;
use crate::orchestration::log_evaluator::LogEvaluator;
use crate::remote::{RemoteShellCommand, WorkerConnection};
use crate::results::BuildResult;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything an action may use while it runs
#[derive(Clone, Default)]
pub struct StepContext {
    pub build_id: Option<i64>,
    pub step_number: usize,
    pub worker: Option<Arc<dyn WorkerConnection>>,
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Applied to shell actions that declare no timeout of their own
    pub default_command_timeout: Option<Duration>,
}

impl StepContext {
    pub fn new(build_id: Option<i64>, step_number: usize) -> Self {
        Self {
            build_id,
            step_number,
            ..Self::default()
        }
    }

    pub fn with_worker(mut self, worker: Arc<dyn WorkerConnection>) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn with_properties(mut self, properties: BTreeMap<String, serde_json::Value>) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_default_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_command_timeout = timeout;
        self
    }

    /// Snapshot handed to gating predicates
    pub fn snapshot(&self, step_name: &str) -> StepSnapshot {
        StepSnapshot {
            name: step_name.to_string(),
            build_id: self.build_id,
            step_number: self.step_number,
            properties: self.properties.clone(),
        }
    }
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("build_id", &self.build_id)
            .field("step_number", &self.step_number)
            .field("worker", &self.worker.as_ref().map(|w| w.name().to_string()))
            .field("default_command_timeout", &self.default_command_timeout)
            .finish_non_exhaustive()
    }
}

/// Trait for implementing the body of a step
#[async_trait]
pub trait StepAction: Send + Sync {
    /// Run the action and produce the step's result.
    ///
    /// Implementations must watch `cancel` and return
    /// [`StepError::Cancelled`] promptly once it fires, after releasing
    /// anything they hold.
    async fn execute(&self, ctx: &StepContext, cancel: &CancellationToken)
        -> StepResult<BuildResult>;

    /// Get a description of this action for logging
    fn description(&self) -> String;
}

/// Runs a shell command on the build's worker and classifies its output
#[derive(Debug, Clone)]
pub struct ShellCommandAction {
    command: RemoteShellCommand,
    evaluator: LogEvaluator,
    timeout: Option<Duration>,
}

impl ShellCommandAction {
    pub fn new(command: RemoteShellCommand) -> Self {
        Self {
            command,
            evaluator: LogEvaluator::default(),
            timeout: None,
        }
    }

    pub fn with_evaluator(mut self, evaluator: LogEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command(&self) -> &RemoteShellCommand {
        &self.command
    }
}

#[async_trait]
impl StepAction for ShellCommandAction {
    async fn execute(
        &self,
        ctx: &StepContext,
        cancel: &CancellationToken,
    ) -> StepResult<BuildResult> {
        let worker = ctx
            .worker
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No worker attached to run `{}`", self.command.command().display()))?;

        let remote = self.command.to_remote_command();
        let timeout = self.timeout.or(ctx.default_command_timeout);
        let outcome = remote.run(worker.as_ref(), cancel, timeout).await?;

        let result = self.evaluator.evaluate(&outcome);
        tracing::debug!(
            worker = %worker.name(),
            command = %self.command.command().display(),
            rc = outcome.rc,
            result = %result,
            "Shell command evaluated"
        );
        Ok(result)
    }

    fn description(&self) -> String {
        format!("shell: {}", self.command.command().display())
    }
}

pub type LocalFn =
    Arc<dyn Fn(StepContext) -> BoxFuture<'static, StepResult<BuildResult>> + Send + Sync>;

/// Runs in the master process without a worker
#[derive(Clone)]
pub struct LocalAction {
    description: String,
    body: LocalFn,
}

impl LocalAction {
    pub fn new<F, Fut>(description: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = StepResult<BuildResult>> + Send + 'static,
    {
        use futures::FutureExt;
        Self {
            description: description.into(),
            body: Arc::new(move |ctx: StepContext| f(ctx).boxed()),
        }
    }

    /// Action that immediately yields the declared `result`
    pub fn returning(result: BuildResult) -> Self {
        Self::new(format!("declared result {result}"), move |_| async move {
            Ok(result)
        })
    }
}

#[async_trait]
impl StepAction for LocalAction {
    async fn execute(
        &self,
        ctx: &StepContext,
        cancel: &CancellationToken,
    ) -> StepResult<BuildResult> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StepError::Cancelled),
            result = (self.body)(ctx.clone()) => result,
        }
    }

    fn description(&self) -> String {
        self.description.clone()
    }
}

impl fmt::Debug for LocalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalAction")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}
