use super::{
    actions::StepContext,
    errors::StepResult,
    events::{determine_target_state, StepEvent},
    states::StepState,
    step::BuildStep,
};
use crate::capture_failure;
use crate::events::{BusMessage, MessageBus, StepMessage};
use crate::logging::log_step_operation;
use crate::orchestration::failure_reporter::{Failure, FailureReporter};
use crate::results::BuildResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Terminal summary of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub name: String,
    pub step_number: usize,
    pub result: BuildResult,
    pub hidden: bool,
    pub status_text: Vec<String>,
}

/// Drives a single step from `Created` to `Finished`.
///
/// Gate errors and unexpected action errors end the step in EXCEPTION and are
/// reported once each; an error from `hide_step_if` is reported but leaves
/// the result alone. Cancellation ends the step in CANCELLED without
/// evaluating any further predicate.
pub struct StepStateMachine {
    step: BuildStep,
    ctx: StepContext,
    bus: Arc<dyn MessageBus>,
    reporter: FailureReporter,
    state: StepState,
    result: Option<BuildResult>,
    hidden: bool,
}

impl StepStateMachine {
    pub fn new(
        step: BuildStep,
        ctx: StepContext,
        bus: Arc<dyn MessageBus>,
        reporter: FailureReporter,
    ) -> Self {
        Self {
            step,
            ctx,
            bus,
            reporter,
            state: StepState::Created,
            result: None,
            hidden: false,
        }
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    pub fn result(&self) -> Option<BuildResult> {
        self.result
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn step(&self) -> &BuildStep {
        &self.step
    }

    fn transition(&mut self, event: StepEvent) -> StepResult<StepState> {
        let target = determine_target_state(self.state, event)?;
        tracing::trace!(
            step = %self.step.name(),
            from = %self.state,
            to = %target,
            event = event.event_type(),
            "Step transition"
        );
        self.state = target;
        Ok(target)
    }

    /// Run the step to completion. Only fails when the step was already run.
    pub async fn run(&mut self, cancel: &CancellationToken) -> StepResult<StepOutcome> {
        if cancel.is_cancelled() {
            return self.finish_cancelled();
        }
        self.transition(StepEvent::Begin)?;
        self.publish_started();
        log_step_operation("start", self.ctx.build_id, self.step.name(), "running", None);

        let snapshot = self.ctx.snapshot(self.step.name());
        let do_step_if = self.step.do_step_if().clone();
        let gate = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            gate = do_step_if.evaluate(&snapshot, None) => Some(gate),
        };
        let Some(gate) = gate else {
            return self.finish_cancelled();
        };

        let result = match gate {
            Ok(false) => {
                self.transition(StepEvent::Skip)?;
                self.transition(StepEvent::Conclude)?;
                BuildResult::Skipped
            }
            Ok(true) => {
                self.transition(StepEvent::Start)?;
                let Some(result) = self.run_action(cancel).await else {
                    return self.finish_cancelled();
                };
                self.transition(StepEvent::Conclude)?;
                result
            }
            Err(e) => {
                let failure = capture_failure!(Failure::from_anyhow(&e));
                self.report(&failure, "doStepIf");
                self.transition(StepEvent::GateFailed)?;
                BuildResult::Exception
            }
        };

        if cancel.is_cancelled() {
            return self.finish_cancelled();
        }
        let hide_step_if = self.step.hide_step_if().clone();
        let hide = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            hide = hide_step_if.evaluate(&snapshot, Some(result)) => Some(hide),
        };
        self.hidden = match hide {
            None => return self.finish_cancelled(),
            Some(Ok(hidden)) => hidden,
            Some(Err(e)) => {
                let failure = capture_failure!(Failure::from_anyhow(&e));
                self.report(&failure, "hideStepIf");
                false
            }
        };

        self.transition(StepEvent::Finish)?;
        Ok(self.conclude(result))
    }

    /// `None` when the action was cancelled
    async fn run_action(&mut self, cancel: &CancellationToken) -> Option<BuildResult> {
        let action = Arc::clone(self.step.action());
        tracing::debug!(
            step = %self.step.name(),
            action = %action.description(),
            "Running step action"
        );

        match action.execute(&self.ctx, cancel).await {
            Ok(result) => Some(result),
            Err(e) if e.is_cancellation() => None,
            Err(e) if e.is_reportable() => {
                let failure = capture_failure!(e.to_failure());
                self.report(&failure, "action");
                Some(BuildResult::Exception)
            }
            Err(e) => {
                tracing::info!(step = %self.step.name(), reason = %e, "Step failed");
                Some(BuildResult::Failure)
            }
        }
    }

    fn finish_cancelled(&mut self) -> StepResult<StepOutcome> {
        self.transition(StepEvent::Cancel)?;
        self.hidden = false;
        tracing::info!(step = %self.step.name(), "Step cancelled");
        Ok(self.conclude(BuildResult::Cancelled))
    }

    fn conclude(&mut self, result: BuildResult) -> StepOutcome {
        self.result = Some(result);
        let outcome = StepOutcome {
            name: self.step.name().to_string(),
            step_number: self.ctx.step_number,
            result,
            hidden: self.hidden,
            status_text: self.step.status_text(result),
        };

        if let Some(build_id) = self.ctx.build_id {
            self.publish(BusMessage::StepFinished(StepMessage {
                build_id,
                step_number: outcome.step_number,
                name: outcome.name.clone(),
                results: Some(result),
                hidden: outcome.hidden,
                text: outcome.status_text.clone(),
            }));
        }
        log_step_operation(
            "finish",
            self.ctx.build_id,
            self.step.name(),
            result.name(),
            Some(&outcome.status_text.join(" ")),
        );
        outcome
    }

    fn report(&self, failure: &Failure, stage: &str) {
        let why = format!("BuildStep {} raised in {stage}", self.step.name());
        let record = self.reporter.report(failure, Some(&why));
        tracing::warn!(
            step = %self.step.name(),
            stage,
            failure_type = %record.failure_type,
            value = %record.value,
            "Unexpected error in step"
        );
    }

    fn publish_started(&self) {
        if let Some(build_id) = self.ctx.build_id {
            self.publish(BusMessage::StepStarted(StepMessage {
                build_id,
                step_number: self.ctx.step_number,
                name: self.step.name().to_string(),
                results: None,
                hidden: false,
                text: vec![self.step.name().to_string()],
            }));
        }
    }

    fn publish(&self, message: BusMessage) {
        if let Err(e) = self.bus.produce(message) {
            tracing::warn!(step = %self.step.name(), error = %e, "Failed to publish step event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryMessageBus;
    use crate::orchestration::failure_reporter::MemoryFailureSink;
    use crate::state_machine::actions::LocalAction;
    use crate::state_machine::errors::StepError;
    use crate::state_machine::predicates::GatingPredicate;
    use crate::utils::clock::FixedClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        bus: Arc<InMemoryMessageBus>,
        sink: Arc<MemoryFailureSink>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                bus: Arc::new(InMemoryMessageBus::default()),
                sink: Arc::new(MemoryFailureSink::new()),
            }
        }

        fn machine(&self, step: BuildStep) -> StepStateMachine {
            let reporter =
                FailureReporter::new(self.sink.clone(), Arc::new(FixedClock::at_epoch(1_000)));
            StepStateMachine::new(step, StepContext::new(Some(1), 0), self.bus.clone(), reporter)
        }
    }

    fn counting_action(calls: &Arc<AtomicUsize>, result: BuildResult) -> LocalAction {
        let calls = Arc::clone(calls);
        LocalAction::new("count", move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(result) }
        })
    }

    #[tokio::test]
    async fn test_success_path() {
        let harness = Harness::new();
        let mut machine = harness.machine(BuildStep::builder("compile").build().unwrap());

        let outcome = machine.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.result, BuildResult::Success);
        assert_eq!(outcome.status_text, vec!["compile"]);
        assert!(!outcome.hidden);
        assert_eq!(machine.state(), StepState::Finished);

        let events: Vec<_> = harness
            .bus
            .productions()
            .into_iter()
            .map(|(key, _)| key.to_string())
            .collect();
        assert_eq!(
            events,
            vec![
                "(builds, 1, steps, 0, started)",
                "(builds, 1, steps, 0, finished)"
            ]
        );
    }

    #[tokio::test]
    async fn test_do_step_if_false_skips_action() {
        let harness = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let step = BuildStep::builder("compile")
            .do_step_if(false)
            .action(counting_action(&calls, BuildResult::Success))
            .build()
            .unwrap();

        let outcome = harness.machine(step).run(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.result, BuildResult::Skipped);
        assert_eq!(outcome.status_text, vec!["compile", "skipped"]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(harness.sink.is_empty());
    }

    #[tokio::test]
    async fn test_raising_gate_is_exception() {
        let harness = Harness::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let step = BuildStep::builder("compile")
            .do_step_if(GatingPredicate::from_fn(|| anyhow::bail!("bad predicate")))
            .action(counting_action(&calls, BuildResult::Success))
            .build()
            .unwrap();

        let outcome = harness.machine(step).run(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.result, BuildResult::Exception);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(harness.sink.len(), 1);

        let record = &harness.sink.records()[0];
        assert_eq!(record["method"], "run");
        assert!(!record["messages"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hide_step_if_sees_result() {
        let harness = Harness::new();
        let step = BuildStep::builder("compile")
            .action(LocalAction::returning(BuildResult::Warnings))
            .hide_step_if(GatingPredicate::from_result_fn(|result, _| {
                Ok(result == Some(BuildResult::Warnings))
            }))
            .build()
            .unwrap();

        let outcome = harness.machine(step).run(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.result, BuildResult::Warnings);
        assert!(outcome.hidden);
    }

    #[tokio::test]
    async fn test_hide_step_if_error_keeps_result() {
        let harness = Harness::new();
        let step = BuildStep::builder("compile")
            .hide_step_if(GatingPredicate::from_fn(|| anyhow::bail!("hide exploded")))
            .build()
            .unwrap();

        let outcome = harness.machine(step).run(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.result, BuildResult::Success);
        assert!(!outcome.hidden);
        assert_eq!(harness.sink.len(), 1);
    }

    #[tokio::test]
    async fn test_expected_failure_not_reported() {
        let harness = Harness::new();
        let step = BuildStep::builder("test")
            .action(LocalAction::new("fail", |_| async {
                Err(StepError::failed("3 tests failed"))
            }))
            .build()
            .unwrap();

        let outcome = harness.machine(step).run(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.result, BuildResult::Failure);
        assert_eq!(outcome.status_text, vec!["test", "failed"]);
        assert!(harness.sink.is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_action_error_reported_with_chain() {
        let harness = Harness::new();
        let step = BuildStep::builder("upload")
            .action(LocalAction::new("upload", |_| async {
                Err(StepError::Multiple(vec![
                    StepError::Unexpected(anyhow::anyhow!("disk full")),
                    StepError::Unexpected(anyhow::anyhow!("quota exceeded")),
                ]))
            }))
            .build()
            .unwrap();

        let outcome = harness.machine(step).run(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.result, BuildResult::Exception);

        let record = &harness.sink.records()[0];
        let messages = record["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], "[disk full");
        assert_eq!(messages[1], "quota exceeded]");
        assert_eq!(record["header"], "BuildStep upload raised in action");
    }

    #[tokio::test]
    async fn test_lost_worker_is_reported_as_exception() {
        let harness = Harness::new();
        let step = BuildStep::builder("compile")
            .action(LocalAction::new("remote", |_| async {
                Err(StepError::Remote(crate::remote::RemoteError::ConnectionLost(
                    "w1".to_string(),
                )))
            }))
            .build()
            .unwrap();

        let outcome = harness.machine(step).run(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.result, BuildResult::Exception);
        assert_eq!(harness.sink.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_run() {
        let harness = Harness::new();
        let hide_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hide_calls);
        let step = BuildStep::builder("compile")
            .hide_step_if(GatingPredicate::from_fn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }))
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = harness.machine(step).run(&cancel).await.unwrap();
        assert_eq!(outcome.result, BuildResult::Cancelled);
        assert_eq!(outcome.status_text, vec!["compile", "cancelled"]);
        assert_eq!(hide_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_terminal_state_is_permanent() {
        let harness = Harness::new();
        let mut machine = harness.machine(BuildStep::builder("compile").build().unwrap());
        machine.run(&CancellationToken::new()).await.unwrap();

        let err = machine.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StepError::InvalidTransition { .. }));
        assert_eq!(machine.result(), Some(BuildResult::Success));
    }
}
