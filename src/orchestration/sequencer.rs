//! # Build Sequencer
//!
//! Runs one build's steps strictly in order and folds their results into the
//! build result. A step ending in EXCEPTION does not stop the build; a step
//! flagged `halt_on_failure` that ends in FAILURE or worse does, and so does
//! cancellation.
//!
//! Bookkeeping around the run:
//!
//! 1. a build row is added for every request the build satisfies, all with
//!    the same number, and the other requests are marked merged into the
//!    first; the first request's build is the representative
//! 2. `("builds", id, "new")` is published
//! 3. steps run
//! 4. the representative build is finished with the aggregate result, the
//!    finish time is propagated to the merged siblings and every request is
//!    completed
//! 5. `("builds", id, "finished")` is published
//!
//! Steps 1 and 4 are each a single transaction, so a failed write leaves no
//! half-started or half-finished build behind.

use super::failure_reporter::FailureReporter;
use crate::config::{ConfigurationError, ExecutionConfig};
use crate::database::BuildsConnector;
use crate::error::Result;
use crate::events::{BuildMessage, BusMessage, MessageBus};
use crate::logging::log_build_operation;
use crate::remote::WorkerConnection;
use crate::results::BuildResult;
use crate::state_machine::{BuildStep, StepContext, StepOutcome, StepStateMachine};
use crate::utils::clock::Clock;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Fold one step's result into the build result so far. Skipped steps do
/// not affect the build.
pub fn accumulate(worst: BuildResult, step: BuildResult) -> BuildResult {
    match step {
        BuildResult::Skipped => worst,
        other => worst.worst(other),
    }
}

/// What to run
pub struct BuildPlan {
    /// Requests satisfied by this build; the first is the representative
    pub request_ids: Vec<i64>,
    pub number: i64,
    pub worker: Arc<dyn WorkerConnection>,
    pub steps: Vec<BuildStep>,
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl BuildPlan {
    pub fn new(
        request_ids: Vec<i64>,
        number: i64,
        worker: Arc<dyn WorkerConnection>,
        steps: Vec<BuildStep>,
    ) -> Self {
        Self {
            request_ids,
            number,
            worker,
            steps,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_properties(mut self, properties: BTreeMap<String, serde_json::Value>) -> Self {
        self.properties = properties;
        self
    }
}

/// How a build ended
#[derive(Debug, Clone, PartialEq)]
pub struct BuildSummary {
    /// Representative build
    pub build_id: i64,
    /// One build per request, representative first
    pub build_ids: Vec<i64>,
    pub result: BuildResult,
    pub steps: Vec<StepOutcome>,
    /// A `halt_on_failure` step stopped the build early
    pub halted: bool,
    pub cancelled: bool,
}

#[derive(Clone)]
pub struct BuildSequencer {
    builds: BuildsConnector,
    bus: Arc<dyn MessageBus>,
    reporter: FailureReporter,
    clock: Arc<dyn Clock>,
    config: ExecutionConfig,
}

impl BuildSequencer {
    pub fn new(
        builds: BuildsConnector,
        bus: Arc<dyn MessageBus>,
        reporter: FailureReporter,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            builds,
            bus,
            reporter,
            clock,
            config: ExecutionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn run(&self, plan: BuildPlan, cancel: &CancellationToken) -> Result<BuildSummary> {
        let BuildPlan {
            request_ids,
            number,
            worker,
            steps,
            properties,
        } = plan;

        let Some(&representative) = request_ids.first() else {
            return Err(ConfigurationError::invalid_value(
                "request_ids",
                "a build needs at least one request",
            )
            .into());
        };

        let build_ids = self
            .builds
            .start_merged_builds(&request_ids, number, Some(worker.name()))
            .await?;
        let build_id = build_ids[0];

        let started_at = self.clock.now();
        self.publish(BusMessage::BuildNew(self.build_message(
            build_id,
            representative,
            number,
            worker.name(),
            started_at,
            None,
        )));
        log_build_operation(
            "start",
            Some(build_id),
            Some(representative),
            Some(worker.name()),
            "running",
            Some(&format!("{} steps", steps.len())),
        );

        let mut result = BuildResult::Success;
        let mut outcomes = Vec::with_capacity(steps.len());
        let mut halted = false;

        for (step_number, step) in steps.into_iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }

            let halt_on_failure = step.halt_on_failure();
            let ctx = StepContext::new(Some(build_id), step_number)
                .with_worker(Arc::clone(&worker))
                .with_properties(properties.clone())
                .with_default_command_timeout(self.config.default_command_timeout());
            let mut machine =
                StepStateMachine::new(step, ctx, Arc::clone(&self.bus), self.reporter.clone());

            let outcome = machine.run(cancel).await?;
            result = accumulate(result, outcome.result);
            let step_result = outcome.result;
            outcomes.push(outcome);

            if step_result == BuildResult::Cancelled {
                break;
            }
            if halt_on_failure && step_result.is_failure_or_worse() {
                tracing::info!(
                    build_id,
                    step_number,
                    result = %step_result,
                    "Halting build on step failure"
                );
                halted = true;
                break;
            }
        }

        let cancelled = cancel.is_cancelled();
        if cancelled {
            result = accumulate(result, BuildResult::Cancelled);
        }

        let completion = self
            .builds
            .complete_merged_builds(build_id, &request_ids, number, result)
            .await?;

        self.publish(BusMessage::BuildFinished(self.build_message(
            build_id,
            representative,
            number,
            worker.name(),
            started_at,
            Some((self.clock.now(), result)),
        )));
        log_build_operation(
            "finish",
            Some(build_id),
            Some(representative),
            Some(worker.name()),
            result.name(),
            Some(&format!(
                "{} steps run, {} merged builds finished",
                outcomes.len(),
                completion.merged
            )),
        );

        Ok(BuildSummary {
            build_id,
            build_ids,
            result,
            steps: outcomes,
            halted,
            cancelled,
        })
    }

    fn build_message(
        &self,
        build_id: i64,
        build_request_id: i64,
        number: i64,
        worker_name: &str,
        started_at: DateTime<Utc>,
        finished: Option<(DateTime<Utc>, BuildResult)>,
    ) -> BuildMessage {
        BuildMessage {
            build_id,
            build_request_id,
            number,
            worker_name: worker_name.to_string(),
            started_at,
            finished_at: finished.map(|(at, _)| at),
            results: finished.map(|(_, result)| result),
        }
    }

    fn publish(&self, message: BusMessage) {
        if let Err(e) = self.bus.produce(message) {
            tracing::warn!(error = %e, "Failed to publish build event");
        }
    }
}
