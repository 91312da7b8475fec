//! # Orchestration
//!
//! Pieces that sit around the step state machine: classifying command
//! output, reporting unexpected failures and sequencing a build's steps.

pub mod failure_reporter;
pub mod log_evaluator;
pub mod sequencer;

pub use failure_reporter::{
    Failure, FailureLocation, FailureRecord, FailureReporter, FailureSink, MemoryFailureSink,
    TracingFailureSink,
};
pub use log_evaluator::{LogEvaluator, LogMatcher, LogRule};
pub use sequencer::{accumulate, BuildPlan, BuildSequencer, BuildSummary};
