//! # Build Step State Machine
//!
//! One [`StepStateMachine`] per step:
//! `Created -> EvaluatingDoStepIf -> {Skipped | Running} -> EvaluatingHideStepIf -> Finished`.
//! Cancellation jumps straight to `Finished` from any non-terminal state.

pub mod actions;
pub mod errors;
pub mod events;
pub mod predicates;
pub mod states;
pub mod step;
pub mod step_state_machine;

pub use actions::{LocalAction, ShellCommandAction, StepAction, StepContext};
pub use errors::{StepError, StepResult};
pub use events::StepEvent;
pub use predicates::{GatingPredicate, StepSnapshot};
pub use states::StepState;
pub use step::{BuildStep, BuildStepBuilder, CommandConfig, LogRuleConfig, StepConfig};
pub use step_state_machine::{StepOutcome, StepStateMachine};
