use super::errors::StepError;
use super::states::StepState;
use serde::{Deserialize, Serialize};

/// Events that drive a step through its states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEvent {
    /// Start evaluating `do_step_if`
    Begin,
    /// `do_step_if` was false
    Skip,
    /// `do_step_if` was true
    Start,
    /// `do_step_if` raised; the action is skipped
    GateFailed,
    /// The step's result is known
    Conclude,
    /// `hide_step_if` evaluated
    Finish,
    Cancel,
}

impl StepEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::Skip => "skip",
            Self::Start => "start",
            Self::GateFailed => "gate_failed",
            Self::Conclude => "conclude",
            Self::Finish => "finish",
            Self::Cancel => "cancel",
        }
    }
}

/// Target state for `event` in state `from`
pub fn determine_target_state(from: StepState, event: StepEvent) -> Result<StepState, StepError> {
    let target = match (from, event) {
        (StepState::Created, StepEvent::Begin) => StepState::EvaluatingDoStepIf,

        (StepState::EvaluatingDoStepIf, StepEvent::Skip) => StepState::Skipped,
        (StepState::EvaluatingDoStepIf, StepEvent::Start) => StepState::Running,
        (StepState::EvaluatingDoStepIf, StepEvent::GateFailed) => StepState::EvaluatingHideStepIf,

        (StepState::Skipped | StepState::Running, StepEvent::Conclude) => {
            StepState::EvaluatingHideStepIf
        }

        (StepState::EvaluatingHideStepIf, StepEvent::Finish) => StepState::Finished,

        (from, StepEvent::Cancel) if !from.is_terminal() => StepState::Finished,

        (from, event) => {
            return Err(StepError::InvalidTransition {
                from,
                event: event.event_type().to_string(),
            })
        }
    };
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_path() {
        let mut state = StepState::Created;
        for event in [StepEvent::Begin, StepEvent::Start, StepEvent::Conclude, StepEvent::Finish] {
            state = determine_target_state(state, event).unwrap();
        }
        assert_eq!(state, StepState::Finished);
    }

    #[test]
    fn test_skip_path() {
        let state = determine_target_state(StepState::EvaluatingDoStepIf, StepEvent::Skip).unwrap();
        assert_eq!(state, StepState::Skipped);
        let state = determine_target_state(state, StepEvent::Conclude).unwrap();
        assert_eq!(state, StepState::EvaluatingHideStepIf);
    }

    #[test]
    fn test_gate_failure_skips_running() {
        assert_eq!(
            determine_target_state(StepState::EvaluatingDoStepIf, StepEvent::GateFailed).unwrap(),
            StepState::EvaluatingHideStepIf
        );
    }

    #[test]
    fn test_cancel_from_any_active_state() {
        for state in [StepState::Created, StepState::Running, StepState::EvaluatingHideStepIf] {
            assert_eq!(
                determine_target_state(state, StepEvent::Cancel).unwrap(),
                StepState::Finished
            );
        }
    }

    #[test]
    fn test_finished_is_permanent() {
        for event in [StepEvent::Begin, StepEvent::Start, StepEvent::Cancel, StepEvent::Finish] {
            assert!(matches!(
                determine_target_state(StepState::Finished, event),
                Err(StepError::InvalidTransition { .. })
            ));
        }
    }
}
