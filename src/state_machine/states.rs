use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one build step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Constructed, not yet started
    #[default]
    Created,
    /// Deciding whether the step runs
    EvaluatingDoStepIf,
    /// Gate said no; the action will not run
    Skipped,
    /// Action in flight
    Running,
    /// Result known, deciding visibility
    EvaluatingHideStepIf,
    Finished,
}

impl StepState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::EvaluatingDoStepIf => write!(f, "evaluating_do_step_if"),
            Self::Skipped => write!(f, "skipped"),
            Self::Running => write!(f, "running"),
            Self::EvaluatingHideStepIf => write!(f, "evaluating_hide_step_if"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

impl std::str::FromStr for StepState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "evaluating_do_step_if" => Ok(Self::EvaluatingDoStepIf),
            "skipped" => Ok(Self::Skipped),
            "running" => Ok(Self::Running),
            "evaluating_hide_step_if" => Ok(Self::EvaluatingHideStepIf),
            "finished" => Ok(Self::Finished),
            _ => Err(format!("Invalid step state: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal() {
        assert!(StepState::Finished.is_terminal());
        assert!(!StepState::Skipped.is_terminal());
        assert!(!StepState::Running.is_terminal());
    }

    #[test]
    fn test_string_round_trip() {
        for state in [
            StepState::Created,
            StepState::EvaluatingDoStepIf,
            StepState::Skipped,
            StepState::Running,
            StepState::EvaluatingHideStepIf,
            StepState::Finished,
        ] {
            assert_eq!(state.to_string().parse::<StepState>().unwrap(), state);
        }
        assert!("bogus".parse::<StepState>().is_err());
    }
}
