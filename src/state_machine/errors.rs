use super::states::StepState;
use crate::orchestration::failure_reporter::Failure;
use crate::remote::RemoteError;
use thiserror::Error;

/// Ways a step's action can end other than with a result
#[derive(Debug, Error)]
pub enum StepError {
    /// Expected failure; the step ends in FAILURE and nothing is reported
    #[error("{0}")]
    Failed(String),

    /// Anything else escaping a predicate or action
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Several independent causes, reported together
    #[error("{} failures, first: {}", .0.len(), .0.first().map(ToString::to_string).unwrap_or_default())]
    Multiple(Vec<StepError>),

    #[error("Step was cancelled")]
    Cancelled,

    #[error("Invalid step transition from {from} on {event}")]
    InvalidTransition { from: StepState, event: String },
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Remote(RemoteError::Cancelled))
    }

    /// Unexpected errors are reported; expected failures and cancellation are not
    pub fn is_reportable(&self) -> bool {
        !matches!(self, Self::Failed(_)) && !self.is_cancellation()
    }

    /// Failure value handed to the reporter, sub-failures included
    pub fn to_failure(&self) -> Failure {
        match self {
            Self::Unexpected(e) => Failure::from_anyhow(e),
            Self::Remote(e) => Failure::from_error(e),
            Self::Multiple(errors) => Failure::aggregate(errors.iter().map(Self::to_failure).collect())
                .unwrap_or_else(|| Failure::new("StepError", self.to_string())),
            other => Failure::new("StepError", other.to_string()),
        }
    }
}

pub type StepResult<T> = Result<T, StepError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(!StepError::failed("exit 1").is_reportable());
        assert!(!StepError::Cancelled.is_reportable());
        assert!(!StepError::Remote(RemoteError::Cancelled).is_reportable());
        assert!(StepError::Remote(RemoteError::Timeout(std::time::Duration::from_secs(1))).is_reportable());
        assert!(StepError::Unexpected(anyhow::anyhow!("boom")).is_reportable());
    }

    #[test]
    fn test_multiple_aggregates_sub_failures() {
        let error = StepError::Multiple(vec![
            StepError::Unexpected(anyhow::anyhow!("first")),
            StepError::Unexpected(anyhow::anyhow!("second")),
        ]);
        let failure = error.to_failure();
        assert_eq!(failure.value(), "first");
        assert_eq!(failure.sub_failures(), ["first", "second"]);
    }
}
