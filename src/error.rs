//! Crate-level error type.
//!
//! Each subsystem has its own error enum; `EngineError` is what callers of the
//! top-level entry points (sequencer, connectors, configuration) see.

use crate::config::ConfigurationError;
use crate::database::PersistenceError;
use crate::events::BusError;
use crate::remote::RemoteError;
use crate::state_machine::StepError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Event error: {0}")]
    Event(#[from] BusError),

    #[error("Remote command error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Step error: {0}")]
    Step(#[from] StepError),
}

impl EngineError {
    /// True for lookups of a build that does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Persistence(PersistenceError::NotFound { .. }))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
