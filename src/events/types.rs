//! Closed set of payloads carried on the message bus.
//!
//! Every payload knows the routing key it belongs under, and
//! [`BusMessage::verify`] checks a (key, payload) pair before it is published
//! or delivered.

use super::{BusError, RoutingKey};
use crate::results::BuildResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const BUILDS_EXCHANGE: &str = "builds";
pub const STEPS_SEGMENT: &str = "steps";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildMessage {
    pub build_id: i64,
    pub build_request_id: i64,
    pub number: i64,
    pub worker_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub results: Option<BuildResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMessage {
    pub build_id: i64,
    pub step_number: usize,
    pub name: String,
    pub results: Option<BuildResult>,
    pub hidden: bool,
    pub text: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BusMessage {
    BuildNew(BuildMessage),
    BuildFinished(BuildMessage),
    StepStarted(StepMessage),
    StepFinished(StepMessage),
}

impl BusMessage {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::BuildNew(_) => "new",
            Self::BuildFinished(_) => "finished",
            Self::StepStarted(_) => "started",
            Self::StepFinished(_) => "finished",
        }
    }

    /// The routing key this payload is published under
    pub fn routing_key(&self) -> RoutingKey {
        let parts = match self {
            Self::BuildNew(m) | Self::BuildFinished(m) => vec![
                BUILDS_EXCHANGE.to_string(),
                m.build_id.to_string(),
                self.event_type().to_string(),
            ],
            Self::StepStarted(m) | Self::StepFinished(m) => vec![
                BUILDS_EXCHANGE.to_string(),
                m.build_id.to_string(),
                STEPS_SEGMENT.to_string(),
                m.step_number.to_string(),
                self.event_type().to_string(),
            ],
        };
        RoutingKey::from_vec(parts)
    }

    /// Check the payload against the key it is travelling under
    pub fn verify(&self, routing_key: &RoutingKey) -> Result<(), BusError> {
        let expected = self.routing_key();
        if &expected != routing_key {
            return Err(BusError::InvalidMessage {
                routing_key: routing_key.to_string(),
                reason: format!("{} payload belongs under {expected}", self.event_type()),
            });
        }

        let missing = match self {
            Self::BuildNew(m) if m.finished_at.is_some() || m.results.is_some() => {
                Some("new build must not carry finish data")
            }
            Self::BuildFinished(m) if m.finished_at.is_none() => Some("finished_at is required"),
            Self::BuildFinished(m) if m.results.is_none() => Some("results is required"),
            Self::StepStarted(m) if m.results.is_some() => {
                Some("started step must not carry results")
            }
            Self::StepFinished(m) if m.results.is_none() => Some("results is required"),
            Self::StepStarted(m) | Self::StepFinished(m) if m.name.is_empty() => {
                Some("step name must not be empty")
            }
            _ => None,
        };

        match missing {
            Some(reason) => Err(BusError::InvalidMessage {
                routing_key: routing_key.to_string(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }
}
