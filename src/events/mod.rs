//! # Lifecycle Events
//!
//! Build and step lifecycle events are published on a topic bus keyed by
//! string tuples. Consumers register positional filters where `None` is a
//! wildcard. Payloads come from the closed [`BusMessage`] set and are verified
//! against their routing key at the publish boundary.

pub mod publisher;
pub mod routing;
pub mod types;

pub use publisher::{ConsumerCallback, InMemoryMessageBus, MessageBus, Subscription};
pub use routing::{RoutingFilter, RoutingKey};
pub use types::{BuildMessage, BusMessage, StepMessage};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Invalid routing key: {0}")]
    InvalidRoutingKey(String),

    #[error("{0} is not a filter")]
    InvalidFilter(String),

    #[error("Message under {routing_key} failed verification: {reason}")]
    InvalidMessage { routing_key: String, reason: String },

    #[error("No consumer found for {0}")]
    NoConsumer(String),
}
