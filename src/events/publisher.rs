use super::{BusError, BusMessage, RoutingFilter, RoutingKey};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Callback invoked for every delivered message whose key matches the filter
pub type ConsumerCallback = Arc<dyn Fn(&RoutingKey, &BusMessage) + Send + Sync>;

/// Publish/subscribe contract used by the engine to broadcast lifecycle events
pub trait MessageBus: Send + Sync {
    /// Publish a payload under a routing key
    fn publish(&self, routing_key: RoutingKey, message: BusMessage) -> Result<(), BusError>;

    /// Register a consumer; dropping the returned handle does not cancel it
    fn subscribe(
        &self,
        filter: RoutingFilter,
        callback: ConsumerCallback,
    ) -> Result<Subscription, BusError>;

    /// Publish a payload under its own routing key
    fn produce(&self, message: BusMessage) -> Result<(), BusError> {
        self.publish(message.routing_key(), message)
    }
}

struct Consumer {
    filter: RoutingFilter,
    callback: ConsumerCallback,
}

/// Handle for an active consumer
pub struct Subscription {
    id: Uuid,
    filter: RoutingFilter,
    consumers: Weak<DashMap<Uuid, Consumer>>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn filter(&self) -> &RoutingFilter {
        &self.filter
    }

    /// Stop consuming. Cancelling twice, or after the bus is gone, is a no-op.
    pub fn cancel(&self) {
        if let Some(consumers) = self.consumers.upgrade() {
            consumers.remove(&self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .finish()
    }
}

/// In-process bus. Delivers synchronously to matching consumers and keeps a
/// bounded log of everything produced.
pub struct InMemoryMessageBus {
    consumers: Arc<DashMap<Uuid, Consumer>>,
    productions: Mutex<VecDeque<(RoutingKey, BusMessage)>>,
    capacity: usize,
    verify_messages: bool,
}

impl InMemoryMessageBus {
    pub fn new(capacity: usize, verify_messages: bool) -> Self {
        Self {
            consumers: Arc::new(DashMap::new()),
            productions: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            verify_messages,
        }
    }

    pub fn from_config(config: &crate::config::EventConfig) -> Self {
        Self::new(config.production_log_capacity, config.verify_messages)
    }

    /// Everything produced so far, oldest first
    pub fn productions(&self) -> Vec<(RoutingKey, BusMessage)> {
        self.productions.lock().iter().cloned().collect()
    }

    /// Drain the production log
    pub fn take_productions(&self) -> Vec<(RoutingKey, BusMessage)> {
        self.productions.lock().drain(..).collect()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Deliver a message straight to consumers without recording it as a
    /// production. Fails when no consumer matches.
    pub fn deliver(&self, routing_key: &RoutingKey, message: &BusMessage) -> Result<(), BusError> {
        if self.verify_messages {
            message.verify(routing_key)?;
        }
        if self.dispatch(routing_key, message) == 0 {
            return Err(BusError::NoConsumer(routing_key.to_string()));
        }
        Ok(())
    }

    fn dispatch(&self, routing_key: &RoutingKey, message: &BusMessage) -> usize {
        // Collect first so callbacks may subscribe or cancel without holding shard locks
        let callbacks: Vec<ConsumerCallback> = self
            .consumers
            .iter()
            .filter(|entry| entry.filter.matches(routing_key))
            .map(|entry| Arc::clone(&entry.callback))
            .collect();

        for callback in &callbacks {
            callback(routing_key, message);
        }
        callbacks.len()
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new(1000, true)
    }
}

impl MessageBus for InMemoryMessageBus {
    fn publish(&self, routing_key: RoutingKey, message: BusMessage) -> Result<(), BusError> {
        if self.verify_messages {
            message.verify(&routing_key)?;
        }

        {
            let mut productions = self.productions.lock();
            if productions.len() == self.capacity {
                productions.pop_front();
            }
            productions.push_back((routing_key.clone(), message.clone()));
        }

        let delivered = self.dispatch(&routing_key, &message);
        tracing::trace!(routing_key = %routing_key, delivered, "Message published");
        Ok(())
    }

    fn subscribe(
        &self,
        filter: RoutingFilter,
        callback: ConsumerCallback,
    ) -> Result<Subscription, BusError> {
        if filter.parts().is_empty() {
            return Err(BusError::InvalidFilter(filter.to_string()));
        }

        let id = Uuid::new_v4();
        self.consumers.insert(
            id,
            Consumer {
                filter: filter.clone(),
                callback,
            },
        );
        Ok(Subscription {
            id,
            filter,
            consumers: Arc::downgrade(&self.consumers),
        })
    }
}
