use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;

use bytes::Bytes;

use hashbrown::HashSet;

use crate::error::Result;

/// An in-process broker, used to exercise the bridge without a network.
pub mod memory;
/// The `MQTT` transport.
pub mod mqtt;

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload.
    pub payload: Bytes,
    /// Reception time.
    pub received_at: SystemTime,
}

impl InboundMessage {
    /// Creates an [`InboundMessage`] received now.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: SystemTime::now(),
        }
    }
}

/// A message to publish on the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Destination topic.
    pub topic: String,
    /// Raw payload.
    pub payload: Bytes,
    /// Topic the receiver is expected to reply on.
    pub response_topic: Option<String>,
    /// Opaque data the receiver echoes back in its reply.
    pub correlation_data: Option<Bytes>,
}

impl OutboundMessage {
    /// Creates an [`OutboundMessage`] which expects no reply.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            response_topic: None,
            correlation_data: None,
        }
    }

    /// Creates a command [`OutboundMessage`] advertising the topic its reply
    /// must be published on.
    #[must_use]
    pub fn request(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        response_topic: impl Into<String>,
        correlation_data: impl Into<Bytes>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            response_topic: Some(response_topic.into()),
            correlation_data: Some(correlation_data.into()),
        }
    }
}

/// The outbound side of a broker connection.
///
/// A [`Transport`] is shared among all callers, so every method takes a
/// shared reference.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publishes a message.
    async fn publish(&self, message: OutboundMessage) -> Result<()>;

    /// Subscribes to a topic filter.
    ///
    /// Returns `false` when the filter was already subscribed, in which case
    /// nothing is sent to the broker.
    async fn subscribe(&self, filter: &str) -> Result<bool>;

    /// Unsubscribes from a topic filter.
    ///
    /// Returns `false` when the filter was not subscribed.
    async fn unsubscribe(&self, filter: &str) -> Result<bool>;

    /// Returns all subscribed topic filters.
    fn subscriptions(&self) -> Vec<String>;

    /// Closes the connection.
    async fn disconnect(&self) -> Result<()>;
}

/// The inbound side of a broker connection.
///
/// It is owned by the single task dispatching inbound messages.
#[async_trait]
pub trait Inbound: Send {
    /// Waits for the next inbound message.
    ///
    /// Returns `None` when the connection is definitively closed.
    async fn recv(&mut self) -> Option<InboundMessage>;
}

// The set of subscribed topic filters, shared among the two sides of a
// connection so that they can be replayed after a reconnection.
#[derive(Debug, Clone, Default)]
pub(crate) struct Subscriptions(Arc<Mutex<HashSet<String>>>);

impl Subscriptions {
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, filter: &str) -> bool {
        self.lock().insert(filter.to_string())
    }

    pub(crate) fn remove(&self, filter: &str) -> bool {
        self.lock().remove(filter)
    }

    pub(crate) fn any_matches(&self, topic: &str) -> bool {
        self.lock()
            .iter()
            .any(|filter| potlink::topic::matches_filter(filter, topic))
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        let mut filters = self.lock().iter().cloned().collect::<Vec<_>>();
        filters.sort_unstable();
        filters
    }
}
