use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hashbrown::HashMap;
use hashbrown::hash_map::Entry;

use serde_json::{Map, Value};

use tokio::sync::oneshot;

use tracing::debug;

use crate::error::{Error, ErrorKind, Result};

/// What a [`Waiter`] receives: the decoded reply object, or the error raised
/// while decoding it.
pub type Delivery = Result<Map<String, Value>>;

/// The map from response topics to the callers waiting on them.
///
/// Each response topic has at most one live [`Waiter`], and each waiter
/// receives at most one [`Delivery`].
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    waiters: Mutex<HashMap<String, oneshot::Sender<Delivery>>>,
}

impl CorrelationRegistry {
    /// Creates an empty [`CorrelationRegistry`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Delivery>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a [`Waiter`] for a response topic.
    ///
    /// # Errors
    ///
    /// An [`ErrorKind::Registry`] error is returned when a waiter is already
    /// registered for the same response topic.
    pub fn register(self: &Arc<Self>, response_topic: impl Into<String>) -> Result<Waiter> {
        let response_topic = response_topic.into();
        let (sender, receiver) = oneshot::channel();

        match self.lock().entry(response_topic.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::new(
                    ErrorKind::Registry,
                    format!("A waiter is already registered for `{response_topic}`"),
                ));
            }
            Entry::Vacant(entry) => {
                let _ = entry.insert(sender);
            }
        }

        Ok(Waiter {
            registry: Arc::clone(self),
            response_topic,
            receiver,
            received: false,
            released: false,
        })
    }

    /// Hands a [`Delivery`] to the waiter registered for the response topic.
    ///
    /// Returns `false` when no waiter is registered, which happens for late
    /// or duplicate replies: in that case nothing happens.
    pub fn fulfill(&self, response_topic: &str, delivery: Delivery) -> bool {
        // The lock is held while sending, so a concurrent release either
        // prevents the delivery or finds it already in the channel.
        let mut waiters = self.lock();
        let Some(sender) = waiters.remove(response_topic) else {
            debug!("No waiter registered for `{response_topic}`");
            return false;
        };
        sender.send(delivery).is_ok()
    }

    /// Removes the waiter registered for the response topic.
    ///
    /// Returns `false` when no waiter is registered.
    pub fn release(&self, response_topic: &str) -> bool {
        self.lock().remove(response_topic).is_some()
    }

    /// Whether a waiter is registered for the response topic.
    #[must_use]
    pub fn contains(&self, response_topic: &str) -> bool {
        self.lock().contains_key(response_topic)
    }

    /// Returns the number of registered waiters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no waiter is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes all registered waiters.
    ///
    /// Every waiter still waiting wakes up without a delivery.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// The receiving end of a registered response topic.
///
/// Dropping a [`Waiter`] releases its response topic.
#[derive(Debug)]
pub struct Waiter {
    registry: Arc<CorrelationRegistry>,
    response_topic: String,
    receiver: oneshot::Receiver<Delivery>,
    received: bool,
    released: bool,
}

impl Waiter {
    /// Returns the response topic.
    #[must_use]
    pub fn response_topic(&self) -> &str {
        &self.response_topic
    }

    /// Waits for the [`Delivery`].
    ///
    /// Returns `None` when the waiter has been removed from the registry
    /// without a delivery, or when the delivery has already been received.
    ///
    /// This method is cancel safe.
    pub async fn wait(&mut self) -> Option<Delivery> {
        if self.received {
            return None;
        }
        let delivery = (&mut self.receiver).await.ok();
        self.received = true;
        delivery
    }

    /// Releases the response topic.
    ///
    /// Returns the [`Delivery`] which arrived before the release, if any and
    /// not yet received through [`Waiter::wait`].
    pub fn release(mut self) -> Option<Delivery> {
        let _ = self.registry.release(&self.response_topic);
        self.released = true;
        if self.received {
            return None;
        }
        self.receiver.try_recv().ok()
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if !self.released && self.registry.release(&self.response_topic) {
            debug!("Released `{}` on drop", self.response_topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Map, Value, json};

    use crate::error::{Error, ErrorKind};

    use super::CorrelationRegistry;

    fn reply(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn fulfill_waiter() {
        let registry = Arc::new(CorrelationRegistry::new());
        let mut waiter = registry.register("/pot_7/activate/ok/1").unwrap();

        assert_eq!(waiter.response_topic(), "/pot_7/activate/ok/1");
        assert!(registry.contains("/pot_7/activate/ok/1"));

        assert!(registry.fulfill(
            "/pot_7/activate/ok/1",
            Ok(reply(json!({ "status": "ok" })))
        ));
        // A duplicate reply finds no waiter.
        assert!(!registry.fulfill(
            "/pot_7/activate/ok/1",
            Ok(reply(json!({ "status": "ok" })))
        ));

        assert_eq!(
            waiter.wait().await,
            Some(Ok(reply(json!({ "status": "ok" }))))
        );
        assert_eq!(waiter.wait().await, None);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn duplicate_registration() {
        let registry = Arc::new(CorrelationRegistry::new());
        let _waiter = registry.register("/pot_7/activate/ok/1").unwrap();

        assert_eq!(
            registry.register("/pot_7/activate/ok/1").unwrap_err().kind(),
            ErrorKind::Registry
        );
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn fulfill_after_release() {
        let registry = Arc::new(CorrelationRegistry::new());
        let waiter = registry.register("/pot_9/activate/ok/1").unwrap();

        assert_eq!(waiter.release(), None);
        assert!(!registry.fulfill(
            "/pot_9/activate/ok/1",
            Ok(reply(json!({ "status": "ok" })))
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn release_returns_raced_delivery() {
        let registry = Arc::new(CorrelationRegistry::new());
        let waiter = registry.register("/pot_9/activate/ok/1").unwrap();

        let error = Error::new(ErrorKind::MalformedPayload, "Not an object");
        assert!(registry.fulfill("/pot_9/activate/ok/1", Err(error.clone())));

        assert_eq!(waiter.release(), Some(Err(error)));
    }

    #[tokio::test]
    async fn drop_releases_waiter() {
        let registry = Arc::new(CorrelationRegistry::new());

        {
            let _waiter = registry.register("/pot_1/water/ok/1").unwrap();
            assert_eq!(registry.len(), 1);
        }

        assert!(registry.is_empty());
        assert!(!registry.release("/pot_1/water/ok/1"));
    }

    #[tokio::test]
    async fn clear_wakes_waiters() {
        let registry = Arc::new(CorrelationRegistry::new());
        let mut waiter = registry.register("/pot_1/water/ok/1").unwrap();

        registry.clear();

        assert_eq!(waiter.wait().await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_waiters() {
        let registry = Arc::new(CorrelationRegistry::new());

        let waiters = (0..32)
            .map(|i| registry.register(format!("/pot_7/activate/ok/{i}")).unwrap())
            .collect::<Vec<_>>();

        let handles = waiters
            .into_iter()
            .enumerate()
            .map(|(i, mut waiter)| {
                tokio::spawn(async move {
                    let reply = waiter.wait().await.unwrap().unwrap();
                    assert_eq!(reply.get("call"), Some(&json!(i)));
                })
            })
            .collect::<Vec<_>>();

        for i in (0..32).rev() {
            assert!(registry.fulfill(
                &format!("/pot_7/activate/ok/{i}"),
                Ok(reply(json!({ "status": "ok", "call": i })))
            ));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(registry.is_empty());
    }
}
