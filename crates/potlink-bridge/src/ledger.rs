use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use hashbrown::HashMap;
use hashbrown::hash_map::Entry;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tracing::{debug, error, info, warn};

use crate::config::LedgerRetention;
use crate::error::{Error, ErrorKind, Result};
use crate::unix_seconds;

/// The status of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// The request has been published and no reply has arrived yet.
    Pending,
    /// A reply has been delivered to the caller.
    Delivered,
    /// The call deadline elapsed without a reply.
    Timeout,
    /// The call failed.
    Error,
    /// The caller cancelled the call.
    Cancelled,
}

impl CallStatus {
    /// Whether the call has left the pending state.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        })
    }
}

/// The durable record of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCall {
    /// Response topic, identifying the call.
    pub response_topic: String,
    /// Topic the request has been published on.
    pub request_topic: String,
    /// Request payload.
    pub payload: Value,
    /// Call status.
    pub status: CallStatus,
    /// Creation time, in seconds since the Unix epoch.
    pub created_at: u64,
    /// Time the call left the pending state, in seconds since the Unix
    /// epoch.
    pub settled_at: Option<u64>,
}

impl PendingCall {
    /// Creates a [`PendingCall`] in the pending state.
    #[must_use]
    pub fn new(
        request_topic: impl Into<String>,
        response_topic: impl Into<String>,
        payload: Value,
        created_at: u64,
    ) -> Self {
        Self {
            response_topic: response_topic.into(),
            request_topic: request_topic.into(),
            payload,
            status: CallStatus::Pending,
            created_at,
            settled_at: None,
        }
    }
}

/// A durable store of call records, keyed by response topic.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Inserts a new record.
    async fn insert(&self, call: PendingCall) -> Result<()>;

    /// Moves a pending record to the given status.
    ///
    /// Returns `false` when the record is missing or already settled, in
    /// which case it is left untouched.
    async fn settle(&self, response_topic: &str, status: CallStatus, at: u64) -> Result<bool>;

    /// Deletes a record.
    ///
    /// Returns `false` when the record is missing.
    async fn delete(&self, response_topic: &str) -> Result<bool>;

    /// Lists all records still in the pending state.
    async fn pending(&self) -> Result<Vec<PendingCall>>;
}

/// An in-memory [`DurableStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    calls: Mutex<HashMap<String, PendingCall>>,
}

impl MemoryStore {
    /// Creates an empty [`MemoryStore`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the record of a call.
    #[must_use]
    pub fn get(&self, response_topic: &str) -> Option<PendingCall> {
        self.lock().get(response_topic).cloned()
    }

    /// Returns all records, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<PendingCall> {
        let mut calls = self.lock().values().cloned().collect::<Vec<_>>();
        calls.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.response_topic.cmp(&b.response_topic))
        });
        calls
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn insert(&self, call: PendingCall) -> Result<()> {
        match self.lock().entry(call.response_topic.clone()) {
            Entry::Occupied(entry) => Err(Error::new(
                ErrorKind::Store,
                format!("A call is already recorded for `{}`", entry.key()),
            )),
            Entry::Vacant(entry) => {
                let _ = entry.insert(call);
                Ok(())
            }
        }
    }

    async fn settle(&self, response_topic: &str, status: CallStatus, at: u64) -> Result<bool> {
        let mut calls = self.lock();
        let Some(call) = calls.get_mut(response_topic) else {
            return Ok(false);
        };
        if call.status.is_settled() {
            return Ok(false);
        }
        call.status = status;
        call.settled_at = Some(at);
        Ok(true)
    }

    async fn delete(&self, response_topic: &str) -> Result<bool> {
        Ok(self.lock().remove(response_topic).is_some())
    }

    async fn pending(&self) -> Result<Vec<PendingCall>> {
        Ok(self
            .calls()
            .into_iter()
            .filter(|call| call.status == CallStatus::Pending)
            .collect())
    }
}

/// The ledger of in-flight calls.
///
/// It only observes calls: store failures are logged and never alter the
/// outcome of a call. A record leaves the pending state exactly once, so
/// marking an already settled call does nothing.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn DurableStore>,
    retention: LedgerRetention,
}

impl Ledger {
    /// Creates a [`Ledger`] writing through the given store.
    #[must_use]
    pub fn new(store: Arc<dyn DurableStore>, retention: LedgerRetention) -> Self {
        Self { store, retention }
    }

    /// Records a new pending call.
    ///
    /// Returns whether the record has been stored.
    pub async fn record_pending(&self, call: PendingCall) -> bool {
        let response_topic = call.response_topic.clone();
        match self.store.insert(call).await {
            Ok(()) => {
                debug!("Call `{response_topic}` recorded as pending");
                true
            }
            Err(e) => {
                error!("Impossible to record call `{response_topic}`: {e}");
                false
            }
        }
    }

    /// Marks a call as delivered.
    pub async fn mark_delivered(&self, response_topic: &str) -> bool {
        self.settle(response_topic, CallStatus::Delivered).await
    }

    /// Marks a call as timed out.
    pub async fn mark_timeout(&self, response_topic: &str) -> bool {
        self.settle(response_topic, CallStatus::Timeout).await
    }

    /// Marks a call as failed.
    pub async fn mark_error(&self, response_topic: &str) -> bool {
        self.settle(response_topic, CallStatus::Error).await
    }

    /// Marks a call as cancelled.
    pub async fn mark_cancelled(&self, response_topic: &str) -> bool {
        self.settle(response_topic, CallStatus::Cancelled).await
    }

    pub(crate) async fn settle(&self, response_topic: &str, status: CallStatus) -> bool {
        match self
            .store
            .settle(response_topic, status, unix_seconds(std::time::SystemTime::now()))
            .await
        {
            Ok(true) => {
                debug!("Call `{response_topic}` marked as {status}");
                if status == CallStatus::Delivered
                    && self.retention == LedgerRetention::DropDelivered
                    && let Err(e) = self.store.delete(response_topic).await
                {
                    warn!("Impossible to drop delivered call `{response_topic}`: {e}");
                }
                true
            }
            Ok(false) => {
                debug!("Call `{response_topic}` is not pending, not marked as {status}");
                false
            }
            Err(e) => {
                error!("Impossible to mark call `{response_topic}` as {status}: {e}");
                false
            }
        }
    }

    /// Marks as timed out all the calls a previous process left pending.
    ///
    /// Returns the number of recovered calls.
    ///
    /// # Errors
    ///
    /// An error is returned when the pending calls cannot be listed.
    pub async fn recover(&self) -> Result<usize> {
        let pending = self.store.pending().await?;

        let mut recovered = 0;
        for call in pending {
            if self.mark_timeout(&call.response_topic).await {
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!("Marked {recovered} stale pending calls as timed out");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use serde_json::json;

    use crate::config::LedgerRetention;
    use crate::error::{Error, ErrorKind, Result};

    use super::{CallStatus, DurableStore, Ledger, MemoryStore, PendingCall};

    fn call(response_topic: &str, created_at: u64) -> PendingCall {
        PendingCall::new("/pot_7/activate", response_topic, json!({ "freq": 3 }), created_at)
    }

    struct BrokenStore;

    #[async_trait]
    impl DurableStore for BrokenStore {
        async fn insert(&self, _call: PendingCall) -> Result<()> {
            Err(Error::new(ErrorKind::Store, "Offline"))
        }

        async fn settle(&self, _: &str, _: CallStatus, _: u64) -> Result<bool> {
            Err(Error::new(ErrorKind::Store, "Offline"))
        }

        async fn delete(&self, _: &str) -> Result<bool> {
            Err(Error::new(ErrorKind::Store, "Offline"))
        }

        async fn pending(&self) -> Result<Vec<PendingCall>> {
            Err(Error::new(ErrorKind::Store, "Offline"))
        }
    }

    #[test]
    fn serialize_call() {
        assert_eq!(
            serde_json::to_value(call("/pot_7/activate/ok/1", 10)).unwrap(),
            json!({
                "responseTopic": "/pot_7/activate/ok/1",
                "requestTopic": "/pot_7/activate",
                "payload": { "freq": 3 },
                "status": "pending",
                "createdAt": 10,
                "settledAt": null,
            })
        );
    }

    #[tokio::test]
    async fn settle_once() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(store.clone(), LedgerRetention::KeepSettled);

        assert!(ledger.record_pending(call("/pot_7/activate/ok/1", 10)).await);
        // Same response topic.
        assert!(!ledger.record_pending(call("/pot_7/activate/ok/1", 11)).await);

        assert!(ledger.mark_timeout("/pot_7/activate/ok/1").await);
        assert!(!ledger.mark_timeout("/pot_7/activate/ok/1").await);
        assert!(!ledger.mark_delivered("/pot_7/activate/ok/1").await);
        assert!(!ledger.mark_error("/pot_7/missing/ok/1").await);

        let recorded = store.get("/pot_7/activate/ok/1").unwrap();
        assert_eq!(recorded.status, CallStatus::Timeout);
        assert_eq!(recorded.created_at, 10);
        assert!(recorded.settled_at.is_some());
    }

    #[tokio::test]
    async fn retention_policies() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(store.clone(), LedgerRetention::DropDelivered);

        assert!(ledger.record_pending(call("/pot_7/activate/ok/1", 1)).await);
        assert!(ledger.record_pending(call("/pot_7/activate/ok/2", 2)).await);

        assert!(ledger.mark_delivered("/pot_7/activate/ok/1").await);
        assert!(ledger.mark_cancelled("/pot_7/activate/ok/2").await);

        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get("/pot_7/activate/ok/2").unwrap().status,
            CallStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn recover_stale_calls() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(store.clone(), LedgerRetention::KeepSettled);

        assert!(ledger.record_pending(call("/pot_7/activate/ok/1", 1)).await);
        assert!(ledger.record_pending(call("/pot_7/activate/ok/2", 2)).await);
        assert!(ledger.record_pending(call("/pot_7/activate/ok/3", 3)).await);
        assert!(ledger.mark_delivered("/pot_7/activate/ok/2").await);

        assert_eq!(ledger.recover().await.unwrap(), 2);
        assert_eq!(ledger.recover().await.unwrap(), 0);

        let statuses = store
            .calls()
            .into_iter()
            .map(|call| call.status)
            .collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![CallStatus::Timeout, CallStatus::Delivered, CallStatus::Timeout]
        );
    }

    #[tokio::test]
    async fn store_failures_are_not_fatal() {
        let ledger = Ledger::new(Arc::new(BrokenStore), LedgerRetention::KeepSettled);

        assert!(!ledger.record_pending(call("/pot_7/activate/ok/1", 1)).await);
        assert!(!ledger.mark_error("/pot_7/activate/ok/1").await);
        assert_eq!(ledger.recover().await.unwrap_err().kind(), ErrorKind::Store);
    }
}
