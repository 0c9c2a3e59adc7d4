use std::sync::Arc;
use std::time::{Duration, SystemTime};

use potlink::reply::ReplyOutcome;
use potlink::topic;

use serde_json::{Map, Value};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use tokio_util::sync::{CancellationToken, DropGuard};

use tracing::{debug, error, info, warn};

use uuid::Uuid;

use crate::bootstrap;
use crate::collaborators::{Collaborators, DeviceRegistry};
use crate::config::BridgeConfig;
use crate::correlation::{CorrelationRegistry, Delivery};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, ErrorKind, Result};
use crate::ledger::{CallStatus, Ledger, PendingCall};
use crate::transport::{Inbound, OutboundMessage, Transport, mqtt};
use crate::unix_seconds;

/// A command to send to a device.
#[derive(Debug, Clone)]
pub struct Call {
    topic: String,
    payload: Value,
    timeout: Option<Duration>,
    cancellation: Option<CancellationToken>,
}

impl Call {
    /// Creates a [`Call`] publishing a JSON object on a request topic.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timeout: None,
            cancellation: None,
        }
    }

    /// Sets the time to wait for the reply, replacing the bridge default.
    #[must_use]
    #[inline]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets a token which cancels the call before its deadline.
    #[must_use]
    #[inline]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

// The part of a call which outlives its waiter: the response topic
// subscription and the ledger record.
//
// If the call future is dropped before the call ends, the subscription is
// removed and the record marked as cancelled from a spawned task.
struct InFlight {
    transport: Arc<dyn Transport>,
    ledger: Ledger,
    response_topic: String,
    armed: bool,
}

impl InFlight {
    async fn finish(mut self, status: CallStatus) {
        self.armed = false;
        settle(
            self.transport.as_ref(),
            &self.ledger,
            &self.response_topic,
            status,
        )
        .await;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let response_topic = std::mem::take(&mut self.response_topic);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Call `{response_topic}` dropped outside a runtime, its record stays pending");
            return;
        };

        debug!("Call `{response_topic}` dropped before its end");
        let transport = Arc::clone(&self.transport);
        let ledger = self.ledger.clone();
        let _ = runtime.spawn(async move {
            settle(
                transport.as_ref(),
                &ledger,
                &response_topic,
                CallStatus::Cancelled,
            )
            .await;
        });
    }
}

async fn settle(transport: &dyn Transport, ledger: &Ledger, response_topic: &str, status: CallStatus) {
    if let Err(e) = transport.unsubscribe(response_topic).await {
        warn!("Impossible to unsubscribe from `{response_topic}`: {e}");
    }
    let _ = ledger.settle(response_topic, status).await;
}

enum Outcome {
    Delivered(Option<Delivery>),
    Deadline,
    Cancelled,
}

async fn run_dispatcher<I>(
    dispatcher: Dispatcher,
    mut inbound: I,
    registry: Arc<CorrelationRegistry>,
    cancellation_token: CancellationToken,
) where
    I: Inbound,
{
    loop {
        tokio::select! {
            // Use the cancellation token to stop the loop
            () = cancellation_token.cancelled() => { break; }
            // Wait for the next message coming from the broker
            message = inbound.recv() => {
                let Some(message) = message else {
                    error!("The broker connection is closed, stop dispatching");
                    break;
                };
                let _ = dispatcher.dispatch(&message).await;
            }
        }
    }
    // Wake up the callers still waiting, no reply can reach them anymore.
    registry.clear();
}

/// A bridge issuing commands to devices over a publish-subscribe broker and
/// ingesting their telemetry.
///
/// The main functionalities include:
///
/// - Sending a command and waiting for its reply, or failing at the call
///   deadline.
/// - Routing the telemetry and state updates published by devices to their
///   sinks.
/// - Recording every call in a ledger for auditing and crash recovery.
///
/// A [`Bridge`] is meant to be shared among all its callers, for example
/// inside an [`Arc`].
pub struct Bridge {
    transport: Arc<dyn Transport>,
    registry: Arc<CorrelationRegistry>,
    ledger: Ledger,
    devices: Arc<dyn DeviceRegistry>,
    slots: Semaphore,
    call_timeout: Duration,
    dispatcher: JoinHandle<()>,
    // Stops the dispatcher task when the bridge is dropped.
    guard: DropGuard,
}

impl Bridge {
    /// Connects a [`Bridge`] to the `MQTT` broker described by the
    /// [`BridgeConfig`].
    ///
    /// Once connected, the calls left pending by a previous process are
    /// marked as timed out, and the bridge subscribes to the topics of all
    /// known devices.
    ///
    /// # Errors
    ///
    /// An error is returned when the configuration is invalid, when the
    /// broker cannot be reached, or when the device topics cannot be
    /// subscribed.
    pub async fn connect(config: BridgeConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let (transport, inbound) = mqtt::connect(&config).await?;
        Self::start(&config, transport, inbound, collaborators).await
    }

    /// Starts a [`Bridge`] on an already connected transport.
    ///
    /// # Errors
    ///
    /// An error is returned when the configuration is invalid, or when the
    /// device topics cannot be subscribed.
    pub async fn start<T, I>(
        config: &BridgeConfig,
        transport: T,
        inbound: I,
        collaborators: Collaborators,
    ) -> Result<Self>
    where
        T: Transport + 'static,
        I: Inbound + 'static,
    {
        config.validate()?;

        let Collaborators {
            devices,
            telemetry,
            device_state,
            store,
        } = collaborators;

        let transport: Arc<dyn Transport> = Arc::new(transport);
        let registry = Arc::new(CorrelationRegistry::new());
        let ledger = Ledger::new(store, config.retention);

        // The dispatcher drives the inbound side of the connection, so it
        // must run before anything is subscribed.
        let cancellation_token = CancellationToken::new();
        let dispatcher = tokio::spawn(run_dispatcher(
            Dispatcher::new(registry.clone(), telemetry, device_state),
            inbound,
            registry.clone(),
            cancellation_token.clone(),
        ));

        let bridge = Self {
            transport,
            registry,
            ledger,
            devices,
            slots: Semaphore::new(config.max_in_flight),
            call_timeout: config.call_timeout,
            dispatcher,
            guard: cancellation_token.drop_guard(),
        };

        match bridge.ledger.recover().await {
            Ok(0) => {}
            Ok(recovered) => warn!("{recovered} calls of a previous run never got a reply"),
            Err(e) => error!("Impossible to recover the pending calls: {e}"),
        }

        let _ = bridge.refresh_subscriptions().await?;

        info!("Bridge started");
        Ok(bridge)
    }

    /// Sends a command and waits for its reply, within the default call
    /// timeout.
    ///
    /// # Errors
    ///
    /// See [`Bridge::call`].
    pub async fn send(&self, topic: &str, payload: Value) -> Result<Map<String, Value>> {
        self.call(Call::new(topic, payload)).await
    }

    /// Sends a command and waits for its reply within the given timeout.
    ///
    /// # Errors
    ///
    /// See [`Bridge::call`].
    pub async fn send_timeout(
        &self,
        topic: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Map<String, Value>> {
        self.call(Call::new(topic, payload).timeout(timeout)).await
    }

    /// Sends a command to a registered device and waits for its reply.
    ///
    /// The command is published on the `/{device_id}/{action}` topic.
    ///
    /// # Errors
    ///
    /// An [`ErrorKind::UnknownDevice`] error is returned when the device is
    /// not registered, and nothing is published. Otherwise, see
    /// [`Bridge::call`].
    pub async fn send_to_device(
        &self,
        device_id: &str,
        action: &str,
        payload: Value,
    ) -> Result<Map<String, Value>> {
        if !self.is_registered(device_id).await? {
            warn!("Command `{action}` for the unknown device `{device_id}`, not sent");
            return Err(Error::new(
                ErrorKind::UnknownDevice,
                format!("Device `{device_id}` is not registered"),
            ));
        }

        self.send(&topic::request(device_id, action), payload).await
    }

    /// Sends a [`Call`] and waits for its reply.
    ///
    /// The reply is returned only when its `status` field is `"ok"`. A call
    /// fails on the first reply, no retries are attempted.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::MalformedPayload`]: the payload is not a JSON object
    /// - [`ErrorKind::Transport`]: the request cannot be published, or the
    ///   connection closed while waiting
    /// - [`ErrorKind::Timeout`]: no reply arrived before the deadline
    /// - [`ErrorKind::Cancelled`]: the call has been cancelled
    /// - [`ErrorKind::Application`]: the device replied with an error, or
    ///   with a reply which cannot be decoded
    pub async fn call(&self, call: Call) -> Result<Map<String, Value>> {
        let Call {
            topic,
            payload,
            timeout,
            cancellation,
        } = call;

        if !payload.is_object() {
            return Err(Error::new(
                ErrorKind::MalformedPayload,
                format!("The payload for `{topic}` is not a JSON object"),
            ));
        }

        let timeout = timeout.unwrap_or(self.call_timeout);
        let deadline = Instant::now() + timeout;
        let cancellation = cancellation.unwrap_or_else(CancellationToken::new);

        // Wait for a free slot, within the call deadline.
        let _permit = tokio::select! {
            permit = self.slots.acquire() => permit.map_err(|_| {
                Error::new(ErrorKind::Transport, "The bridge is shut down")
            })?,
            () = tokio::time::sleep_until(deadline) => {
                return Err(timeout_error(&topic, timeout));
            }
            () = cancellation.cancelled() => {
                return Err(cancelled_error(&topic));
            }
        };

        let call_id = Uuid::new_v4().simple().to_string();
        let response_topic = topic::response(&topic, &call_id);
        let bytes = serde_json::to_vec(&payload)?;

        let mut waiter = self.registry.register(response_topic.as_str())?;
        let _ = self
            .ledger
            .record_pending(PendingCall::new(
                topic.as_str(),
                response_topic.as_str(),
                payload,
                unix_seconds(SystemTime::now()),
            ))
            .await;

        let in_flight = InFlight {
            transport: Arc::clone(&self.transport),
            ledger: self.ledger.clone(),
            response_topic: response_topic.clone(),
            armed: true,
        };

        if let Err(e) = self.publish(&topic, bytes, &response_topic, call_id).await {
            drop(waiter);
            in_flight.finish(CallStatus::Error).await;
            return Err(e);
        }

        debug!("Call `{response_topic}` published, waiting up to {timeout:?}");

        let outcome = tokio::select! {
            delivery = waiter.wait() => Outcome::Delivered(delivery),
            () = tokio::time::sleep_until(deadline) => Outcome::Deadline,
            () = cancellation.cancelled() => Outcome::Cancelled,
        };

        match outcome {
            Outcome::Delivered(Some(delivery)) => {
                Self::complete(&topic, delivery, in_flight).await
            }
            Outcome::Delivered(None) => {
                in_flight.finish(CallStatus::Error).await;
                Err(Error::new(
                    ErrorKind::Transport,
                    format!("The connection closed before a reply to `{topic}`"),
                ))
            }
            Outcome::Deadline => {
                // A reply may have arrived in the meantime.
                if let Some(delivery) = waiter.release() {
                    return Self::complete(&topic, delivery, in_flight).await;
                }
                warn!("No reply to `{topic}` within {timeout:?}");
                in_flight.finish(CallStatus::Timeout).await;
                Err(timeout_error(&topic, timeout))
            }
            Outcome::Cancelled => {
                if let Some(delivery) = waiter.release() {
                    return Self::complete(&topic, delivery, in_flight).await;
                }
                debug!("Call `{response_topic}` cancelled");
                in_flight.finish(CallStatus::Cancelled).await;
                Err(cancelled_error(&topic))
            }
        }
    }

    async fn publish(
        &self,
        topic: &str,
        bytes: Vec<u8>,
        response_topic: &str,
        call_id: String,
    ) -> Result<()> {
        let _ = self.transport.subscribe(response_topic).await?;
        self.transport
            .publish(OutboundMessage::request(
                topic,
                bytes,
                response_topic,
                call_id,
            ))
            .await
    }

    async fn complete(
        topic: &str,
        delivery: Delivery,
        in_flight: InFlight,
    ) -> Result<Map<String, Value>> {
        let reply = match delivery {
            Ok(reply) => reply,
            Err(e) => {
                in_flight.finish(CallStatus::Error).await;
                return Err(Error::new(
                    ErrorKind::Application,
                    format!("Malformed reply to `{topic}`: {}", e.description()),
                ));
            }
        };

        let failure = match ReplyOutcome::evaluate(&reply) {
            ReplyOutcome::Success => None,
            ReplyOutcome::Failure(reason) => Some(reason.into_owned()),
        };

        if let Some(reason) = failure {
            warn!("Command `{topic}` failed: {reason}");
            in_flight.finish(CallStatus::Error).await;
            return Err(Error::new(
                ErrorKind::Application,
                format!("Command `{topic}` failed: {reason}"),
            ));
        }

        in_flight.finish(CallStatus::Delivered).await;
        Ok(reply)
    }

    /// Whether a device is present in the device registry.
    ///
    /// # Errors
    ///
    /// An error is returned when the registry cannot be read.
    pub async fn is_registered(&self, device_id: &str) -> Result<bool> {
        self.devices.contains(device_id).await
    }

    /// Subscribes to the topics of the devices added to the registry after
    /// the bridge started.
    ///
    /// Returns the number of new subscriptions.
    ///
    /// # Errors
    ///
    /// An error is returned when the registry cannot be read or a
    /// subscription fails.
    pub async fn refresh_subscriptions(&self) -> Result<usize> {
        bootstrap::subscribe_devices(self.devices.as_ref(), self.transport.as_ref()).await
    }

    /// Returns the number of calls waiting for a reply.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    /// Shuts down the [`Bridge`], stopping the dispatcher task and closing
    /// the connection.
    ///
    /// # Note
    ///
    /// For a graceful shutdown, this method must be called before dropping
    /// the [`Bridge`].
    pub async fn shutdown(self) {
        let Self {
            transport,
            dispatcher,
            guard,
            ..
        } = self;

        // Stop the dispatcher loop.
        guard.disarm().cancel();

        // Await the task.
        if let Err(e) = dispatcher.await {
            error!("Failed to await the dispatcher task: {e}");
        }

        if let Err(e) = transport.disconnect().await {
            warn!("Impossible to close the connection: {e}");
        }

        info!("Bridge shut down");
    }
}

fn timeout_error(topic: &str, timeout: Duration) -> Error {
    Error::new(
        ErrorKind::Timeout,
        format!("No reply to `{topic}` within {timeout:?}"),
    )
}

fn cancelled_error(topic: &str) -> Error {
    Error::new(
        ErrorKind::Cancelled,
        format!("The call to `{topic}` has been cancelled"),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use tokio::time::Instant;

    use tokio_util::sync::CancellationToken;

    use crate::collaborators::Collaborators;
    use crate::config::BridgeConfig;
    use crate::error::ErrorKind;
    use crate::ledger::CallStatus;
    use crate::tests::{Harness, harness, json_bytes, reply_to};

    use super::{Bridge, Call};

    #[tokio::test]
    async fn round_trip() {
        let Harness {
            bridge,
            mut peer,
            store,
            ..
        } = harness(BridgeConfig::default()).await;

        let device = async {
            let request = peer.next_request().await.unwrap();
            assert_eq!(request.topic, "/pot_7/activate");
            assert_eq!(request.payload, json_bytes(&json!({ "freq": 3 })));
            assert!(reply_to(&peer, &request, &json!({ "status": "ok", "ack": true })).await);
            request.response_topic.unwrap()
        };

        let (reply, response_topic) =
            tokio::join!(bridge.send("/pot_7/activate", json!({ "freq": 3 })), device);

        let reply = reply.unwrap();
        assert_eq!(reply.get("status"), Some(&json!("ok")));
        assert_eq!(reply.get("ack"), Some(&json!(true)));

        assert!(response_topic.starts_with("/pot_7/activate/ok/"));
        assert_eq!(store.get(&response_topic).unwrap().status, CallStatus::Delivered);
        assert_eq!(bridge.in_flight(), 0);
        assert!(!peer.subscriptions().contains(&response_topic));

        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_without_reply() {
        let Harness {
            bridge,
            mut peer,
            store,
            ..
        } = harness(BridgeConfig::default()).await;

        let start = Instant::now();
        let error = bridge
            .send_timeout("/pot_9/activate", json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Timeout);
        assert!(start.elapsed() >= Duration::from_secs(5));

        let request = peer.try_next_request().unwrap();
        let response_topic = request.response_topic.unwrap();
        let call = store.get(&response_topic).unwrap();
        assert_eq!(call.status, CallStatus::Timeout);
        assert!(call.settled_at.is_some());
        assert_eq!(bridge.in_flight(), 0);

        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_after_timeout() {
        let Harness {
            bridge,
            mut peer,
            store,
            sink,
        } = harness(BridgeConfig::default().call_timeout(Duration::from_secs(2))).await;

        let error = bridge
            .send("/pot_9/activate", json!({}))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Timeout);

        let request = peer.next_request().await.unwrap();
        let response_topic = request.response_topic.clone().unwrap();

        // The response topic is no longer subscribed, so the reply is pushed
        // as if it were already in flight.
        assert!(!reply_to(&peer, &request, &json!({ "status": "ok" })).await);
        assert!(
            peer.inject(&response_topic, json_bytes(&json!({ "status": "ok" })))
                .await
        );

        // The dispatcher is still alive and routes telemetry.
        assert!(
            peer.publish("/pot_9/sensors", json_bytes(&json!({ "temperature": 20.0 })))
                .await
        );
        sink.wait_telemetry(1).await;

        assert_eq!(store.get(&response_topic).unwrap().status, CallStatus::Timeout);
        assert_eq!(store.len(), 1);

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_calls_on_same_topic() {
        let Harness {
            bridge, mut peer, ..
        } = harness(BridgeConfig::default()).await;

        let first = bridge.send("/pot_7/activate", json!({ "call": 1 }));
        let second = bridge.send("/pot_7/activate", json!({ "call": 2 }));

        let device = async {
            let a = peer.next_request().await.unwrap();
            let b = peer.next_request().await.unwrap();
            assert_ne!(a.response_topic, b.response_topic);

            // Answer in reverse order, echoing the request.
            for request in [&b, &a] {
                let payload: serde_json::Value =
                    serde_json::from_slice(&request.payload).unwrap();
                assert!(
                    reply_to(
                        &peer,
                        request,
                        &json!({ "status": "ok", "call": payload["call"] })
                    )
                    .await
                );
            }
        };

        let (first, second, ()) = tokio::join!(first, second, device);

        assert_eq!(first.unwrap().get("call"), Some(&json!(1)));
        assert_eq!(second.unwrap().get("call"), Some(&json!(2)));

        bridge.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_load() {
        let Harness {
            bridge,
            mut peer,
            store,
            ..
        } = harness(BridgeConfig::default().max_in_flight(16)).await;
        let bridge = Arc::new(bridge);

        let callers = (0..50)
            .map(|i| {
                let bridge = Arc::clone(&bridge);
                tokio::spawn(async move {
                    let reply = bridge
                        .send("/pot_7/activate", json!({ "call": i }))
                        .await
                        .unwrap();
                    assert_eq!(reply.get("call"), Some(&json!(i)));
                })
            })
            .collect::<Vec<_>>();

        let device = tokio::spawn(async move {
            for _ in 0..50 {
                let request = peer.next_request().await.unwrap();
                let payload: serde_json::Value =
                    serde_json::from_slice(&request.payload).unwrap();
                assert!(
                    reply_to(
                        &peer,
                        &request,
                        &json!({ "status": "ok", "call": payload["call"] })
                    )
                    .await
                );
            }
            peer
        });

        for caller in callers {
            caller.await.unwrap();
        }
        let _peer = device.await.unwrap();

        assert_eq!(store.len(), 50);
        assert!(
            store
                .calls()
                .iter()
                .all(|call| call.status == CallStatus::Delivered)
        );
        assert_eq!(bridge.in_flight(), 0);
    }

    #[tokio::test]
    async fn application_error() {
        let Harness {
            bridge,
            mut peer,
            store,
            ..
        } = harness(BridgeConfig::default()).await;

        let device = async {
            let request = peer.next_request().await.unwrap();
            assert!(
                reply_to(
                    &peer,
                    &request,
                    &json!({ "status": "error", "error": "Tank empty" })
                )
                .await
            );
            request.response_topic.unwrap()
        };

        let (result, response_topic) =
            tokio::join!(bridge.send("/pot_7/water", json!({ "dosage": 200 })), device);

        let error = result.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Application);
        assert!(error.description().contains("Tank empty"));
        assert_eq!(store.get(&response_topic).unwrap().status, CallStatus::Error);

        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_reply_fails_fast() {
        let Harness {
            bridge, mut peer, ..
        } = harness(BridgeConfig::default()).await;

        let start = Instant::now();
        let device = async {
            let request = peer.next_request().await.unwrap();
            let response_topic = request.response_topic.unwrap();
            assert!(peer.publish(&response_topic, "{ not json").await);
        };

        let (result, ()) = tokio::join!(bridge.send("/pot_7/activate", json!({})), device);

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Application);
        assert!(start.elapsed() < Duration::from_secs(20));

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn cancelled_call() {
        let Harness {
            bridge,
            mut peer,
            store,
            ..
        } = harness(BridgeConfig::default()).await;

        let token = CancellationToken::new();
        let call = Call::new("/pot_7/activate", json!({})).cancellation(token.clone());

        let device = async {
            let request = peer.next_request().await.unwrap();
            token.cancel();
            request.response_topic.unwrap()
        };

        let (result, response_topic) = tokio::join!(bridge.call(call), device);

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
        assert_eq!(store.get(&response_topic).unwrap().status, CallStatus::Cancelled);
        assert_eq!(bridge.in_flight(), 0);

        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_call_is_released() {
        let Harness {
            bridge,
            mut peer,
            store,
            ..
        } = harness(BridgeConfig::default()).await;

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            bridge.send("/pot_7/activate", json!({})),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(bridge.in_flight(), 0);

        let response_topic = peer.try_next_request().unwrap().response_topic.unwrap();

        // Let the cleanup task run.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.get(&response_topic).unwrap().status, CallStatus::Cancelled);
        assert!(!peer.subscriptions().contains(&response_topic));

        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_limit() {
        let Harness {
            bridge, mut peer, ..
        } = harness(BridgeConfig::default().max_in_flight(1)).await;

        let first = bridge.send_timeout("/pot_7/activate", json!({}), Duration::from_secs(10));
        let second = bridge.send_timeout("/pot_7/water", json!({}), Duration::from_secs(3));

        let device = async {
            let request = peer.next_request().await.unwrap();
            assert_eq!(request.topic, "/pot_7/activate");
            tokio::time::sleep(Duration::from_secs(5)).await;
            // The second call is still waiting for a slot.
            assert!(peer.try_next_request().is_none());
            assert!(reply_to(&peer, &request, &json!({ "status": "ok" })).await);
        };

        let (first, second, ()) = tokio::join!(first, second, device);

        assert!(first.is_ok());
        assert_eq!(second.unwrap_err().kind(), ErrorKind::Timeout);

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_device() {
        let Harness {
            bridge, mut peer, ..
        } = harness(BridgeConfig::default()).await;

        assert!(bridge.is_registered("pot_7").await.unwrap());
        assert!(!bridge.is_registered("pot_404").await.unwrap());

        let error = bridge
            .send_to_device("pot_404", "activate", json!({}))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::UnknownDevice);
        assert!(peer.try_next_request().is_none());

        let device = async {
            let request = peer.next_request().await.unwrap();
            assert_eq!(request.topic, "/pot_2/activate");
            assert!(reply_to(&peer, &request, &json!({ "status": "ok" })).await);
        };

        let (result, ()) = tokio::join!(
            bridge.send_to_device("pot_2", "activate", json!({ "frequency": 3 })),
            device
        );
        assert!(result.is_ok());

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn publish_failure() {
        let Harness {
            bridge,
            peer,
            store,
            ..
        } = harness(BridgeConfig::default()).await;

        peer.disconnect();

        let error = bridge
            .send("/pot_7/activate", json!({}))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Transport);

        let calls = store.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].status, CallStatus::Error);
        assert_eq!(bridge.in_flight(), 0);

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn reject_non_object_payload() {
        let Harness {
            bridge,
            mut peer,
            store,
            ..
        } = harness(BridgeConfig::default()).await;

        let error = bridge
            .send("/pot_7/activate", json!([1, 2, 3]))
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::MalformedPayload);
        assert!(peer.try_next_request().is_none());
        assert!(store.is_empty());

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn subscribe_devices_on_start() {
        let Harness { bridge, peer, .. } = harness(BridgeConfig::default()).await;

        assert!(peer.subscriptions().contains(&"/pot_1/sensors".to_string()));
        assert!(peer.subscriptions().contains(&"/pot_9/data".to_string()));
        assert_eq!(bridge.refresh_subscriptions().await.unwrap(), 0);

        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config() {
        let (transport, inbound, _peer) = crate::transport::memory::channel(4);

        let error = Bridge::start(
            &BridgeConfig::default().max_in_flight(0),
            transport,
            inbound,
            Collaborators::tracing(Arc::new(crate::collaborators::StaticDevices::default())),
        )
        .await
        .err()
        .unwrap();

        assert_eq!(error.kind(), ErrorKind::Config);
    }
}
