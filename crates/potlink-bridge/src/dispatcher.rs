use std::sync::Arc;

use potlink::state::{DeviceState, DeviceStatePatch};
use potlink::telemetry::{SensorReading, Telemetry};
use potlink::topic::DeviceTopic;

use serde_json::Value;

use tracing::{debug, error, warn};

use crate::collaborators::{DeviceStateSink, SinkError, TelemetrySink};
use crate::correlation::{CorrelationRegistry, Delivery};
use crate::error::{Error, ErrorKind};
use crate::transport::InboundMessage;
use crate::unix_seconds;

/// Where an inbound message is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    /// A reply to a call which is still waiting.
    Reply,
    /// Telemetry of the contained device.
    Telemetry(&'a str),
    /// A state update of the contained device.
    DeviceState(&'a str),
    /// Nothing consumes the message.
    Unrouted,
}

/// Routes every inbound message to the waiting caller or to a sink.
pub struct Dispatcher {
    registry: Arc<CorrelationRegistry>,
    telemetry: Arc<dyn TelemetrySink>,
    device_state: Arc<dyn DeviceStateSink>,
}

impl Dispatcher {
    /// Creates a [`Dispatcher`].
    #[must_use]
    pub fn new(
        registry: Arc<CorrelationRegistry>,
        telemetry: Arc<dyn TelemetrySink>,
        device_state: Arc<dyn DeviceStateSink>,
    ) -> Self {
        Self {
            registry,
            telemetry,
            device_state,
        }
    }

    /// Classifies a topic.
    ///
    /// A topic with a registered waiter is a reply whatever its shape, then
    /// come the `sensors` and `data` device topics.
    #[must_use]
    pub fn classify<'a>(&self, topic: &'a str) -> Route<'a> {
        if self.registry.contains(topic) {
            return Route::Reply;
        }

        match DeviceTopic::classify(topic) {
            DeviceTopic::Sensors(device_id) => Route::Telemetry(device_id),
            DeviceTopic::Data(device_id) => Route::DeviceState(device_id),
            DeviceTopic::Response { .. } | DeviceTopic::Other => Route::Unrouted,
        }
    }

    /// Dispatches an inbound message, returning the route it took.
    ///
    /// Failures are logged and never returned: a malformed message must not
    /// stop the dispatching of the following ones.
    pub async fn dispatch<'a>(&self, message: &'a InboundMessage) -> Route<'a> {
        let route = self.classify(&message.topic);

        match route {
            Route::Reply => self.deliver_reply(message),
            Route::Telemetry(device_id) => self.ingest_telemetry(device_id, message).await,
            Route::DeviceState(device_id) => self.update_device_state(device_id, message).await,
            Route::Unrouted => {
                if matches!(
                    DeviceTopic::classify(&message.topic),
                    DeviceTopic::Response { .. }
                ) {
                    debug!(
                        "Late or duplicate reply on `{}`, discard it",
                        message.topic
                    );
                } else {
                    warn!("No route for topic `{}`, discard the message", message.topic);
                }
            }
        }

        route
    }

    fn deliver_reply(&self, message: &InboundMessage) {
        let delivery: Delivery = match serde_json::from_slice::<Value>(&message.payload) {
            Ok(Value::Object(reply)) => Ok(reply),
            Ok(_) => {
                warn!("Reply on `{}` is not a JSON object", message.topic);
                Err(Error::new(
                    ErrorKind::MalformedPayload,
                    format!("Reply on `{}` is not a JSON object", message.topic),
                ))
            }
            Err(e) => {
                warn!("Impossible to decode the reply on `{}`: {e}", message.topic);
                Err(e.into())
            }
        };

        if !self.registry.fulfill(&message.topic, delivery) {
            debug!("Reply on `{}` arrived after its call ended", message.topic);
        }
    }

    async fn ingest_telemetry(&self, device_id: &str, message: &InboundMessage) {
        let reading = match serde_json::from_slice::<SensorReading>(&message.payload) {
            Ok(reading) => reading,
            Err(e) => {
                warn!("Malformed telemetry from `{device_id}`, discard it: {e}");
                return;
            }
        };

        if reading.is_empty() {
            warn!("Telemetry from `{device_id}` without measurements, discard it");
            return;
        }

        if let Some(reported) = reading.device_id.as_deref()
            && reported != device_id
        {
            warn!("Telemetry on the topic of `{device_id}` reports the identifier `{reported}`");
        }

        let telemetry = Telemetry::new(device_id, reading, unix_seconds(message.received_at));
        if let Err(e) = self.telemetry.ingest(telemetry).await {
            error!("Impossible to store telemetry from `{device_id}`: {e}");
        }
    }

    async fn update_device_state(&self, device_id: &str, message: &InboundMessage) {
        let patch = match serde_json::from_slice::<DeviceStatePatch>(&message.payload) {
            Ok(patch) => patch,
            Err(e) => {
                warn!("Malformed data from `{device_id}`, discard it: {e}");
                return;
            }
        };

        if patch.is_empty() {
            debug!("Data from `{device_id}` changes no state, skip it");
            return;
        }

        let state = DeviceState::new(device_id, patch, unix_seconds(message.received_at));
        match self.device_state.update(state).await {
            Ok(()) => debug!("State of `{device_id}` updated"),
            Err(SinkError::NotFound(_)) => {
                warn!("State update for the unknown device `{device_id}`, discard it");
            }
            Err(e) => error!("Impossible to update the state of `{device_id}`: {e}"),
        }
    }
}
