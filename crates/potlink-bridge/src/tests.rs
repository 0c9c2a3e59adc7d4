use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use potlink::state::DeviceState;
use potlink::telemetry::Telemetry;

use serde_json::Value;

use crate::bridge::Bridge;
use crate::collaborators::{
    Collaborators, DeviceStateSink, SinkError, StaticDevices, TelemetrySink,
};
use crate::config::BridgeConfig;
use crate::ledger::MemoryStore;
use crate::transport::OutboundMessage;
use crate::transport::memory::{self, MemoryPeer};

// Devices known to the registry and to the sinks.
pub(crate) const DEVICES: &[&str] = &["pot_1", "pot_2", "pot_7", "pot_9"];

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub(crate) fn json_bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap()
}

// Publishes a reply on the response topic advertised by a request.
pub(crate) async fn reply_to(peer: &MemoryPeer, request: &OutboundMessage, reply: &Value) -> bool {
    let response_topic = request.response_topic.as_deref().unwrap();
    peer.publish(response_topic, json_bytes(reply)).await
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    telemetry: Mutex<Vec<Telemetry>>,
    states: Mutex<Vec<DeviceState>>,
}

impl RecordingSink {
    pub(crate) fn telemetry(&self) -> Vec<Telemetry> {
        self.telemetry.lock().unwrap().clone()
    }

    pub(crate) fn states(&self) -> Vec<DeviceState> {
        self.states.lock().unwrap().clone()
    }

    pub(crate) async fn wait_telemetry(&self, count: usize) {
        while self.telemetry.lock().unwrap().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl TelemetrySink for RecordingSink {
    async fn ingest(&self, telemetry: Telemetry) -> Result<(), SinkError> {
        self.telemetry.lock().unwrap().push(telemetry);
        Ok(())
    }
}

#[async_trait]
impl DeviceStateSink for RecordingSink {
    async fn update(&self, state: DeviceState) -> Result<(), SinkError> {
        if !DEVICES.contains(&state.device_id.as_str()) {
            return Err(SinkError::NotFound(state.device_id));
        }
        self.states.lock().unwrap().push(state);
        Ok(())
    }
}

pub(crate) struct Harness {
    pub(crate) bridge: Bridge,
    pub(crate) peer: MemoryPeer,
    pub(crate) store: Arc<MemoryStore>,
    pub(crate) sink: Arc<RecordingSink>,
}

// Starts a bridge on an in-memory broker, the peer playing the devices.
pub(crate) async fn harness(config: BridgeConfig) -> Harness {
    init_tracing();

    let (transport, inbound, peer) = memory::channel(64);
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(RecordingSink::default());

    let collaborators = Collaborators::new(
        Arc::new(StaticDevices::new(DEVICES.iter().copied())),
        sink.clone(),
        sink.clone(),
    )
    .store(store.clone());

    let bridge = Bridge::start(&config, transport, inbound, collaborators)
        .await
        .unwrap_or_else(|e| panic!("Bridge start failed: {e}"));

    Harness {
        bridge,
        peer,
        store,
        sink,
    }
}
