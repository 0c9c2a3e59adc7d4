use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use potlink::state::DeviceState;
use potlink::telemetry::Telemetry;

use tracing::info;

use crate::error::Result;
use crate::ledger::{DurableStore, MemoryStore};

/// An error returned by a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The device is unknown to the sink.
    NotFound(String),
    /// The sink cannot accept data right now.
    Unavailable(String),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(device_id) => write!(f, "Device `{device_id}` not found"),
            Self::Unavailable(reason) => write!(f, "Sink unavailable: {reason}"),
        }
    }
}

impl std::error::Error for SinkError {}

/// The registry of known devices.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Returns the identifiers of all known devices.
    async fn device_ids(&self) -> Result<Vec<String>>;

    /// Whether the device is known.
    async fn contains(&self, device_id: &str) -> Result<bool>;
}

/// Receives the telemetry published by devices.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Stores a telemetry record.
    async fn ingest(&self, telemetry: Telemetry) -> std::result::Result<(), SinkError>;
}

/// Receives the state updates published by devices.
#[async_trait]
pub trait DeviceStateSink: Send + Sync {
    /// Applies a state update.
    ///
    /// Fails with [`SinkError::NotFound`] for an unknown device.
    async fn update(&self, state: DeviceState) -> std::result::Result<(), SinkError>;
}

/// A [`DeviceRegistry`] holding a fixed set of devices, which can be changed
/// at runtime.
#[derive(Debug, Default)]
pub struct StaticDevices(Mutex<BTreeSet<String>>);

impl StaticDevices {
    /// Creates a [`StaticDevices`] registry.
    #[must_use]
    pub fn new<I, S>(device_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(Mutex::new(device_ids.into_iter().map(Into::into).collect()))
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a device, returning `false` when it was already present.
    pub fn add(&self, device_id: impl Into<String>) -> bool {
        self.lock().insert(device_id.into())
    }

    /// Removes a device, returning `false` when it was not present.
    pub fn remove(&self, device_id: &str) -> bool {
        self.lock().remove(device_id)
    }
}

#[async_trait]
impl DeviceRegistry for StaticDevices {
    async fn device_ids(&self) -> Result<Vec<String>> {
        Ok(self.lock().iter().cloned().collect())
    }

    async fn contains(&self, device_id: &str) -> Result<bool> {
        Ok(self.lock().contains(device_id))
    }
}

/// A sink which logs whatever it receives.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl TelemetrySink for TracingSink {
    async fn ingest(&self, telemetry: Telemetry) -> std::result::Result<(), SinkError> {
        info!(
            "Telemetry from `{}`: temperature {:?}, air humidity {:?}, soil humidity {:?}, light intensity {:?}",
            telemetry.device_id,
            telemetry.temperature,
            telemetry.air_humidity,
            telemetry.soil_humidity,
            telemetry.light_intensity
        );
        Ok(())
    }
}

#[async_trait]
impl DeviceStateSink for TracingSink {
    async fn update(&self, state: DeviceState) -> std::result::Result<(), SinkError> {
        info!("State update from `{}`: {:?}", state.device_id, state.patch);
        Ok(())
    }
}

/// The external collaborators of a bridge.
#[derive(Clone)]
pub struct Collaborators {
    pub(crate) devices: Arc<dyn DeviceRegistry>,
    pub(crate) telemetry: Arc<dyn TelemetrySink>,
    pub(crate) device_state: Arc<dyn DeviceStateSink>,
    pub(crate) store: Arc<dyn DurableStore>,
}

impl Collaborators {
    /// Creates the [`Collaborators`], recording calls in a [`MemoryStore`].
    #[must_use]
    pub fn new(
        devices: Arc<dyn DeviceRegistry>,
        telemetry: Arc<dyn TelemetrySink>,
        device_state: Arc<dyn DeviceStateSink>,
    ) -> Self {
        Self {
            devices,
            telemetry,
            device_state,
            store: Arc::new(MemoryStore::new()),
        }
    }

    /// Creates the [`Collaborators`] for a device registry, logging
    /// telemetry and state updates through a [`TracingSink`].
    #[must_use]
    pub fn tracing(devices: Arc<dyn DeviceRegistry>) -> Self {
        Self::new(devices, Arc::new(TracingSink), Arc::new(TracingSink))
    }

    /// Sets the [`DurableStore`] the pending calls are recorded in.
    #[must_use]
    #[inline]
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = store;
        self
    }
}
