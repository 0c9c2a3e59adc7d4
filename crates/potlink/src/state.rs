use alloc::string::String;

use serde::Serialize;

/// A partial update of a device state, published by a device on its `data`
/// topic.
///
/// Only the fields present in the patch are meant to be changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct DeviceStatePatch {
    /// Whether the device is active.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub active: Option<bool>,
    /// Watering frequency configured on the device.
    #[serde(
        alias = "wateringFrequency",
        alias = "frequency",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub watering_frequency: Option<u32>,
    /// Water dosage configured on the device.
    #[serde(
        alias = "waterDosage",
        alias = "dosage",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub water_dosage: Option<u32>,
}

impl DeviceStatePatch {
    /// Creates an empty [`DeviceStatePatch`].
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            active: None,
            watering_frequency: None,
            water_dosage: None,
        }
    }

    /// Sets the activity flag.
    #[must_use]
    pub const fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    /// Sets the watering frequency.
    #[must_use]
    pub const fn watering_frequency(mut self, watering_frequency: u32) -> Self {
        self.watering_frequency = Some(watering_frequency);
        self
    }

    /// Sets the water dosage.
    #[must_use]
    pub const fn water_dosage(mut self, water_dosage: u32) -> Self {
        self.water_dosage = Some(water_dosage);
        self
    }

    /// Whether the patch changes nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.active.is_none() && self.watering_frequency.is_none() && self.water_dosage.is_none()
    }
}

/// A device state update keyed by device identifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    /// Device identifier.
    pub device_id: String,
    /// Changed fields.
    pub patch: DeviceStatePatch,
    /// Reception time, in seconds since the Unix epoch.
    pub timestamp: u64,
}

impl DeviceState {
    /// Creates a [`DeviceState`] update.
    #[must_use]
    pub fn new(device_id: impl Into<String>, patch: DeviceStatePatch, timestamp: u64) -> Self {
        Self {
            device_id: device_id.into(),
            patch,
            timestamp,
        }
    }
}
