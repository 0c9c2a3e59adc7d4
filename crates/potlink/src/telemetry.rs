use alloc::string::String;

use serde::Serialize;

/// Sensor readings published by a device on its `sensors` topic.
///
/// Every measurement is optional, since a device publishes only the values
/// its sensors managed to read.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
pub struct SensorReading {
    /// Temperature in degrees Celsius (°C).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub temperature: Option<f64>,
    /// Relative air humidity as a percentage (% RH).
    #[serde(alias = "airHumidity", skip_serializing_if = "Option::is_none", default)]
    pub air_humidity: Option<f64>,
    /// Soil humidity as a percentage.
    #[serde(
        alias = "soilHumidity",
        alias = "soil_moisture",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub soil_humidity: Option<f64>,
    /// Light intensity.
    #[serde(alias = "lightIntensity", skip_serializing_if = "Option::is_none", default)]
    pub light_intensity: Option<f64>,
    /// Identifier the device reports for itself.
    #[serde(
        alias = "plant_pot_id",
        alias = "deviceId",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub device_id: Option<String>,
}

impl SensorReading {
    /// Creates an empty [`SensorReading`].
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            temperature: None,
            air_humidity: None,
            soil_humidity: None,
            light_intensity: None,
            device_id: None,
        }
    }

    /// Sets the temperature.
    #[must_use]
    pub const fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets the air humidity.
    #[must_use]
    pub const fn air_humidity(mut self, air_humidity: f64) -> Self {
        self.air_humidity = Some(air_humidity);
        self
    }

    /// Sets the soil humidity.
    #[must_use]
    pub const fn soil_humidity(mut self, soil_humidity: f64) -> Self {
        self.soil_humidity = Some(soil_humidity);
        self
    }

    /// Sets the light intensity.
    #[must_use]
    pub const fn light_intensity(mut self, light_intensity: f64) -> Self {
        self.light_intensity = Some(light_intensity);
        self
    }

    /// Whether no measurement is present.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.air_humidity.is_none()
            && self.soil_humidity.is_none()
            && self.light_intensity.is_none()
    }
}

/// A normalized telemetry record, ready to be stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "deserialize", derive(serde::Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    /// Temperature in degrees Celsius (°C).
    pub temperature: Option<f64>,
    /// Relative air humidity as a percentage (% RH).
    pub air_humidity: Option<f64>,
    /// Soil humidity as a percentage.
    pub soil_humidity: Option<f64>,
    /// Light intensity.
    pub light_intensity: Option<f64>,
    /// Device identifier.
    pub device_id: String,
    /// Reception time, in seconds since the Unix epoch.
    pub timestamp: u64,
}

impl Telemetry {
    /// Normalizes a [`SensorReading`] received from a device.
    ///
    /// The device identifier is the one extracted from the topic, since a
    /// device cannot publish on another device topic.
    #[must_use]
    pub fn new(device_id: impl Into<String>, reading: SensorReading, timestamp: u64) -> Self {
        Self {
            temperature: reading.temperature,
            air_humidity: reading.air_humidity,
            soil_humidity: reading.soil_humidity,
            light_intensity: reading.light_intensity,
            device_id: device_id.into(),
            timestamp,
        }
    }
}
