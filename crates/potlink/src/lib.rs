//! The communication contract among a plant-pot controller and the backend.
//!
//! This crate provides APIs to:
//!
//! - Build and classify the topics exchanged over the broker.
//!   Commands are published on `/{device}/{action}`, replies come back on a
//!   per-call response topic derived from the command topic, while sensor
//!   readings and device data arrive on `/{device}/sensors` and
//!   `/{device}/data`.
//! - Encode and evaluate command replies. A reply is a JSON object whose
//!   `status` field equals `"ok"` on success, and which carries an `error`
//!   field otherwise.
//! - Describe sensor readings and device state patches, together with their
//!   normalized forms handed to the backend storage.
//!
//! Data exchange between a device and the backend requires structures to be
//! serializable and deserializable. A device serializes these structures
//! while the backend deserializes them. A device can avoid importing
//! deserialization functions by disabling the `deserialize` feature at
//! compile time.
//!
//! This crate can be compiled for both `std` and `no_std` environments.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![no_std]

extern crate alloc;

/// Command replies and their evaluation.
pub mod reply;
/// Device state patches.
pub mod state;
/// Sensor readings and normalized telemetry.
pub mod telemetry;
/// Topic builders and classification.
pub mod topic;

#[cfg(test)]
#[cfg(feature = "deserialize")]
pub(crate) fn serialize<T: serde::Serialize>(value: T) -> serde_json::Value {
    serde_json::to_value(value).unwrap()
}

#[cfg(test)]
#[cfg(feature = "deserialize")]
pub(crate) fn deserialize<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> T {
    serde_json::from_value(value).unwrap()
}
