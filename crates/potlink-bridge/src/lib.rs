//! The `potlink-bridge` library crate lets a backend issue commands to
//! plant-pot controllers over a publish-subscribe broker and wait for their
//! replies, while ingesting the telemetry the same devices publish.
//!
//! A broker only moves messages around, it has no notion of a reply. This
//! crate provides a call abstraction on top of it:
//!
//! - Each command is published on its request topic together with a unique
//!   response topic, and the caller waits for exactly one reply on it, or
//!   fails at the call deadline
//! - Every inbound message is classified by its topic and routed either to
//!   the waiting caller or to the telemetry and device-state sinks
//! - Every call is recorded in a ledger, so calls interrupted by a crash can
//!   be recognized at the next start
//!
//! The `MQTT` connection is handled by `rumqttc`, while an in-memory broker
//! allows to exercise a [`bridge::Bridge`] without any network.
//!
//! `potlink-bridge` leverages `tokio` as an asynchronous executor: a single
//! task dispatches inbound messages, while any number of callers wait for
//! their replies concurrently.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

use std::time::{SystemTime, UNIX_EPOCH};

/// Subscriptions to the topics of known devices.
pub mod bootstrap;
/// The bridge and its call interface.
pub mod bridge;
/// External collaborators: device registry and sinks.
pub mod collaborators;
/// Bridge configuration.
pub mod config;
/// Correlation of replies with the callers waiting for them.
pub mod correlation;
/// Routing of inbound messages.
pub mod dispatcher;
/// Error management.
pub mod error;
/// Durable record of calls.
pub mod ledger;
/// Broker connections.
pub mod transport;

// Seconds since the Unix epoch, zero for times before it.
pub(crate) fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

#[cfg(test)]
mod tests;
