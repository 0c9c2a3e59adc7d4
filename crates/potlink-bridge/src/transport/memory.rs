use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use bytes::Bytes;

use tokio::sync::mpsc;

use tracing::debug;

use crate::error::{Error, ErrorKind, Result};

use super::{Inbound, InboundMessage, OutboundMessage, Subscriptions, Transport};

fn disconnected() -> Error {
    Error::new(ErrorKind::Transport, "The in-memory broker is disconnected")
}

/// Creates an in-memory broker connection.
///
/// The [`MemoryTransport`] and [`MemoryInbound`] form the bridge side of the
/// connection, while the [`MemoryPeer`] acts as the devices: it receives the
/// published messages and publishes messages towards the bridge.
///
/// The `capacity` parameter bounds the number of inbound messages waiting to
/// be dispatched.
#[must_use]
pub fn channel(capacity: usize) -> (MemoryTransport, MemoryInbound, MemoryPeer) {
    let subscriptions = Subscriptions::default();
    let connected = Arc::new(AtomicBool::new(true));
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);

    (
        MemoryTransport {
            subscriptions: subscriptions.clone(),
            outbox: outbox_tx,
            connected: connected.clone(),
        },
        MemoryInbound(inbound_rx),
        MemoryPeer {
            subscriptions,
            inbound: inbound_tx,
            outbox: outbox_rx,
            connected,
        },
    )
}

/// The outbound side of an in-memory broker connection.
#[derive(Debug)]
pub struct MemoryTransport {
    subscriptions: Subscriptions,
    outbox: mpsc::UnboundedSender<OutboundMessage>,
    connected: Arc<AtomicBool>,
}

impl MemoryTransport {
    fn check_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(disconnected())
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        self.check_connected()?;
        self.outbox.send(message).map_err(|_| disconnected())
    }

    async fn subscribe(&self, filter: &str) -> Result<bool> {
        self.check_connected()?;
        Ok(self.subscriptions.insert(filter))
    }

    async fn unsubscribe(&self, filter: &str) -> Result<bool> {
        self.check_connected()?;
        Ok(self.subscriptions.remove(filter))
    }

    fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.snapshot()
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }
}

/// The inbound side of an in-memory broker connection.
#[derive(Debug)]
pub struct MemoryInbound(mpsc::Receiver<InboundMessage>);

#[async_trait]
impl Inbound for MemoryInbound {
    async fn recv(&mut self) -> Option<InboundMessage> {
        self.0.recv().await
    }
}

/// The device side of an in-memory broker connection.
#[derive(Debug)]
pub struct MemoryPeer {
    subscriptions: Subscriptions,
    inbound: mpsc::Sender<InboundMessage>,
    outbox: mpsc::UnboundedReceiver<OutboundMessage>,
    connected: Arc<AtomicBool>,
}

impl MemoryPeer {
    /// Waits for the next message published by the bridge.
    ///
    /// Returns `None` when the bridge side has been dropped.
    pub async fn next_request(&mut self) -> Option<OutboundMessage> {
        self.outbox.recv().await
    }

    /// Returns the next message published by the bridge, if any, without
    /// waiting.
    pub fn try_next_request(&mut self) -> Option<OutboundMessage> {
        self.outbox.try_recv().ok()
    }

    /// Publishes a message towards the bridge.
    ///
    /// As a broker would do, the message is delivered only if the bridge is
    /// subscribed to a filter matching the topic. Returns whether the message
    /// has been delivered.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        if !self.subscriptions.any_matches(topic) {
            debug!("No subscription matches `{topic}`, message not delivered");
            return false;
        }
        self.inject(topic, payload).await
    }

    /// Delivers a message to the bridge regardless of its subscriptions.
    ///
    /// This reproduces messages already in flight when the bridge
    /// unsubscribed. Returns whether the message has been delivered.
    pub async fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        self.inbound
            .send(InboundMessage::new(topic, payload))
            .await
            .is_ok()
    }

    /// Returns all topic filters the bridge is subscribed to.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.snapshot()
    }

    /// Simulates a broken connection: every subsequent operation on the
    /// bridge side fails.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }
}
