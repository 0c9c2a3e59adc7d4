use async_trait::async_trait;

use rumqttc::v5::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions,
    mqttbytes::QoS,
    mqttbytes::v5::{Packet, PublishProperties},
};

use tracing::{debug, error, info, warn};

use crate::config::{Backoff, BridgeConfig};
use crate::error::{Error, ErrorKind, Result};

use super::{Inbound, InboundMessage, OutboundMessage, Subscriptions, Transport};

/// Connects to the `MQTT` broker described by the [`BridgeConfig`].
///
/// The function waits until the broker accepts the connection, so a wrong
/// address or an unreachable broker is reported immediately.
///
/// # Errors
///
/// A [`ErrorKind::Transport`] error is returned when the broker does not
/// accept the connection within the configured connection timeout.
pub async fn connect(config: &BridgeConfig) -> Result<(MqttTransport, MqttInbound)> {
    let broker = config.broker();

    let mut options = MqttOptions::new(config.client_id.as_str(), broker.host.as_str(), broker.port);
    let _ = options.set_keep_alive(config.keep_alive);

    let (client, mut eventloop) = AsyncClient::new(options, config.channel_capacity);

    match tokio::time::timeout(config.connect_timeout, wait_connack(&mut eventloop)).await {
        Ok(Ok(())) => info!("Connected to the broker at `{broker}`"),
        Ok(Err(e)) => {
            error!("Impossible to connect to the broker at `{broker}`: {e}");
            return Err(e.into());
        }
        Err(_) => {
            error!("The broker at `{broker}` did not accept the connection in time");
            return Err(Error::new(
                ErrorKind::Transport,
                format!(
                    "No connection acknowledgement from `{broker}` within {:?}",
                    config.connect_timeout
                ),
            ));
        }
    }

    let subscriptions = Subscriptions::default();

    Ok((
        MqttTransport {
            client: client.clone(),
            subscriptions: subscriptions.clone(),
        },
        MqttInbound {
            client,
            eventloop,
            subscriptions,
            reconnect: config.reconnect,
            failures: 0,
        },
    ))
}

async fn wait_connack(eventloop: &mut EventLoop) -> std::result::Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

/// The outbound side of an `MQTT` connection.
///
/// Every message is published with the `AtLeastOnce` quality of service.
#[derive(Debug)]
pub struct MqttTransport {
    client: AsyncClient,
    subscriptions: Subscriptions,
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        let OutboundMessage {
            topic,
            payload,
            response_topic,
            correlation_data,
        } = message;

        let properties = PublishProperties {
            response_topic,
            correlation_data,
            ..Default::default()
        };

        self.client
            .publish_with_properties(topic.clone(), QoS::AtLeastOnce, false, payload, properties)
            .await
            .map_err(|e| {
                error!("Impossible to publish on topic `{topic}`: {e}");
                e.into()
            })
    }

    async fn subscribe(&self, filter: &str) -> Result<bool> {
        if !self.subscriptions.insert(filter) {
            return Ok(false);
        }

        if let Err(e) = self.client.subscribe(filter.to_string(), QoS::AtLeastOnce).await {
            let _ = self.subscriptions.remove(filter);
            error!("Impossible to subscribe to topic `{filter}`: {e}");
            return Err(e.into());
        }

        debug!("Subscribed to `{filter}`");
        Ok(true)
    }

    async fn unsubscribe(&self, filter: &str) -> Result<bool> {
        if !self.subscriptions.remove(filter) {
            return Ok(false);
        }

        self.client.unsubscribe(filter.to_string()).await.map_err(|e| {
            error!("Impossible to unsubscribe from topic `{filter}`: {e}");
            Error::from(e)
        })?;

        debug!("Unsubscribed from `{filter}`");
        Ok(true)
    }

    fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.snapshot()
    }

    async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await.map_err(Error::from)
    }
}

/// The inbound side of an `MQTT` connection.
///
/// Polling it drives the whole connection, outbound packets included, so it
/// must be polled continuously.
///
/// When the connection drops, it reconnects applying the configured
/// [`Backoff`] and, if the broker lost the session, subscribes again to all
/// the recorded topic filters.
pub struct MqttInbound {
    client: AsyncClient,
    eventloop: EventLoop,
    subscriptions: Subscriptions,
    reconnect: Backoff,
    failures: u32,
}

impl MqttInbound {
    fn replay_subscriptions(&self) {
        let filters = self.subscriptions.snapshot();
        if filters.is_empty() {
            return;
        }

        info!("Restoring {} subscriptions", filters.len());

        // Subscribing waits on the request channel, which is drained only by
        // polling the event loop, so it cannot happen inline.
        let client = self.client.clone();
        let _ = tokio::spawn(async move {
            for filter in filters {
                if let Err(e) = client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
                    error!("Impossible to restore subscription `{filter}`: {e}");
                }
            }
        });
    }

    async fn on_failure(&mut self, e: &ConnectionError) -> bool {
        self.failures = self.failures.saturating_add(1);

        if self.failures > self.reconnect.max_attempts() {
            error!(
                "Connection lost after {} attempts, giving up: {e}",
                self.reconnect.max_attempts()
            );
            return false;
        }

        let delay = self.reconnect.delay(self.failures);
        warn!(
            "Connection error, reconnecting in {delay:?} (attempt {}): {e}",
            self.failures
        );
        tokio::time::sleep(delay).await;
        true
    }
}

#[async_trait]
impl Inbound for MqttInbound {
    async fn recv(&mut self) -> Option<InboundMessage> {
        loop {
            let packet = match self.eventloop.poll().await {
                Ok(Event::Incoming(packet)) => packet,
                Ok(Event::Outgoing(_)) => continue,
                Err(e) => {
                    if self.on_failure(&e).await {
                        continue;
                    }
                    return None;
                }
            };

            match packet {
                Packet::Publish(publish) => {
                    let topic = match std::str::from_utf8(&publish.topic) {
                        Ok(topic) => topic,
                        Err(e) => {
                            warn!("Discard a message with a non UTF-8 topic: {e}");
                            continue;
                        }
                    };
                    return Some(InboundMessage::new(topic, publish.payload));
                }
                Packet::ConnAck(connack) => {
                    info!("Reconnected to the broker");
                    self.failures = 0;
                    if !connack.session_present {
                        self.replay_subscriptions();
                    }
                }
                Packet::Disconnect(_) => {
                    warn!("The broker closed the connection");
                }
                _ => {}
            }
        }
    }
}
