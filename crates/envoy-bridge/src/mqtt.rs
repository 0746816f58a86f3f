//! Broker adapter on top of rumqttc.
//!
//! The connection registers an `offline` last will on the status topic,
//! resubscribes to the reference topics on every `ConnAck` and forwards
//! matching retained messages to the reference listener. The event loop keeps
//! reconnecting with exponential backoff until the client disconnects.

use std::sync::Arc;
use std::time::Duration;

use envoy_metrics::ReferenceUpdate;
use rumqttc::{
    AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::publisher::Publisher;
use crate::reconnect::{Backoff, ReconnectPolicy};
use crate::status::Liveness;
use crate::topics::TopicLayout;

/// Capacity of the client request channel.
const REQUEST_CAPACITY: usize = 256;

/// How long to wait for the event loop to flush after a disconnect.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the client options for `config`.
#[must_use]
pub fn mqtt_options(config: &BridgeConfig, layout: &TopicLayout) -> MqttOptions {
    let mut options = MqttOptions::new(config.client_id(), config.mqtt.host.clone(), config.mqtt.port);
    options.set_keep_alive(Duration::from_secs(config.mqtt.keep_alive_secs));
    if let Some(username) = &config.mqtt.username {
        options.set_credentials(username.clone(), config.mqtt.password.clone().unwrap_or_default());
    }
    options.set_last_will(LastWill::new(
        layout.status(),
        Liveness::Offline.as_str(),
        QoS::AtLeastOnce,
        true,
    ));
    options
}

/// Maps an inbound message to a reference update, if it is one of ours.
#[must_use]
pub fn inbound_update(layout: &TopicLayout, topic: &str, payload: &[u8]) -> Option<ReferenceUpdate> {
    let key = layout.data_key(topic)?;
    Some(ReferenceUpdate::new(key, String::from_utf8_lossy(payload).trim()))
}

/// [`Publisher`] backed by a rumqttc client. Every message is sent at QoS 1.
#[derive(Debug, Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    /// Requests a clean disconnect.
    pub async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await.map_err(|e| BridgeError::Publish {
            topic: String::new(),
            reason: format!("disconnect failed: {e}"),
        })
    }
}

impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: String, retained: bool) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retained, payload)
            .await
            .map_err(|e| BridgeError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

/// A live broker connection.
#[derive(Debug)]
pub struct MqttConnection {
    publisher: Arc<MqttPublisher>,
    event_loop: JoinHandle<()>,
}

impl MqttConnection {
    /// Starts the event loop. Reference topics for `subscription_keys` are
    /// subscribed on every connect and their messages sent to `updates`.
    pub fn start(
        config: &BridgeConfig,
        layout: &TopicLayout,
        subscription_keys: &[String],
        updates: mpsc::Sender<ReferenceUpdate>,
    ) -> Self {
        let (client, event_loop) = AsyncClient::new(mqtt_options(config, layout), REQUEST_CAPACITY);
        let filters = subscription_keys
            .iter()
            .map(|key| SubscribeFilter::new(layout.data(key), QoS::AtLeastOnce))
            .collect();

        info!(
            host = %config.mqtt.host,
            port = config.mqtt.port,
            client_id = %config.client_id(),
            "connecting to MQTT broker"
        );

        let driver = EventLoopDriver {
            client: client.clone(),
            filters,
            layout: layout.clone(),
            updates,
            backoff: Backoff::new(ReconnectPolicy::default()),
        };
        let event_loop = tokio::spawn(driver.run(event_loop));

        Self {
            publisher: Arc::new(MqttPublisher { client }),
            event_loop,
        }
    }

    /// Returns the publisher for this connection.
    #[must_use]
    pub fn publisher(&self) -> Arc<MqttPublisher> {
        Arc::clone(&self.publisher)
    }

    /// Disconnects and waits briefly for queued messages to flush.
    pub async fn close(self) {
        if let Err(e) = self.publisher.disconnect().await {
            warn!(error = %e, "MQTT disconnect request failed");
        }
        let mut event_loop = self.event_loop;
        if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut event_loop).await.is_err() {
            warn!("MQTT event loop did not stop in time, aborting");
            event_loop.abort();
        }
    }
}

struct EventLoopDriver {
    client: AsyncClient,
    filters: Vec<SubscribeFilter>,
    layout: TopicLayout,
    updates: mpsc::Sender<ReferenceUpdate>,
    backoff: Backoff,
}

impl EventLoopDriver {
    async fn run(mut self, mut event_loop: EventLoop) {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => self.on_connected(),
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let Some(update) = inbound_update(&self.layout, &publish.topic, &publish.payload)
                    else {
                        continue;
                    };
                    debug!(key = %update.key, "retained reference received");
                    if self.updates.send(update).await.is_err() {
                        debug!("reference listener stopped, dropping update");
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("disconnected from MQTT broker");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        error = %e,
                        failures = self.backoff.failures(),
                        retry_in_ms = delay.as_millis(),
                        "MQTT connection error"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn on_connected(&mut self) {
        if self.backoff.failures() > 0 {
            info!(failures = self.backoff.failures(), "reconnected to MQTT broker");
        } else {
            info!("connected to MQTT broker");
        }
        self.backoff.reset();

        if self.filters.is_empty() {
            return;
        }
        if let Err(e) = self.client.try_subscribe_many(self.filters.clone()) {
            warn!(error = %e, "failed to subscribe to reference topics");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BridgeConfig {
        let mut config = BridgeConfig::sample();
        config.mqtt.host = "broker.local".to_string();
        config.mqtt.port = 1884;
        config
    }

    #[test]
    fn options_carry_offline_last_will() {
        let config = config();
        let layout = TopicLayout::new("envoy", &config.envoy.serial_number);

        let options = mqtt_options(&config, &layout);

        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.client_id(), "envoy-bridge-123456789012");
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        let will = options.last_will().unwrap();
        assert_eq!(will.topic, "envoy/123456789012/lwt");
        assert_eq!(&will.message[..], b"offline");
        assert!(will.retain);
        assert_eq!(will.qos, QoS::AtLeastOnce);
    }

    #[test]
    fn inbound_reference_is_routed() {
        let layout = TopicLayout::new("envoy", "1");

        let update = inbound_update(&layout, "envoy/1/data/prod_eim_whLifetime_00h", b" 1234.5\n").unwrap();

        assert_eq!(update, ReferenceUpdate::new("prod_eim_whLifetime_00h", "1234.5"));
    }

    #[test]
    fn inbound_foreign_topic_is_ignored() {
        let layout = TopicLayout::new("envoy", "1");
        assert!(inbound_update(&layout, "envoy/2/data/prod_eim_whLifetime_00h", b"1").is_none());
        assert!(inbound_update(&layout, "envoy/1/raw/prod_eim_wNow", b"1").is_none());
    }

    #[test]
    fn empty_payload_is_forwarded_as_clear() {
        let layout = TopicLayout::new("envoy", "1");
        let update = inbound_update(&layout, "envoy/1/data/midnight_rollover_date", b"").unwrap();
        assert!(update.payload.is_empty());
    }
}
