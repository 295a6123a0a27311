//! MQTT event source.
//!
//! Each opened stream is its own broker session: a dedicated client
//! subscribed to the device's telemetry topic, polled for publishes. The
//! device identity property is stamped from the subscribed topic, so the
//! decoder's identity check holds regardless of what the broker delivers.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tracing::debug;

use crate::config::MqttSettings;
use crate::decode::{RawEvent, DEVICE_ID_PROPERTY};
use crate::error::UpstreamError;
use crate::upstream::{EventSource, EventStream};

/// Capacity of the client's request channel; subscriptions are the only
/// requests issued, so this never fills in practice.
const CLIENT_CHANNEL_CAPACITY: usize = 64;

/// Opens one MQTT session per device subscription.
pub struct MqttEventSource {
    settings: MqttSettings,
}

impl MqttEventSource {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl EventSource for MqttEventSource {
    async fn open(&self, device_id: &str) -> Result<Box<dyn EventStream>, UpstreamError> {
        let client_id = format!("{}-{device_id}", self.settings.client_id_prefix);
        let mut options = MqttOptions::new(
            client_id,
            self.settings.broker_host.as_str(),
            self.settings.broker_port,
        );
        options.set_keep_alive(self.settings.keep_alive);
        if let (Some(username), Some(password)) =
            (&self.settings.username, &self.settings.password)
        {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, CLIENT_CHANNEL_CAPACITY);
        let topic = self.settings.topic_for(device_id);
        client
            .subscribe(topic.as_str(), QoS::AtLeastOnce)
            .await
            .map_err(|err| UpstreamError::Connect(err.to_string()))?;
        debug!(device_id = %device_id, topic = %topic, "mqtt subscription requested");

        Ok(Box::new(MqttEventStream {
            device_id: device_id.to_string(),
            client,
            event_loop,
        }))
    }
}

struct MqttEventStream {
    device_id: String,
    client: AsyncClient,
    event_loop: EventLoop,
}

#[async_trait]
impl EventStream for MqttEventStream {
    async fn next_event(&mut self) -> Option<Result<RawEvent, UpstreamError>> {
        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let mut properties = HashMap::new();
                    // The stream is filtered to one topic, so the publish is
                    // attributable to the subscribed device.
                    properties.insert(DEVICE_ID_PROPERTY.to_string(), self.device_id.clone());
                    return Some(Ok(RawEvent {
                        properties,
                        payload: publish.payload.clone(),
                        enqueued_at: Some(Utc::now()),
                    }));
                }
                // Acks, pings and outgoing traffic are connection noise.
                Ok(_) => continue,
                Err(err) => return Some(Err(UpstreamError::Receive(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.client.disconnect().await {
            debug!(device_id = %self.device_id, error = %err, "mqtt disconnect failed");
        }
        // Drain until the broker acknowledges the disconnect or errors out;
        // bounded so a wedged broker cannot stall eviction.
        let drain = async {
            while let Ok(event) = self.event_loop.poll().await {
                if matches!(event, Event::Incoming(Packet::Disconnect)) {
                    break;
                }
            }
        };
        let _ = tokio::time::timeout(Duration::from_secs(1), drain).await;
    }
}
