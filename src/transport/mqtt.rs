//! rumqttc-backed transport adapter.
//!
//! One `open()` call corresponds to one broker connection: the adapter
//! polls the rumqttc event loop until the broker's ConnAck arrives, then
//! hands the event loop to a pump task that forwards inbound publishes
//! and connection errors as [`TransportEvent`]s. The adapter never
//! reconnects on its own; failure handling is the session core's job.

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use super::{QosLevel, TransportAdapter, TransportError, TransportEvent};
use crate::config::ConnectionConfig;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// MQTT transport implementation on top of rumqttc (MQTT v5).
pub struct MqttAdapter {
    client: Option<AsyncClient>,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
    pump_handle: Option<JoinHandle<()>>,
}

impl MqttAdapter {
    pub fn new() -> Self {
        Self {
            client: None,
            event_rx: None,
            pump_handle: None,
        }
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.client.as_ref().ok_or(TransportError::NotConnected)
    }
}

impl Default for MqttAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Client identifier for one attempt. An empty configured id gets a
/// generated one to prevent broker-side identifier conflicts across
/// retries.
fn effective_client_id(config: &ConnectionConfig) -> String {
    if config.client_id.is_empty() {
        format!("session-{}", Uuid::new_v4().simple())
    } else {
        config.client_id.clone()
    }
}

/// Build rumqttc options from a connection config.
fn configure_mqtt_options(config: &ConnectionConfig) -> MqttOptions {
    let mut options = MqttOptions::new(effective_client_id(config), &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

    if config.use_tls {
        options.set_transport(rumqttc::Transport::tls_with_default_config());
    }

    if let Some(username) = config.username() {
        options.set_credentials(username, config.password().unwrap_or_default());
    }

    options
}

fn wire_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn session_qos(qos: QoS) -> QosLevel {
    match qos {
        QoS::AtMostOnce => QosLevel::AtMostOnce,
        QoS::AtLeastOnce => QosLevel::AtLeastOnce,
        QoS::ExactlyOnce => QosLevel::ExactlyOnce,
    }
}

/// Forward inbound publishes and connection errors until the connection
/// ends one way or the other.
async fn pump_events(mut event_loop: EventLoop, event_tx: mpsc::Sender<TransportEvent>) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let event = TransportEvent::Message {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    qos: session_qos(publish.qos),
                };
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect(_))) => {
                let _ = event_tx
                    .send(TransportEvent::ConnectionLost {
                        reason: "broker requested disconnect".to_string(),
                    })
                    .await;
                break;
            }
            Ok(event) => {
                debug!(target: "mqtt_transport", "event: {:?}", event);
            }
            Err(e) => {
                let _ = event_tx
                    .send(TransportEvent::ConnectionLost {
                        reason: e.to_string(),
                    })
                    .await;
                break;
            }
        }
    }
}

#[async_trait]
impl TransportAdapter for MqttAdapter {
    async fn open(&mut self, config: &ConnectionConfig) -> Result<(), TransportError> {
        // A fresh attempt always starts from a clean slate.
        self.close().await;

        let options = configure_mqtt_options(config);
        let (client, mut event_loop) = AsyncClient::new(options, 10);

        // Only a ConnAck counts as success, not just any event.
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if matches!(ack.code, ConnectReturnCode::Success) {
                        break;
                    }
                    return Err(TransportError::ConnectionFailed(format!(
                        "broker rejected connection: {:?}",
                        ack.code
                    )));
                }
                Ok(_) => continue,
                Err(e) => return Err(TransportError::ConnectionFailed(e.to_string())),
            }
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.pump_handle = Some(tokio::spawn(pump_events(event_loop, event_tx)));
        self.event_rx = Some(event_rx);
        self.client = Some(client);
        debug!(target: "mqtt_transport", host = %config.host, port = config.port, "transport opened");
        Ok(())
    }

    async fn send(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QosLevel,
    ) -> Result<(), TransportError> {
        self.client()?
            .publish(topic, wire_qos(qos), false, payload.to_vec())
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))
    }

    async fn subscribe(&mut self, filter: &str, qos: QosLevel) -> Result<(), TransportError> {
        self.client()?
            .subscribe(filter, wire_qos(qos))
            .await
            .map_err(|e| TransportError::SubscriptionFailed(e.to_string()))
    }

    async fn unsubscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        self.client()?
            .unsubscribe(filter)
            .await
            .map_err(|e| TransportError::UnsubscribeFailed(e.to_string()))
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        match self.event_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        if let Some(handle) = self.pump_handle.take() {
            handle.abort();
        }
        self.event_rx = None;
    }
}
