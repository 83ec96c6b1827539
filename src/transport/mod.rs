//! Transport layer for broker communication.
//!
//! This module defines the narrow adapter contract the session core
//! consumes, plus the rumqttc-backed implementation. The core never
//! touches wire-level types; everything it knows about the network goes
//! through [`TransportAdapter`].

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConnectionConfig;

pub mod mqtt;

/// Delivery guarantee level for publishes and subscriptions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QosLevel {
    /// At-most-once: fire and forget.
    #[default]
    AtMostOnce,
    /// At-least-once: acknowledged delivery.
    AtLeastOnce,
    /// Exactly-once: assured single delivery.
    ExactlyOnce,
}

impl From<QosLevel> for u8 {
    fn from(qos: QosLevel) -> u8 {
        match qos {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QosLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(format!("invalid QoS level: {other}")),
        }
    }
}

/// Transport-level errors reported by an adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("unsubscribe failed: {0}")]
    UnsubscribeFailed(String),
    #[error("transport is not connected")]
    NotConnected,
}

/// Push-side notifications from the transport.
///
/// These are the adapter's equivalent of the `onMessage` and
/// `onConnectionLost` callbacks of a classic MQTT client API.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An inbound frame arrived on a subscribed topic.
    Message {
        topic: String,
        payload: Bytes,
        qos: QosLevel,
    },
    /// The established connection dropped without a local `close()`.
    ConnectionLost { reason: String },
}

/// Contract between the session core and a concrete transport.
///
/// `open` resolves exactly once per attempt; `send`, `subscribe`, and
/// `unsubscribe` resolve with the ack or the error; `next_event` delivers
/// the push callbacks. `close` is idempotent and releases any partially
/// open socket.
#[async_trait]
pub trait TransportAdapter: Send {
    /// Open a connection to the broker described by `config`.
    async fn open(&mut self, config: &ConnectionConfig) -> Result<(), TransportError>;

    /// Hand one message to the broker. For QoS 0 the hand-off itself
    /// counts as the ack.
    async fn send(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QosLevel,
    ) -> Result<(), TransportError>;

    /// Request a subscription for `filter`.
    async fn subscribe(&mut self, filter: &str, qos: QosLevel) -> Result<(), TransportError>;

    /// Request removal of a subscription for `filter`.
    async fn unsubscribe(&mut self, filter: &str) -> Result<(), TransportError>;

    /// Next push notification, or `None` once the transport is finished.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Release all transport resources. Safe to call repeatedly.
    async fn close(&mut self);
}

/// Type alias for the rumqttc-backed transport.
pub type MqttTransport = mqtt::MqttAdapter;
