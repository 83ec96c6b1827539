//! Application-facing session events.
//!
//! Everything the application needs to learn about the session arrives
//! through these events; polling [`SessionHandle::state`](super::SessionHandle::state)
//! is for display only.

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::state::SessionState;
use crate::transport::QosLevel;

/// An inbound frame after the dispatcher has shaped it.
///
/// Ephemeral: handed to matching handlers and event subscribers, then
/// dropped. The core keeps no message history.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QosLevel,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: String, payload: Bytes, qos: QosLevel) -> Self {
        Self {
            topic,
            payload,
            qos,
            received_at: Utc::now(),
        }
    }

    /// Payload as UTF-8 text, lossy.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).to_string()
    }
}

/// Events emitted by the session core.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The lifecycle state changed.
    ConnectionStateChanged(SessionState),
    /// A connect attempt failed; terminal unless a reconnect cycle is running.
    ConnectionFailed { reason: String },
    /// An established connection dropped unsolicited.
    ConnectionLost { reason: String },
    /// The broker acknowledged a subscription.
    SubscriptionConfirmed { filter: String },
    /// The broker (or transport) refused a subscription. The desired
    /// entry stays in place and is retried on the next reconnect.
    SubscriptionFailed { filter: String, reason: String },
    /// A queued publish could not be handed to the transport.
    PublishFailed { topic: String, reason: String },
    /// The bounded queue evicted its oldest unsent entry.
    QueueOverflow { dropped_topic: String },
    /// An inbound message arrived on a subscribed topic.
    MessageReceived(InboundMessage),
}
