//! Mock transport adapter for testing.
//!
//! Records every call the session core makes and lets a test inject
//! inbound messages, connection losses, and failures. The adapter half
//! moves into the session; the [`MockTransportControl`] half stays with
//! the test.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::config::ConnectionConfig;
use crate::transport::{QosLevel, TransportAdapter, TransportError, TransportEvent};

#[derive(Debug, Default)]
struct MockState {
    opened: Mutex<Vec<ConnectionConfig>>,
    sent: Mutex<Vec<(String, Bytes, QosLevel)>>,
    subscribed: Mutex<Vec<(String, QosLevel)>>,
    unsubscribed: Mutex<Vec<String>>,
    close_calls: AtomicUsize,
    fail_open: AtomicBool,
    fail_send: AtomicBool,
    fail_subscribe: AtomicBool,
    hang_open: AtomicBool,
}

/// Mock transport for testing
pub struct MockTransport {
    state: Arc<MockState>,
    event_rx: mpsc::Receiver<TransportEvent>,
}

/// Test-side handle for driving and inspecting a [`MockTransport`].
#[derive(Clone)]
pub struct MockTransportControl {
    state: Arc<MockState>,
    event_tx: mpsc::Sender<TransportEvent>,
}

impl MockTransport {
    /// Create an adapter/control pair.
    pub fn new() -> (Self, MockTransportControl) {
        let state = Arc::new(MockState::default());
        let (event_tx, event_rx) = mpsc::channel(64);
        (
            Self {
                state: state.clone(),
                event_rx,
            },
            MockTransportControl { state, event_tx },
        )
    }
}

impl MockTransportControl {
    /// Deliver an inbound message as if the broker pushed it.
    pub async fn push_message(&self, topic: &str, payload: &[u8], qos: QosLevel) {
        let event = TransportEvent::Message {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
            qos,
        };
        self.event_tx
            .send(event)
            .await
            .expect("mock event channel closed");
    }

    /// Simulate an unsolicited connection loss.
    pub async fn drop_connection(&self, reason: &str) {
        self.event_tx
            .send(TransportEvent::ConnectionLost {
                reason: reason.to_string(),
            })
            .await
            .expect("mock event channel closed");
    }

    /// Make subsequent `open` calls fail.
    pub fn fail_opens(&self, fail: bool) {
        self.state.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `open` calls hang until cancelled.
    pub fn hang_opens(&self, hang: bool) {
        self.state.hang_open.store(hang, Ordering::SeqCst);
    }

    /// Make subsequent `send` calls fail.
    pub fn fail_sends(&self, fail: bool) {
        self.state.fail_send.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `subscribe` calls fail.
    pub fn fail_subscribes(&self, fail: bool) {
        self.state.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Configs passed to `open`, in call order.
    pub async fn opened(&self) -> Vec<ConnectionConfig> {
        self.state.opened.lock().await.clone()
    }

    /// Messages handed to `send`, in call order (successful calls only).
    pub async fn sent(&self) -> Vec<(String, Bytes, QosLevel)> {
        self.state.sent.lock().await.clone()
    }

    /// Filters handed to `subscribe`, in call order (successful calls only).
    pub async fn subscribed(&self) -> Vec<(String, QosLevel)> {
        self.state.subscribed.lock().await.clone()
    }

    /// Filters handed to `unsubscribe`, in call order.
    pub async fn unsubscribed(&self) -> Vec<String> {
        self.state.unsubscribed.lock().await.clone()
    }

    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    pub async fn clear_history(&self) {
        self.state.opened.lock().await.clear();
        self.state.sent.lock().await.clear();
        self.state.subscribed.lock().await.clear();
        self.state.unsubscribed.lock().await.clear();
    }
}

#[async_trait]
impl TransportAdapter for MockTransport {
    async fn open(&mut self, config: &ConnectionConfig) -> Result<(), TransportError> {
        if self.state.hang_open.load(Ordering::SeqCst) {
            // Stay pending until the attempt is cancelled or times out.
            std::future::pending::<()>().await;
        }
        if self.state.fail_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "mock connection failure".to_string(),
            ));
        }
        self.state.opened.lock().await.push(config.clone());
        Ok(())
    }

    async fn send(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QosLevel,
    ) -> Result<(), TransportError> {
        if self.state.fail_send.load(Ordering::SeqCst) {
            return Err(TransportError::PublishFailed(
                "mock publish failure".to_string(),
            ));
        }
        self.state
            .sent
            .lock()
            .await
            .push((topic.to_string(), payload, qos));
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str, qos: QosLevel) -> Result<(), TransportError> {
        if self.state.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::SubscriptionFailed(
                "mock subscription failure".to_string(),
            ));
        }
        self.state
            .subscribed
            .lock()
            .await
            .push((filter.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        self.state
            .unsubscribed
            .lock()
            .await
            .push(filter.to_string());
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.event_rx.recv().await
    }

    async fn close(&mut self) {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Convenience connection config for tests.
pub fn test_connection_config() -> ConnectionConfig {
    ConnectionConfig {
        host: "broker.test".to_string(),
        port: 1883,
        client_id: "client-A".to_string(),
        use_tls: false,
        username_env: None,
        password_env: None,
        keep_alive_secs: 60,
    }
}

/// Session config tuned for fast tests.
pub fn test_session_config() -> crate::config::SessionConfig {
    crate::config::SessionConfig {
        connect_timeout_ms: 1_000,
        max_queue_depth: 8,
        event_capacity: 64,
        reconnect: crate::config::ReconnectConfig {
            max_attempts: Some(3),
            base_delay_ms: 10,
            max_delay_ms: 40,
        },
    }
}
