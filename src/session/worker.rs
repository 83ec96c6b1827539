//! The session worker task.
//!
//! A single task owns the adapter, the subscription registry, the publish
//! queue, and the dispatcher; every mutation is serialized through it, so
//! concurrent callers can never observe torn state. Commands arrive on an
//! mpsc channel; the connected phase additionally selects on the
//! transport's push events.

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use super::dispatcher::Dispatcher;
use super::events::{InboundMessage, SessionEvent};
use super::queue::PublishQueue;
use super::registry::SubscriptionRegistry;
use super::state::{next_reconnect_step, ReconnectDecision, SessionState};
use super::Command;
use crate::config::{ConnectionConfig, SessionConfig};
use crate::error::SessionError;
use crate::observability::metrics::metrics;
use crate::transport::{QosLevel, TransportAdapter, TransportEvent};

/// Outcome of one connect attempt.
enum AttemptOutcome {
    Connected,
    Failed(String),
    Cancelled,
    Shutdown,
}

/// Why the connected phase ended.
enum ConnectedExit {
    Lost(String),
    Disconnected,
    Shutdown,
}

/// Why a backoff wait ended.
enum BackoffExit {
    Elapsed,
    Cancelled,
    Shutdown,
}

/// How a whole connection cycle ended.
enum CycleExit {
    Idle,
    Shutdown,
}

/// Registry, queue, and dispatcher bundled so command handling can run
/// while a connect future holds the adapter borrow.
struct SessionCore {
    registry: SubscriptionRegistry,
    queue: PublishQueue,
    dispatcher: Dispatcher,
    events: broadcast::Sender<SessionEvent>,
    config: SessionConfig,
}

impl SessionCore {
    fn emit(&self, event: SessionEvent) {
        // No live subscriber is fine; events are best-effort notification.
        let _ = self.events.send(event);
    }

    fn subscribe_offline(
        &mut self,
        filter: &str,
        qos: QosLevel,
        handler: Option<mpsc::Sender<InboundMessage>>,
    ) {
        self.registry.upsert(filter, qos);
        if let Some(tx) = handler {
            self.dispatcher.register(filter, tx);
        }
    }

    fn unsubscribe_offline(&mut self, filter: &str) {
        if self.registry.remove(filter) {
            self.dispatcher.unregister(filter);
        }
    }

    fn enqueue_publish(&mut self, topic: String, payload: Bytes, qos: QosLevel) {
        if let Some(dropped) = self.queue.enqueue(topic, payload, qos) {
            metrics().record_queue_overflow();
            warn!(topic = %dropped.topic, "publish queue full, oldest entry dropped");
            self.emit(SessionEvent::QueueOverflow {
                dropped_topic: dropped.topic,
            });
        }
    }
}

pub(super) struct SessionWorker<T: TransportAdapter> {
    adapter: T,
    cmd_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<SessionState>,
    core: SessionCore,
    /// Set when a drain hit a transport error; cleared on the next
    /// successful connect. While set, publishes only accumulate.
    drain_halted: bool,
}

impl<T: TransportAdapter> SessionWorker<T> {
    pub(super) fn new(
        adapter: T,
        cmd_rx: mpsc::Receiver<Command>,
        state_tx: watch::Sender<SessionState>,
        events: broadcast::Sender<SessionEvent>,
        config: SessionConfig,
    ) -> Self {
        let queue = PublishQueue::new(config.max_queue_depth);
        Self {
            adapter,
            cmd_rx,
            state_tx,
            core: SessionCore {
                registry: SubscriptionRegistry::new(),
                queue,
                dispatcher: Dispatcher::new(),
                events,
                config,
            },
            drain_halted: false,
        }
    }

    pub(super) async fn run(mut self) {
        info!("session worker started");
        loop {
            let config = match self.wait_for_connect().await {
                Some(config) => config,
                None => break,
            };
            match self.run_connection_cycle(config).await {
                CycleExit::Idle => continue,
                CycleExit::Shutdown => break,
            }
        }

        // Forced teardown: release transport resources before reporting
        // the final state.
        self.adapter.close().await;
        metrics().set_connected(false);
        self.set_state(SessionState::Disconnected);
        info!("session worker stopped");
    }

    /// Idle phase: `Disconnected` or `Failed`. Subscription and publish
    /// intents still mutate desired state; they settle on the next connect.
    async fn wait_for_connect(&mut self) -> Option<ConnectionConfig> {
        loop {
            match self.cmd_rx.recv().await? {
                Command::Connect { config, reply } => {
                    let _ = reply.send(Ok(()));
                    return Some(config);
                }
                Command::Disconnect { reply } => {
                    // Disconnecting an idle session is a no-op.
                    let _ = reply.send(Ok(()));
                }
                Command::Shutdown => return None,
                Command::Subscribe {
                    filter,
                    qos,
                    handler,
                } => self.core.subscribe_offline(&filter, qos, handler),
                Command::Unsubscribe { filter } => self.core.unsubscribe_offline(&filter),
                Command::Publish {
                    topic,
                    payload,
                    qos,
                } => self.core.enqueue_publish(topic, payload, qos),
            }
        }
    }

    /// One full connection cycle: initial attempt, connected phase, and
    /// the reconnect policy after an unsolicited loss.
    async fn run_connection_cycle(&mut self, config: ConnectionConfig) -> CycleExit {
        // 0 marks the application-initiated attempt; reconnects count up
        // from 1.
        let mut attempt: u32 = 0;
        loop {
            self.set_state(SessionState::Connecting);
            match self.attempt_connect(&config).await {
                AttemptOutcome::Connected => {
                    metrics().record_connection_established();
                    metrics().set_connected(true);
                    if attempt > 0 {
                        metrics().record_reconnection();
                    }
                    attempt = 0;
                    self.drain_halted = false;
                    self.set_state(SessionState::Connected);
                    self.reconcile_subscriptions().await;
                    self.flush_outbound().await;

                    match self.run_connected().await {
                        ConnectedExit::Lost(reason) => {
                            metrics().set_connected(false);
                            warn!(reason = %reason, "connection lost");
                            self.core
                                .emit(SessionEvent::ConnectionLost {
                                    reason: reason.clone(),
                                });
                            self.core.registry.reset_granted();
                            self.core.queue.start_new_cycle();
                            self.adapter.close().await;
                            // Fall through into the reconnect policy.
                        }
                        ConnectedExit::Disconnected => {
                            metrics().set_connected(false);
                            self.adapter.close().await;
                            // Voluntary disconnect keeps the queue intact.
                            self.core.registry.reset_granted();
                            self.set_state(SessionState::Disconnected);
                            return CycleExit::Idle;
                        }
                        ConnectedExit::Shutdown => return CycleExit::Shutdown,
                    }
                }
                AttemptOutcome::Failed(reason) => {
                    metrics().record_connection_failure();
                    error!(reason = %reason, "connect attempt failed");
                    self.core.emit(SessionEvent::ConnectionFailed {
                        reason: reason.clone(),
                    });
                    self.adapter.close().await;
                    if attempt == 0 {
                        // The application-initiated attempt does not retry
                        // by itself; an explicit connect restarts the cycle.
                        self.set_state(SessionState::Failed(reason));
                        return CycleExit::Idle;
                    }
                    // Fall through into the reconnect policy.
                }
                AttemptOutcome::Cancelled => {
                    self.adapter.close().await;
                    self.core.registry.reset_granted();
                    self.set_state(SessionState::Disconnected);
                    return CycleExit::Idle;
                }
                AttemptOutcome::Shutdown => return CycleExit::Shutdown,
            }

            attempt += 1;
            match next_reconnect_step(attempt, &self.core.config.reconnect) {
                ReconnectDecision::GiveUp => {
                    let reason = match self.core.config.reconnect.max_attempts {
                        Some(max) => format!("reconnect attempts exhausted after {max}"),
                        None => "reconnect aborted".to_string(),
                    };
                    error!(reason = %reason, "giving up on reconnection");
                    self.core.emit(SessionEvent::ConnectionFailed {
                        reason: reason.clone(),
                    });
                    self.set_state(SessionState::Failed(reason));
                    return CycleExit::Idle;
                }
                ReconnectDecision::Proceed {
                    attempt: nth,
                    delay,
                } => {
                    self.set_state(SessionState::Reconnecting(nth));
                    info!(attempt = nth, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
                    match self.backoff(delay).await {
                        BackoffExit::Elapsed => continue,
                        BackoffExit::Cancelled => {
                            self.set_state(SessionState::Disconnected);
                            return CycleExit::Idle;
                        }
                        BackoffExit::Shutdown => return CycleExit::Shutdown,
                    }
                }
            }
        }
    }

    /// Run one connect attempt, staying responsive to commands so that
    /// `disconnect` cancels the attempt and releases the half-open socket.
    async fn attempt_connect(&mut self, config: &ConnectionConfig) -> AttemptOutcome {
        metrics().record_connection_attempt();

        enum Input {
            Open(Result<Result<(), crate::transport::TransportError>, tokio::time::error::Elapsed>),
            Cmd(Option<Command>),
        }

        let timeout = self.core.config.connect_timeout();
        let open_fut = tokio::time::timeout(timeout, self.adapter.open(config));
        tokio::pin!(open_fut);

        loop {
            let input = tokio::select! {
                result = &mut open_fut => Input::Open(result),
                cmd = self.cmd_rx.recv() => Input::Cmd(cmd),
            };
            match input {
                Input::Open(Ok(Ok(()))) => return AttemptOutcome::Connected,
                Input::Open(Ok(Err(e))) => return AttemptOutcome::Failed(e.to_string()),
                Input::Open(Err(_)) => {
                    return AttemptOutcome::Failed(SessionError::Timeout.to_string())
                }
                Input::Cmd(None) => return AttemptOutcome::Shutdown,
                Input::Cmd(Some(cmd)) => match cmd {
                    Command::Connect { reply, .. } => {
                        // Only one attempt in flight at a time; concurrent
                        // calls are rejected, not queued.
                        let _ = reply.send(Err(SessionError::AlreadyConnecting));
                    }
                    Command::Disconnect { reply } => {
                        let _ = reply.send(Ok(()));
                        return AttemptOutcome::Cancelled;
                    }
                    Command::Shutdown => return AttemptOutcome::Shutdown,
                    Command::Subscribe {
                        filter,
                        qos,
                        handler,
                    } => self.core.subscribe_offline(&filter, qos, handler),
                    Command::Unsubscribe { filter } => self.core.unsubscribe_offline(&filter),
                    Command::Publish {
                        topic,
                        payload,
                        qos,
                    } => self.core.enqueue_publish(topic, payload, qos),
                },
            }
        }
    }

    /// Connected phase: commands on one side, transport pushes on the other.
    async fn run_connected(&mut self) -> ConnectedExit {
        enum Input {
            Cmd(Option<Command>),
            Transport(Option<TransportEvent>),
        }

        loop {
            let input = tokio::select! {
                cmd = self.cmd_rx.recv() => Input::Cmd(cmd),
                event = self.adapter.next_event() => Input::Transport(event),
            };
            match input {
                Input::Cmd(None) | Input::Cmd(Some(Command::Shutdown)) => {
                    return ConnectedExit::Shutdown
                }
                Input::Cmd(Some(Command::Connect { reply, .. })) => {
                    let _ = reply.send(Err(SessionError::AlreadyConnected));
                }
                Input::Cmd(Some(Command::Disconnect { reply })) => {
                    let _ = reply.send(Ok(()));
                    return ConnectedExit::Disconnected;
                }
                Input::Cmd(Some(Command::Subscribe {
                    filter,
                    qos,
                    handler,
                })) => self.subscribe_connected(filter, qos, handler).await,
                Input::Cmd(Some(Command::Unsubscribe { filter })) => {
                    self.unsubscribe_connected(filter).await
                }
                Input::Cmd(Some(Command::Publish {
                    topic,
                    payload,
                    qos,
                })) => {
                    self.core.enqueue_publish(topic, payload, qos);
                    self.flush_outbound().await;
                }
                Input::Transport(Some(TransportEvent::Message {
                    topic,
                    payload,
                    qos,
                })) => self.handle_inbound(topic, payload, qos),
                Input::Transport(Some(TransportEvent::ConnectionLost { reason })) => {
                    return ConnectedExit::Lost(reason)
                }
                Input::Transport(None) => {
                    return ConnectedExit::Lost("transport event stream closed".to_string())
                }
            }
        }
    }

    async fn subscribe_connected(
        &mut self,
        filter: String,
        qos: QosLevel,
        handler: Option<mpsc::Sender<InboundMessage>>,
    ) {
        self.core.registry.upsert(&filter, qos);
        if let Some(tx) = handler {
            self.core.dispatcher.register(&filter, tx);
        }
        match self.adapter.subscribe(&filter, qos).await {
            Ok(()) => {
                self.core.registry.mark_granted(&filter);
                debug!(filter = %filter, "subscription confirmed");
                self.core.emit(SessionEvent::SubscriptionConfirmed { filter });
            }
            Err(e) => {
                // Surfaced, not retried while connected: retrying against a
                // live broker would mask a permission error. The desired
                // entry stays for the next reconnect.
                warn!(filter = %filter, error = %e, "subscribe failed");
                self.core.emit(SessionEvent::SubscriptionFailed {
                    filter,
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn unsubscribe_connected(&mut self, filter: String) {
        if !self.core.registry.remove(&filter) {
            // Not subscribed: no adapter call, no error.
            return;
        }
        self.core.dispatcher.unregister(&filter);
        if let Err(e) = self.adapter.unsubscribe(&filter).await {
            // Best effort: the broker may keep delivering for a while, and
            // the dispatcher drops messages with no matching handler.
            warn!(filter = %filter, error = %e, "unsubscribe failed");
        }
    }

    /// Re-establish every desired subscription, in insertion order.
    async fn reconcile_subscriptions(&mut self) {
        for (filter, qos) in self.core.registry.desired() {
            match self.adapter.subscribe(&filter, qos).await {
                Ok(()) => {
                    self.core.registry.mark_granted(&filter);
                    self.core.emit(SessionEvent::SubscriptionConfirmed { filter });
                }
                Err(e) => {
                    warn!(filter = %filter, error = %e, "re-subscribe failed");
                    self.core.emit(SessionEvent::SubscriptionFailed {
                        filter,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Hand queued messages to the transport, unconfirmed re-sends first.
    /// A transport error halts the drain; the rest of the queue survives
    /// until the next successful connect.
    async fn flush_outbound(&mut self) {
        if self.drain_halted {
            return;
        }
        for message in self.core.queue.take_resends() {
            match self
                .adapter
                .send(&message.topic, message.payload.clone(), message.qos)
                .await
            {
                Ok(()) => {
                    metrics().record_message_published();
                    self.core.queue.confirm(message.seq);
                }
                Err(e) => {
                    metrics().record_publish_failure();
                    self.drain_halted = true;
                    self.core.emit(SessionEvent::PublishFailed {
                        topic: message.topic.clone(),
                        reason: e.to_string(),
                    });
                    return;
                }
            }
        }

        while let Some(message) = self.core.queue.pop_pending() {
            if message.qos > QosLevel::AtMostOnce {
                self.core.queue.begin_flight(message.clone());
            }
            match self
                .adapter
                .send(&message.topic, message.payload.clone(), message.qos)
                .await
            {
                Ok(()) => {
                    metrics().record_message_published();
                    if message.qos > QosLevel::AtMostOnce {
                        self.core.queue.confirm(message.seq);
                    }
                }
                Err(e) => {
                    metrics().record_publish_failure();
                    self.drain_halted = true;
                    self.core.emit(SessionEvent::PublishFailed {
                        topic: message.topic.clone(),
                        reason: e.to_string(),
                    });
                    return;
                }
            }
        }
    }

    fn handle_inbound(&mut self, topic: String, payload: Bytes, qos: QosLevel) {
        metrics().record_message_received();
        let message = InboundMessage::new(topic, payload, qos);
        self.core.dispatcher.dispatch(&message);
        self.core.emit(SessionEvent::MessageReceived(message));
    }

    /// Interruptible backoff sleep.
    async fn backoff(&mut self, delay: std::time::Duration) -> BackoffExit {
        enum Input {
            Elapsed,
            Cmd(Option<Command>),
        }

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            let input = tokio::select! {
                _ = &mut sleep => Input::Elapsed,
                cmd = self.cmd_rx.recv() => Input::Cmd(cmd),
            };
            match input {
                Input::Elapsed => return BackoffExit::Elapsed,
                Input::Cmd(None) => return BackoffExit::Shutdown,
                Input::Cmd(Some(cmd)) => match cmd {
                    Command::Connect { reply, .. } => {
                        let _ = reply.send(Err(SessionError::AlreadyConnecting));
                    }
                    Command::Disconnect { reply } => {
                        let _ = reply.send(Ok(()));
                        return BackoffExit::Cancelled;
                    }
                    Command::Shutdown => return BackoffExit::Shutdown,
                    Command::Subscribe {
                        filter,
                        qos,
                        handler,
                    } => self.core.subscribe_offline(&filter, qos, handler),
                    Command::Unsubscribe { filter } => self.core.unsubscribe_offline(&filter),
                    Command::Publish {
                        topic,
                        payload,
                        qos,
                    } => self.core.enqueue_publish(topic, payload, qos),
                },
            }
        }
    }

    fn set_state(&self, state: SessionState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        debug!(state = %state, "session state changed");
        let _ = self.state_tx.send(state.clone());
        self.core.emit(SessionEvent::ConnectionStateChanged(state));
    }
}
