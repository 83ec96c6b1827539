//! Client-side session core.
//!
//! One [`Session`] owns one connection lifecycle: a dedicated worker task
//! arbitrates connect attempts, reconciles the subscription registry
//! after every (re)connect, drains the outbound publish queue, and
//! dispatches inbound messages. Applications drive it through a cloneable
//! [`SessionHandle`] and observe it through the event channel.

use bytes::Bytes;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod dispatcher;
pub mod events;
pub mod queue;
pub mod registry;
pub mod state;
mod worker;

pub use events::{InboundMessage, SessionEvent};
pub use queue::OutboundMessage;
pub use registry::Subscription;
pub use state::SessionState;

use crate::config::{ConnectionConfig, SessionConfig};
use crate::error::{SessionError, SessionResult};
use crate::transport::{QosLevel, TransportAdapter};
use worker::SessionWorker;

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Intents sent from handles to the worker.
pub(crate) enum Command {
    Connect {
        config: ConnectionConfig,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<SessionResult<()>>,
    },
    Subscribe {
        filter: String,
        qos: QosLevel,
        handler: Option<mpsc::Sender<InboundMessage>>,
    },
    Unsubscribe {
        filter: String,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QosLevel,
    },
    Shutdown,
}

/// Owner of the session worker. Teardown is bound to this value's
/// lifetime; dropping it aborts the worker, `shutdown()` stops it
/// gracefully.
pub struct Session {
    handle: SessionHandle,
    worker: Option<JoinHandle<()>>,
}

impl Session {
    /// Start the session worker on the current tokio runtime.
    pub fn spawn<T>(config: SessionConfig, adapter: T) -> Self
    where
        T: TransportAdapter + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let worker = SessionWorker::new(adapter, cmd_rx, state_tx, events_tx.clone(), config);
        let join = tokio::spawn(worker.run());

        Session {
            handle: SessionHandle {
                cmd_tx,
                state_rx,
                events_tx,
            },
            worker: Some(join),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Stop the worker, cancelling any in-flight attempt and releasing
    /// transport resources.
    pub async fn shutdown(mut self) {
        let _ = self.handle.cmd_tx.send(Command::Shutdown).await;
        if let Some(join) = self.worker.take() {
            let abort = join.abort_handle();
            match tokio::time::timeout(Duration::from_secs(2), join).await {
                Ok(Ok(())) => info!("session shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!("session worker ended with error: {e}")
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("session worker did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Cannot run async teardown here; shutdown() is the graceful path.
        if let Some(join) = self.worker.take() {
            join.abort();
        }
    }
}

/// Cloneable application-facing handle.
///
/// All intents are non-blocking: they enqueue a command and return after
/// the worker's synchronous validation, never waiting on network I/O.
/// Outcomes arrive as [`SessionEvent`]s.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<SessionState>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    /// Start a connect attempt. Rejected with `AlreadyConnecting` while an
    /// attempt is in flight and `AlreadyConnected` while connected; the
    /// attempt's outcome itself is reported through events.
    pub async fn connect(&self, config: ConnectionConfig) -> SessionResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect {
                config,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        reply_rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    /// Tear down the current connection or cancel the in-flight attempt.
    /// The outbound queue is kept; `granted` flags are cleared.
    pub async fn disconnect(&self) -> SessionResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Disconnect { reply: reply_tx })
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        reply_rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    /// Add `filter` to the desired subscription set.
    pub async fn subscribe(
        &self,
        filter: impl Into<String>,
        qos: QosLevel,
    ) -> SessionResult<()> {
        self.cmd_tx
            .send(Command::Subscribe {
                filter: filter.into(),
                qos,
                handler: None,
            })
            .await
            .map_err(|_| SessionError::SessionClosed)
    }

    /// Add `filter` to the desired set and register a handler channel
    /// that receives every matching inbound message in arrival order.
    pub async fn subscribe_with_handler(
        &self,
        filter: impl Into<String>,
        qos: QosLevel,
        handler: mpsc::Sender<InboundMessage>,
    ) -> SessionResult<()> {
        self.cmd_tx
            .send(Command::Subscribe {
                filter: filter.into(),
                qos,
                handler: Some(handler),
            })
            .await
            .map_err(|_| SessionError::SessionClosed)
    }

    /// Remove `filter` from the desired set. A no-op when the filter is
    /// not subscribed.
    pub async fn unsubscribe(&self, filter: impl Into<String>) -> SessionResult<()> {
        self.cmd_tx
            .send(Command::Unsubscribe {
                filter: filter.into(),
            })
            .await
            .map_err(|_| SessionError::SessionClosed)
    }

    /// Queue one message for publication. Never blocks: while no
    /// connection is available the message waits in the bounded queue.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QosLevel,
    ) -> SessionResult<()> {
        self.cmd_tx
            .send(Command::Publish {
                topic: topic.into(),
                payload: payload.into(),
                qos,
            })
            .await
            .map_err(|_| SessionError::SessionClosed)
    }

    /// Instantaneous state, for display. Correctness decisions belong on
    /// the event channel.
    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    /// Watch channel mirroring every state change.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Subscribe to session events from this point on.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }
}
