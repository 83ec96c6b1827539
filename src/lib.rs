//! Client-side MQTT session core.
//!
//! This crate manages the stateful half of an MQTT-style pub/sub client:
//! - Connection lifecycle with single-attempt arbitration and bounded
//!   exponential-backoff reconnection
//! - Desired-state subscription bookkeeping, reconciled against the
//!   broker after every (re)connect
//! - A bounded outbound publish queue that drains once connected, with
//!   re-send of unconfirmed acknowledged-delivery messages
//! - Inbound dispatch to per-filter handlers with MQTT wildcard matching
//!
//! The wire protocol itself lives behind the narrow
//! [`TransportAdapter`](transport::TransportAdapter) contract; a
//! rumqttc-backed implementation is included.
//!
//! # Quick Start
//!
//! ```no_run
//! use mqtt_session::config::ClientConfig;
//! use mqtt_session::session::Session;
//! use mqtt_session::transport::{MqttTransport, QosLevel};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::from_toml_str(
//!     r#"
//! [connection]
//! host = "broker.test"
//! "#,
//! )?;
//!
//! let session = Session::spawn(config.session.clone(), MqttTransport::new());
//! let handle = session.handle();
//!
//! handle.connect(config.connection.clone()).await?;
//! handle.subscribe("home/+", QosLevel::AtMostOnce).await?;
//! handle
//!     .publish("home/greeting", "hello", QosLevel::AtMostOnce)
//!     .await?;
//!
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::{ClientConfig, ConnectionConfig, ReconnectConfig, SessionConfig};
pub use error::{SessionError, SessionResult};
pub use session::{
    InboundMessage, OutboundMessage, Session, SessionEvent, SessionHandle, SessionState,
    Subscription,
};
pub use transport::{MqttTransport, QosLevel, TransportAdapter, TransportError, TransportEvent};
