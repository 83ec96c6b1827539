//! Testing utilities and mock implementations
//!
//! Provides a scriptable mock transport so the session core can be
//! exercised without an MQTT broker.

pub mod mocks;

pub use mocks::*;
