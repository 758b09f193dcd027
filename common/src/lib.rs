//! Shared pieces of the sensor node and the test subscriber.
//!
//! Everything in here is hardware independent: the node loop talks to the
//! radio, the sensor and the broker through the traits in [`node`], which the
//! firmware implements for the device and for desktop simulation.

pub mod config;
pub mod interval;
pub mod node;
pub mod reading;
pub mod retry;

pub use config::{ConfigError, NodeConfig, SensorConfig, SensorKind, SubscriberConfig};
pub use reading::{Message, MessageError, Reading};
pub use retry::{Backoff, RetryPolicy};
