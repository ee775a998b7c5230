//! bus-publisher: resilient publishing of sensor messages to a message bus
//!
//! The [`Publisher`] owns the only network connection of the bridge. Producers hand it
//! [`PublishMessage`]s through a bounded FIFO queue; a worker task drains the queue over a
//! [`BusClient`], reconnecting with capped exponential backoff when the link drops.
//!
//! Delivery is at-most-once with respect to the broker: a message the transport accepted
//! is never resent, so broker-side failures may lose messages, and a session that dies
//! between hand-off and transmission loses what the transport had buffered.

mod types;
pub use types::{
    BackoffConfig, ConnectionState, OverflowPolicy, PublishMessage, PublisherConfig, Qos,
    ShutdownReport,
};

mod error;
pub use error::{PublishError, Result};

mod traits;
pub use traits::BusClient;

mod publisher;
pub use publisher::{Publisher, PublisherStats, StatsSnapshot};

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{Delivered, MockBroker, MockClient};

#[cfg(feature = "mqtt")]
mod rumqtt;

#[cfg(feature = "mqtt")]
pub use rumqtt::{MqttSettings, RumqttClient};
