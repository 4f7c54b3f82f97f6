//! # tether-transport
//!
//! Transport abstraction layer for the Tether bridge.
//!
//! The bridge only needs three primitives from a pub/sub transport:
//! subscribe to a topic filter, publish to a topic, and receive the
//! messages matching its subscriptions. The [`Transport`] trait captures
//! exactly that; reconnect policy and delivery guarantees belong to the
//! implementation.
//!
//! Two implementations ship with the crate:
//!
//! - [`MqttTransport`] (feature `mqtt`, on by default) talks to an external
//!   MQTT broker, which is what field devices connect to.
//! - [`LocalBroker`] is an in-process broker used when devices reach the
//!   server through its WebSocket gateway, and by tests.
//!
//! ```rust,ignore
//! use tether_transport::{LocalBroker, Transport};
//!
//! let broker = LocalBroker::new();
//! let mut sub = broker.subscribe("devices/+/heartbeat").await?;
//! broker.publish("devices/lamp-1/heartbeat", "{}".into()).await?;
//! let msg = sub.recv().await.unwrap();
//! assert_eq!(msg.topic, "devices/lamp-1/heartbeat");
//! ```

pub mod broker;
mod fanout;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod traits;

pub use broker::{BrokerConfig, BrokerStats, LocalBroker};
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttConfig, MqttTransport};
pub use traits::{Subscription, SubscriptionId, Transport, TransportError, TransportMessage};
