//! # tether-protocol
//!
//! Wire definitions shared by every Tether component.
//!
//! Devices and the bridge talk over a hierarchical, slash-delimited topic
//! namespace:
//!
//! ```text
//! devices/{deviceId}/heartbeat   device -> bridge   liveness + metadata
//! devices/{deviceId}/status      device -> bridge   unsolicited status
//! devices/{deviceId}/responses   device -> bridge   command acknowledgements
//! devices/{deviceId}/events      device -> bridge   out-of-band notifications
//! devices/{deviceId}/commands    bridge -> device   command envelopes
//! ```
//!
//! Payloads on those topics are JSON objects described in [`envelope`].
//! Devices that reach the bridge through its WebSocket gateway wrap their
//! publishes and subscriptions in [`Frame`]s.
//!
//! ## Example
//!
//! ```rust
//! use tether_protocol::{codec, Frame, Topic, TopicKind};
//!
//! let topic = Topic::parse("devices/lamp-1/heartbeat").unwrap();
//! assert_eq!(topic.device_id(), "lamp-1");
//! assert_eq!(topic.kind(), &TopicKind::Heartbeat);
//!
//! let frame = Frame::publish("devices/lamp-1/status", serde_json::json!({"status": "on"}));
//! let text = codec::encode_text(&frame).unwrap();
//! assert_eq!(codec::decode_text(&text).unwrap(), frame);
//! ```

pub mod codec;
pub mod envelope;
pub mod frames;
pub mod topic;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{
    CommandEnvelope, EventPayload, HeartbeatPayload, ResponseEnvelope, StatusReport,
};
pub use frames::{Frame, FrameType, PROTOCOL_MAJOR};
pub use topic::{Topic, TopicFilter, TopicKind};
