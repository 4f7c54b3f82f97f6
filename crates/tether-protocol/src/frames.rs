//! Frame types for the device gateway.
//!
//! Devices that cannot reach a broker directly connect to the bridge over a
//! WebSocket and exchange these frames. Text messages carry JSON frames,
//! binary messages carry length-prefixed MessagePack frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Gateway protocol major version. A `connect` frame must announce exactly
/// this value.
pub const PROTOCOL_MAJOR: u8 = 1;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Subscribe = 0x01,
    Unsubscribe = 0x02,
    Publish = 0x03,
    Ack = 0x05,
    Error = 0x06,
    Ping = 0x07,
    Pong = 0x08,
    Connect = 0x09,
    Connected = 0x0A,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Subscribe),
            0x02 => Ok(FrameType::Unsubscribe),
            0x03 => Ok(FrameType::Publish),
            0x05 => Ok(FrameType::Ack),
            0x06 => Ok(FrameType::Error),
            0x07 => Ok(FrameType::Ping),
            0x08 => Ok(FrameType::Pong),
            0x09 => Ok(FrameType::Connect),
            0x0A => Ok(FrameType::Connected),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Error codes carried in [`Frame::Error`].
pub mod error_codes {
    /// Malformed frame.
    pub const INVALID_FRAME: u16 = 1001;
    /// Invalid topic filter.
    pub const INVALID_FILTER: u16 = 1002;
    /// Publish rejected by the broker.
    pub const PUBLISH_REJECTED: u16 = 1003;
    /// Incompatible protocol version.
    pub const UNSUPPORTED_VERSION: u16 = 1004;
    /// Unsubscribe from a filter that was never subscribed.
    pub const NOT_SUBSCRIBED: u16 = 1008;
}

/// A gateway frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Subscribe to a topic filter.
    #[serde(rename = "subscribe")]
    Subscribe {
        /// Request ID for acknowledgment.
        id: u64,
        /// Topic filter, e.g. `devices/lamp-1/commands`.
        topic: String,
    },

    /// Unsubscribe from a topic filter.
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        /// Request ID for acknowledgment.
        id: u64,
        /// Topic filter previously subscribed.
        topic: String,
    },

    /// Publish a message to a topic.
    #[serde(rename = "publish")]
    Publish {
        /// Optional request ID for acknowledgment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Concrete topic name.
        topic: String,
        /// JSON payload.
        payload: Value,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code, see [`error_codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Initial handshake from the device.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol major version.
        version: u8,
        /// Optional client identifier, usually the device id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Handshake response from the gateway.
    #[serde(rename = "connected")]
    Connected {
        /// Gateway-assigned session identifier.
        session_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended keepalive interval in milliseconds.
        keepalive: u32,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Subscribe { .. } => FrameType::Subscribe,
            Frame::Unsubscribe { .. } => FrameType::Unsubscribe,
            Frame::Publish { .. } => FrameType::Publish,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
        }
    }

    /// Create a new Subscribe frame.
    #[must_use]
    pub fn subscribe(id: u64, topic: impl Into<String>) -> Self {
        Frame::Subscribe {
            id,
            topic: topic.into(),
        }
    }

    /// Create a new Unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(id: u64, topic: impl Into<String>) -> Self {
        Frame::Unsubscribe {
            id,
            topic: topic.into(),
        }
    }

    /// Create a new Publish frame.
    #[must_use]
    pub fn publish(topic: impl Into<String>, payload: Value) -> Self {
        Frame::Publish {
            id: None,
            topic: topic.into(),
            payload,
        }
    }

    /// Create a new Publish frame with ID for acknowledgment.
    #[must_use]
    pub fn publish_with_ack(id: u64, topic: impl Into<String>, payload: Value) -> Self {
        Frame::Publish {
            id: Some(id),
            topic: topic.into(),
            payload,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, client_id: Option<String>) -> Self {
        Frame::Connect { version, client_id }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(session_id: impl Into<String>, version: u8, keepalive: u32) -> Self {
        Frame::Connected {
            session_id: session_id.into(),
            version,
            keepalive,
        }
    }
}
