//! JSON envelopes carried on device topics.
//!
//! Devices are free to add fields; anything not modelled explicitly is kept
//! in an `extra` map so it can be surfaced to callers.
//!
//! Inbound fields are read leniently: a known field carrying the wrong JSON
//! type is treated as absent rather than rejecting the whole message.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Deserialize an optional field, mapping a type mismatch to `None`.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Correlation ids are strings on the wire; numeric ids are accepted too.
fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(id) => Some(id),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    })
}

/// Any non-null `error` marks a failure; structured errors are kept as JSON text.
fn error_detail<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    })
}

/// Heartbeat / registration payload, also used for status reports.
///
/// Every field is optional: a device may send a bare `{}` to assert liveness.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Identifier the device believes it has. The topic is authoritative.
    #[serde(
        rename = "deviceId",
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub device_id: Option<String>,
    /// Display name.
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<String>,
    /// Reported network address.
    #[serde(
        rename = "ip",
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub address: Option<String>,
    /// Network address as spelled in status reports.
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub ip_address: Option<String>,
    /// Operational status, e.g. "on" / "off" / "error".
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub status: Option<String>,
    /// "heartbeat", "registration" or "status".
    #[serde(
        rename = "type",
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub kind: Option<String>,
    /// Capability set.
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub capabilities: Option<Vec<String>>,
    /// Whether on-device voice control is enabled.
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub voice_enabled: Option<bool>,
    /// Device-local timestamp (often uptime millis, not wall clock).
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<u64>,
    /// Any other fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HeartbeatPayload {
    /// Whether this payload announces a (re-)registration.
    #[must_use]
    pub fn is_registration(&self) -> bool {
        self.kind.as_deref() == Some("registration")
    }

    /// The reported address, whichever spelling the device used.
    #[must_use]
    pub fn reported_address(&self) -> Option<&str> {
        self.address.as_deref().or(self.ip_address.as_deref())
    }
}

/// Status report payload; shares the heartbeat field set.
pub type StatusReport = HeartbeatPayload;

/// Command published to `devices/{id}/commands`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Command name, e.g. "turn_on".
    pub command: String,
    /// Correlation identifier echoed back in the response.
    #[serde(rename = "requestId")]
    pub request_id: String,
    /// Dispatch time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl CommandEnvelope {
    /// Create a command envelope stamped with the current time.
    #[must_use]
    pub fn new(command: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            request_id: request_id.into(),
            timestamp: now_millis(),
        }
    }
}

/// Response consumed from `devices/{id}/responses`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Correlation identifier. Responses without one are discarded.
    #[serde(
        rename = "requestId",
        default,
        deserialize_with = "lenient_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub request_id: Option<String>,
    /// Command this response acknowledges, when the device reports it.
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub command: Option<String>,
    /// Device status after handling the command.
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub status: Option<String>,
    /// Error detail reported by the device.
    #[serde(
        default,
        deserialize_with = "error_detail",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<String>,
    /// Explicit success marker.
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub success: Option<bool>,
    /// Device-local timestamp.
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<u64>,
    /// Command-specific fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResponseEnvelope {
    /// A response succeeds unless it carries an `error` or `success: false`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.success != Some(false)
    }
}

/// Out-of-band event payload from `devices/{id}/events`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Recognised voice phrase, for voice triggers.
    #[serde(
        rename = "voiceCommand",
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub voice_command: Option<String>,
    /// Action the device took.
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub action: Option<String>,
    /// Origin of the event, e.g. "voice".
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub source: Option<String>,
    /// Device-generated id. Never correlated with dispatched commands.
    #[serde(
        rename = "requestId",
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub request_id: Option<String>,
    /// Device-local timestamp.
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<u64>,
    /// Any other fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
