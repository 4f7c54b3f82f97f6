//! Successful command results.

use serde::Serialize;
use serde_json::{Map, Value};
use tether_protocol::ResponseEnvelope;

/// Command name for status queries.
pub const GET_STATUS: &str = "get_status";

/// Response fields that describe the envelope rather than the device.
const ENVELOPE_FIELDS: &[&str] = &["deviceId", "type", "source"];

/// Device state embedded in a status query reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    /// Address the device reports for itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Whether on-device voice control is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_enabled: Option<bool>,
}

/// A successful command result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReply {
    /// Request the device answered.
    pub request_id: String,
    /// Responding device.
    pub device_id: String,
    /// Command that was dispatched.
    pub command: String,
    /// Device status after the command.
    pub status: Option<String>,
    /// Extra device state, present for status queries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<DeviceState>,
    /// Any other command-specific fields.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl CommandReply {
    /// A bare acknowledgement.
    #[must_use]
    pub fn ack(
        request_id: impl Into<String>,
        device_id: impl Into<String>,
        command: impl Into<String>,
        status: Option<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            device_id: device_id.into(),
            command: command.into(),
            status,
            state: None,
            details: Map::new(),
        }
    }

    /// Build a reply from a device response.
    ///
    /// Status queries surface the device-reported address and voice flag;
    /// other commands are acknowledgements with whatever extra fields the
    /// device attached.
    #[must_use]
    pub fn from_response(
        request_id: &str,
        device_id: &str,
        command: &str,
        response: &ResponseEnvelope,
    ) -> Self {
        let mut reply = Self::ack(request_id, device_id, command, response.status.clone());
        let mut details = response.extra.clone();
        for field in ENVELOPE_FIELDS {
            details.remove(*field);
        }

        if command == GET_STATUS {
            let address = details
                .remove("ip_address")
                .or_else(|| details.remove("ip"))
                .and_then(|v| v.as_str().map(str::to_string));
            let voice_enabled = details.remove("voice_enabled").and_then(|v| v.as_bool());
            reply.state = Some(DeviceState {
                address,
                voice_enabled,
            });
        }

        reply.details = details;
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(value: Value) -> ResponseEnvelope {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_ack_reply() {
        let resp = response(json!({
            "requestId": "r1",
            "deviceId": "lamp-1",
            "command": "turn_on",
            "success": true,
            "status": "on",
            "source": "mqtt"
        }));
        let reply = CommandReply::from_response("r1", "lamp-1", "turn_on", &resp);

        assert_eq!(reply.status.as_deref(), Some("on"));
        assert!(reply.state.is_none());
        assert!(reply.details.is_empty());
    }

    #[test]
    fn test_status_reply_embeds_state() {
        let resp = response(json!({
            "requestId": "r2",
            "status": "off",
            "ip_address": "10.0.0.7",
            "voice_enabled": false,
            "relay_pin": 5,
            "type": "status"
        }));
        let reply = CommandReply::from_response("r2", "lamp-1", GET_STATUS, &resp);

        let state = reply.state.as_ref().unwrap();
        assert_eq!(state.address.as_deref(), Some("10.0.0.7"));
        assert_eq!(state.voice_enabled, Some(false));
        assert_eq!(reply.details.get("relay_pin"), Some(&json!(5)));
        assert!(reply.details.get("type").is_none());

        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["state"]["voiceEnabled"], false);
        assert_eq!(value["requestId"], "r2");
    }
}
