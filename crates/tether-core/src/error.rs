//! Bridge errors.
//!
//! Every dispatch resolves with exactly one of these or a reply.

use thiserror::Error;

/// Errors surfaced by the presence store, correlation table and dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// Device identifier is unusable.
    #[error("Invalid device id: {0}")]
    InvalidDeviceId(&'static str),

    /// The device has never sent a heartbeat.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The device is known but its heartbeats have gone stale.
    #[error("Device is offline: {0}")]
    DeviceOffline(String),

    /// The transport refused the command.
    #[error("Failed to publish command: {0}")]
    PublishFailure(String),

    /// No response arrived before the deadline.
    #[error("No response from {device} to request {request_id} within {timeout_ms} ms")]
    Timeout {
        /// Request that timed out.
        request_id: String,
        /// Target device.
        device: String,
        /// How long the request was allowed to wait.
        timeout_ms: u64,
    },

    /// The device answered with an error.
    #[error("Device {device} reported an error: {message}")]
    CommandFailure {
        /// Request the device answered.
        request_id: String,
        /// Responding device.
        device: String,
        /// Device-provided detail.
        message: String,
        /// Device status at the time of the response, if reported.
        status: Option<String>,
    },

    /// A request identifier was registered twice.
    #[error("Duplicate request id: {0}")]
    DuplicateRequestId(String),
}

impl BridgeError {
    /// Short, stable name for logs and metric labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::InvalidDeviceId(_) => "invalid_device_id",
            BridgeError::DeviceNotFound(_) => "device_not_found",
            BridgeError::DeviceOffline(_) => "device_offline",
            BridgeError::PublishFailure(_) => "publish_failure",
            BridgeError::Timeout { .. } => "timeout",
            BridgeError::CommandFailure { .. } => "command_failure",
            BridgeError::DuplicateRequestId(_) => "duplicate_request_id",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::Timeout {
            request_id: "r1".into(),
            device: "lamp-1".into(),
            timeout_ms: 5000,
        };
        assert_eq!(
            err.to_string(),
            "No response from lamp-1 to request r1 within 5000 ms"
        );
        assert_eq!(err.kind(), "timeout");
    }
}
