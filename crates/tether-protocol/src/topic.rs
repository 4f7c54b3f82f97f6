//! Topic namespace and topic filters.
//!
//! Topics are slash-delimited. Filters may use `+` to match exactly one
//! segment and a trailing `#` to match any remaining segments.

use std::fmt;

/// Root segment of every device topic.
pub const DEVICE_ROOT: &str = "devices";

/// Maximum topic length in bytes.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Single-level wildcard.
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

/// Multi-level wildcard (only valid as the last segment).
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// The kind of message carried on a device topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// Periodic liveness assertion (also used for registration).
    Heartbeat,
    /// Unsolicited status report.
    Status,
    /// Acknowledgement of a previously published command.
    Responses,
    /// Device-originated notification (`events`, or `audio` for voice triggers).
    Events,
    /// Commands published by the bridge.
    Commands,
    /// Anything else under a device.
    Other(String),
}

impl TopicKind {
    /// Map a topic segment to its kind.
    #[must_use]
    pub fn from_segment(segment: &str) -> Self {
        match segment {
            "heartbeat" => TopicKind::Heartbeat,
            "status" => TopicKind::Status,
            "responses" => TopicKind::Responses,
            "events" | "audio" => TopicKind::Events,
            "commands" => TopicKind::Commands,
            other => TopicKind::Other(other.to_string()),
        }
    }

    /// The canonical topic segment for this kind.
    #[must_use]
    pub fn as_segment(&self) -> &str {
        match self {
            TopicKind::Heartbeat => "heartbeat",
            TopicKind::Status => "status",
            TopicKind::Responses => "responses",
            TopicKind::Events => "events",
            TopicKind::Commands => "commands",
            TopicKind::Other(s) => s,
        }
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_segment())
    }
}

/// A parsed device topic: `devices/{deviceId}/{kind}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    device_id: String,
    kind: TopicKind,
}

impl Topic {
    /// Create a topic for a device and message kind.
    #[must_use]
    pub fn new(device_id: impl Into<String>, kind: TopicKind) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
        }
    }

    /// The command topic for a device.
    #[must_use]
    pub fn commands(device_id: impl Into<String>) -> Self {
        Self::new(device_id, TopicKind::Commands)
    }

    /// Parse a concrete topic name.
    ///
    /// Returns `None` if the topic is not a three-segment device topic
    /// with a non-empty device id.
    #[must_use]
    pub fn parse(topic: &str) -> Option<Self> {
        let mut segments = topic.split('/');
        let root = segments.next()?;
        let device_id = segments.next()?;
        let kind = segments.next()?;

        if root != DEVICE_ROOT || device_id.is_empty() || kind.is_empty() {
            return None;
        }
        if segments.next().is_some() {
            return None;
        }

        Some(Self::new(device_id, TopicKind::from_segment(kind)))
    }

    /// The device identifier.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The message kind.
    #[must_use]
    pub fn kind(&self) -> &TopicKind {
        &self.kind
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", DEVICE_ROOT, self.device_id, self.kind)
    }
}

/// Validate a concrete (publishable) topic name.
///
/// # Errors
///
/// Returns an error message if the topic is empty, too long, has empty
/// segments or contains wildcards.
pub fn validate_topic(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("Topic cannot be empty");
    }
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err("Topic too long");
    }
    if !topic.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Topic contains invalid characters");
    }
    for segment in topic.split('/') {
        if segment.is_empty() {
            return Err("Topic contains an empty segment");
        }
        if segment == SINGLE_LEVEL_WILDCARD || segment == MULTI_LEVEL_WILDCARD {
            return Err("Wildcards are not allowed in topic names");
        }
    }
    Ok(())
}

/// A subscription filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter {
    raw: String,
}

impl TopicFilter {
    /// Parse a topic filter.
    ///
    /// # Errors
    ///
    /// Returns an error message if the filter is empty, too long, has
    /// empty segments or a misplaced `#`.
    pub fn new(filter: impl Into<String>) -> Result<Self, &'static str> {
        let raw = filter.into();
        if raw.is_empty() {
            return Err("Filter cannot be empty");
        }
        if raw.len() > MAX_TOPIC_LENGTH {
            return Err("Filter too long");
        }

        let segments: Vec<&str> = raw.split('/').collect();
        let last = segments.len() - 1;
        for (i, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                return Err("Filter contains an empty segment");
            }
            if *segment == MULTI_LEVEL_WILDCARD && i != last {
                return Err("'#' must be the last segment");
            }
            if segment.len() > 1 && (segment.contains('+') || segment.contains('#')) {
                return Err("Wildcards must occupy a whole segment");
            }
        }

        Ok(Self { raw })
    }

    /// Filter matching every device topic of one kind: `devices/+/{kind}`.
    #[must_use]
    pub fn all_devices(kind: &TopicKind) -> Self {
        Self {
            raw: format!("{}/{}/{}", DEVICE_ROOT, SINGLE_LEVEL_WILDCARD, kind),
        }
    }

    /// The filter as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Check whether a concrete topic matches this filter.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        let mut filter = self.raw.split('/');
        let mut name = topic.split('/');

        loop {
            match (filter.next(), name.next()) {
                (Some(MULTI_LEVEL_WILDCARD), _) => return true,
                (Some(SINGLE_LEVEL_WILDCARD), Some(segment)) => {
                    if segment.is_empty() {
                        return false;
                    }
                }
                (Some(expected), Some(segment)) => {
                    if expected != segment {
                        return false;
                    }
                }
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
