//! Device presence tracking.
//!
//! Devices have no connection object the bridge could watch. Liveness is
//! derived from heartbeats instead: a device is online while its last
//! heartbeat is younger than the staleness threshold. Records are never
//! removed, so metadata survives outages.

use crate::error::BridgeError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tether_protocol::envelope::now_millis;
use tether_protocol::{HeartbeatPayload, StatusReport};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Latest known state of a device.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Stable device identifier.
    pub id: String,
    /// Display name.
    pub name: Option<String>,
    /// Reported network address.
    pub address: Option<String>,
    /// Operational status as reported by the device ("on", "off", ...).
    pub status: Option<String>,
    /// Liveness flag.
    pub online: bool,
    /// Capability set.
    pub capabilities: BTreeSet<String>,
    /// Whether on-device voice control is enabled.
    pub voice_enabled: Option<bool>,
    /// Additional fields carried by heartbeats.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
    /// First heartbeat, milliseconds since the Unix epoch.
    pub first_seen: u64,
    /// Last device-originated message, milliseconds since the Unix epoch.
    pub last_seen: u64,
    #[serde(skip)]
    seen_at: Instant,
    #[serde(skip)]
    seq: u64,
}

impl Device {
    fn new(id: impl Into<String>, seq: u64, now: Instant) -> Self {
        let wall = now_millis();
        Self {
            id: id.into(),
            name: None,
            address: None,
            status: None,
            online: true,
            capabilities: BTreeSet::new(),
            voice_enabled: None,
            attributes: Map::new(),
            first_seen: wall,
            last_seen: wall,
            seen_at: now,
            seq,
        }
    }

    /// Check whether the last heartbeat is older than `threshold` at `now`.
    #[must_use]
    pub fn is_stale(&self, now: Instant, threshold: Duration) -> bool {
        now.saturating_duration_since(self.seen_at) > threshold
    }

    /// Time since the device was last heard from.
    #[must_use]
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.seen_at)
    }

    fn mark_seen(&mut self, now: Instant) {
        self.seen_at = now;
        self.last_seen = now_millis();
        self.online = true;
    }

    /// Merge the fields present in a heartbeat. Absent or empty fields
    /// leave the previous value untouched.
    fn merge(&mut self, heartbeat: &HeartbeatPayload) {
        if let Some(name) = non_empty(heartbeat.name.as_deref()) {
            self.name = Some(name.to_string());
        }
        if let Some(address) = non_empty(heartbeat.reported_address()) {
            self.address = Some(address.to_string());
        }
        if let Some(status) = non_empty(heartbeat.status.as_deref()) {
            self.status = Some(status.to_string());
        }
        if let Some(caps) = heartbeat.capabilities.as_ref().filter(|c| !c.is_empty()) {
            self.capabilities = caps.iter().cloned().collect();
        }
        if let Some(enabled) = heartbeat.voice_enabled {
            self.voice_enabled = Some(enabled);
        }
        for (key, value) in &heartbeat.extra {
            if !value.is_null() {
                self.attributes.insert(key.clone(), value.clone());
            }
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// How a device-originated message changed a device's presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    /// First time this device was seen.
    Registered,
    /// Device was already online.
    Refreshed,
    /// Device was offline and is back.
    Recovered,
}

/// Presence store statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceStats {
    /// Number of known devices.
    pub total: usize,
    /// Number of devices currently flagged online.
    pub online: usize,
}

/// Latest known state of every device, keyed by device id.
#[derive(Debug, Default)]
pub struct PresenceStore {
    devices: DashMap<String, Device>,
    next_seq: AtomicU64,
}

impl PresenceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat, creating the device on first sight.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidDeviceId`] if `device_id` is empty.
    pub fn upsert(
        &self,
        device_id: &str,
        heartbeat: &HeartbeatPayload,
    ) -> Result<PresenceChange, BridgeError> {
        if device_id.is_empty() {
            return Err(BridgeError::InvalidDeviceId("device id cannot be empty"));
        }

        let now = Instant::now();
        let change = match self.devices.entry(device_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let device = entry.get_mut();
                let was_online = device.online;
                device.merge(heartbeat);
                device.mark_seen(now);
                if was_online {
                    PresenceChange::Refreshed
                } else {
                    PresenceChange::Recovered
                }
            }
            Entry::Vacant(entry) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let mut device = Device::new(device_id, seq, now);
                device.merge(heartbeat);
                entry.insert(device);
                PresenceChange::Registered
            }
        };

        match change {
            PresenceChange::Registered => {
                info!(device = %device_id, registration = heartbeat.is_registration(), "Device registered")
            }
            PresenceChange::Recovered => info!(device = %device_id, "Device is back online"),
            PresenceChange::Refreshed => debug!(device = %device_id, "Heartbeat"),
        }

        Ok(change)
    }

    /// Record a status report for a known device.
    ///
    /// Returns `false` (and drops the report) if the device has never
    /// sent a heartbeat.
    pub fn record_status(&self, device_id: &str, report: &StatusReport) -> bool {
        let Some(mut device) = self.devices.get_mut(device_id) else {
            warn!(device = %device_id, "Status from unregistered device dropped");
            return false;
        };

        let was_online = device.online;
        if let Some(status) = non_empty(report.status.as_deref()) {
            device.status = Some(status.to_string());
        }
        if let Some(address) = non_empty(report.reported_address()) {
            device.address = Some(address.to_string());
        }
        if let Some(enabled) = report.voice_enabled {
            device.voice_enabled = Some(enabled);
        }
        device.mark_seen(Instant::now());
        drop(device);

        if !was_online {
            info!(device = %device_id, "Device is back online");
        }
        debug!(device = %device_id, status = ?report.status, "Status recorded");
        true
    }

    /// Refresh last-seen for a known device without changing its metadata.
    ///
    /// Returns `None` if the device is unknown.
    pub fn touch(&self, device_id: &str) -> Option<PresenceChange> {
        let mut device = self.devices.get_mut(device_id)?;
        let was_online = device.online;
        device.mark_seen(Instant::now());
        drop(device);

        if was_online {
            Some(PresenceChange::Refreshed)
        } else {
            info!(device = %device_id, "Device is back online");
            Some(PresenceChange::Recovered)
        }
    }

    /// Get a snapshot of one device.
    #[must_use]
    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.devices.get(device_id).map(|d| d.clone())
    }

    /// Snapshot of all devices in registration order.
    #[must_use]
    pub fn list(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.iter().map(|d| d.clone()).collect();
        devices.sort_by_key(|d| d.seq);
        devices
    }

    /// Demote online devices whose last heartbeat is older than `threshold`.
    ///
    /// Returns the number of devices demoted. Offline devices are untouched.
    pub fn sweep_stale(&self, now: Instant, threshold: Duration) -> usize {
        let mut demoted = 0;
        for mut device in self.devices.iter_mut() {
            if device.online && device.is_stale(now, threshold) {
                device.online = false;
                demoted += 1;
                warn!(
                    device = %device.id,
                    silent_secs = device.silence(now).as_secs(),
                    "Device marked offline"
                );
            }
        }
        demoted
    }

    /// Get store statistics.
    #[must_use]
    pub fn stats(&self) -> PresenceStats {
        let mut stats = PresenceStats {
            total: 0,
            online: 0,
        };
        for device in self.devices.iter() {
            stats.total += 1;
            if device.online {
                stats.online += 1;
            }
        }
        stats
    }

    /// Number of known devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if no device has been seen yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
