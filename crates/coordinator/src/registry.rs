//! Device liveness and recipient selection

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use color_eyre::Result;
use color_eyre::eyre::eyre;
use swarmsync_transport::DeviceInfo;
use tracing::{debug, info};

/// Seconds between liveness sweeps
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(3);

/// A device whose last ping is older than this is marked offline
pub const PING_TIMEOUT: Duration = Duration::from_secs(9);

#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub device_id: String,
    pub user_id: String,
    pub online: bool,
    pub away: bool,
    /// Only meaningful while online
    pub last_ping: Option<Instant>,
    /// Seconds since the Unix epoch
    pub last_synchronization: Option<u64>,
}

impl DeviceRecord {
    #[must_use]
    pub fn new(device_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            user_id: user_id.into(),
            online: false,
            away: false,
            last_ping: None,
            last_synchronization: None,
        }
    }

    #[must_use]
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            device_id: self.device_id.clone(),
            user_id: self.user_id.clone(),
            online: self.online,
            away: self.away,
            last_synchronization: self.last_synchronization,
        }
    }
}

/// All known devices, keyed by id
#[derive(Debug, Default)]
pub struct PeerRegistry {
    devices: BTreeMap<String, DeviceRecord>,
}

impl PeerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a device.
    ///
    /// A record that arrives already online has its ping clock started at `now`, so
    /// a restarted coordinator evicts it only if it stays silent.
    pub fn register(&mut self, mut record: DeviceRecord, now: Instant) {
        if record.online && record.last_ping.is_none() {
            record.last_ping = Some(now);
        }
        self.devices.insert(record.device_id.clone(), record);
    }

    #[must_use]
    pub fn get(&self, device_id: &str) -> Option<&DeviceRecord> {
        self.devices.get(device_id)
    }

    fn get_mut(&mut self, device_id: &str) -> Result<&mut DeviceRecord> {
        self.devices
            .get_mut(device_id)
            .ok_or_else(|| eyre!("unknown device {device_id}"))
    }

    /// Record a ping; returns whether the device just came online
    ///
    /// # Errors
    /// Returns an error for an unregistered device
    pub fn heartbeat(&mut self, device_id: &str, now: Instant) -> Result<bool> {
        let record = self.get_mut(device_id)?;
        let came_online = !record.online;
        record.online = true;
        record.last_ping = Some(now);
        if came_online {
            info!("{device_id} is online");
        }
        Ok(came_online)
    }

    /// # Errors
    /// Returns an error for an unregistered device
    pub fn set_offline(&mut self, device_id: &str) -> Result<()> {
        let record = self.get_mut(device_id)?;
        record.online = false;
        record.last_ping = None;
        Ok(())
    }

    /// # Errors
    /// Returns an error for an unregistered device
    pub fn set_away(&mut self, device_id: &str, away: bool) -> Result<()> {
        self.get_mut(device_id)?.away = away;
        Ok(())
    }

    /// # Errors
    /// Returns an error for an unregistered device
    pub fn record_synchronization(&mut self, device_id: &str, at: u64) -> Result<()> {
        self.get_mut(device_id)?.last_synchronization = Some(at);
        Ok(())
    }

    /// Mark offline every device silent for longer than `timeout`; returns their ids
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<String> {
        let mut evicted = Vec::new();
        for record in self.devices.values_mut().filter(|r| r.online) {
            let stale = record
                .last_ping
                .is_none_or(|ping| now.saturating_duration_since(ping) > timeout);
            if stale {
                record.online = false;
                record.last_ping = None;
                evicted.push(record.device_id.clone());
            }
        }
        if !evicted.is_empty() {
            debug!("Evicted {evicted:?}");
        }
        evicted
    }

    fn peers_of<'a>(&'a self, device_id: &'a str) -> impl Iterator<Item = &'a DeviceRecord> + 'a {
        let user = self.devices.get(device_id).map(|r| r.user_id.as_str());
        self.devices.values().filter(move |r| {
            r.online && r.device_id != device_id && Some(r.user_id.as_str()) == user
        })
    }

    /// Online peer with the most recent synchronization; ties go to the lowest id
    #[must_use]
    pub fn reconciliation_target(&self, requester: &str) -> Option<String> {
        self.peers_of(requester)
            .max_by_key(|r| (r.last_synchronization, Reverse(r.device_id.as_str())))
            .map(|r| r.device_id.clone())
    }

    /// Online, non-away peers of the same user
    #[must_use]
    pub fn broadcast_targets(&self, requester: &str) -> Vec<String> {
        self.peers_of(requester)
            .filter(|r| !r.away)
            .map(|r| r.device_id.clone())
            .collect()
    }

    #[must_use]
    pub fn devices_of(&self, user_id: &str) -> Vec<DeviceInfo> {
        self.devices
            .values()
            .filter(|r| r.user_id == user_id)
            .map(DeviceRecord::info)
            .collect()
    }
}
