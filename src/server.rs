//! ==============================================================================
//! server.rs - relay servers
//! ==============================================================================
//!
//! purpose:
//!     one record per relay server: telemetry from its last heartbeat and the
//!     set of boards it currently claims. liveness is not stored; it is read
//!     off the heartbeat age (`status`). the persisted `downCounter` only
//!     remembers how many escalating alerts were already sent.
//!
//! relationships:
//!     - used by: engine.rs (heartbeats, orphan detection, sweep)
//!     - uses: documents.rs (persistence)
//!
//! ==============================================================================

use crate::config::ServerConfig;
use crate::documents::{self, lenient};
use crate::error::Result;
use crate::timestamp::Stamp;
use crate::{DeviceId, ServerId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Up,
    Down,
    Retired,
}

/// Persisted server record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Server {
    pub mac: String,
    pub machine: String,
    pub version: String,
    pub channel: String,
    pub ip: String,
    pub is_local: bool,
    pub disk_size: u64,
    pub disk_free: u64,
    pub disk_low_flag: bool,
    pub last_update: Stamp,
    pub down_counter: u8,
    pub member_device_ids: BTreeSet<DeviceId>,
    pub cpu_idle_pct: f32,
    pub mem_avail_pct: f32,
    pub disk_throughput: f64,
    pub disk_util_pct: f32,
    #[serde(skip)]
    pub needs_persist: bool,
}

/// Telemetry carried by a heartbeat. Wrongly typed fields read as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerTelemetry {
    #[serde(deserialize_with = "lenient")]
    pub mac: String,
    #[serde(deserialize_with = "lenient")]
    pub machine: String,
    #[serde(deserialize_with = "lenient")]
    pub version: String,
    #[serde(deserialize_with = "lenient")]
    pub channel: String,
    #[serde(deserialize_with = "lenient")]
    pub ip: String,
    #[serde(deserialize_with = "lenient")]
    pub is_local: bool,
    #[serde(deserialize_with = "lenient")]
    pub disk_size: u64,
    #[serde(deserialize_with = "lenient")]
    pub disk_free: u64,
    #[serde(deserialize_with = "lenient")]
    pub cpu_idle_pct: f32,
    #[serde(deserialize_with = "lenient")]
    pub mem_avail_pct: f32,
    #[serde(deserialize_with = "lenient")]
    pub disk_throughput: f64,
    #[serde(deserialize_with = "lenient")]
    pub disk_util_pct: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatEffects {
    /// Free disk just dropped under the threshold.
    pub disk_low_raised: bool,
    /// The server had been alerted as down and is back.
    pub recovered: bool,
}

fn overwrite_if_present(field: &mut String, value: &str) {
    if !value.is_empty() {
        *field = value.to_string();
    }
}

impl Server {
    pub fn status(&self, now: Stamp, config: &ServerConfig) -> ServerStatus {
        if self.last_update.older_than(now, config.retire_after()) {
            ServerStatus::Retired
        } else if self.last_update.older_than(now, config.down_after()) {
            ServerStatus::Down
        } else {
            ServerStatus::Up
        }
    }

    pub fn apply_heartbeat(&mut self, telemetry: &ServerTelemetry, now: Stamp, config: &ServerConfig) -> HeartbeatEffects {
        let mut effects = HeartbeatEffects::default();

        if !telemetry.mac.is_empty() {
            self.mac = crate::registry::normalize_mac(&telemetry.mac);
        }
        overwrite_if_present(&mut self.machine, &telemetry.machine);
        overwrite_if_present(&mut self.version, &telemetry.version);
        overwrite_if_present(&mut self.channel, &telemetry.channel);
        overwrite_if_present(&mut self.ip, &telemetry.ip);
        self.is_local = telemetry.is_local;
        self.disk_size = telemetry.disk_size;
        self.disk_free = telemetry.disk_free;
        self.cpu_idle_pct = telemetry.cpu_idle_pct;
        self.mem_avail_pct = telemetry.mem_avail_pct;
        self.disk_throughput = telemetry.disk_throughput;
        self.disk_util_pct = telemetry.disk_util_pct;

        let low = self.disk_size > 0
            && u128::from(self.disk_free) * 100 < u128::from(self.disk_size) * u128::from(config.low_disk_pct);
        effects.disk_low_raised = low && !self.disk_low_flag;
        self.disk_low_flag = low;

        effects.recovered = self.down_counter > 0;
        self.down_counter = 0;
        self.last_update = now;
        self.needs_persist = true;
        effects
    }

    /// Bump the alert counter when the next threshold has passed.
    /// Returns the new counter value.
    pub fn escalate(&mut self, now: Stamp, config: &ServerConfig) -> Option<u8> {
        if self.last_update.is_never() {
            return None;
        }
        let threshold = match self.down_counter {
            0 => config.first_alert(),
            1 => config.second_alert(),
            _ => return None,
        };
        if !self.last_update.older_than(now, threshold) {
            return None;
        }
        self.down_counter += 1;
        self.needs_persist = true;
        Some(self.down_counter)
    }
}

// ==============================================================================
// store
// ==============================================================================

#[derive(Debug, Default)]
pub struct ServerStore {
    servers: BTreeMap<ServerId, Server>,
    structural: bool,
}

impl ServerStore {
    pub fn load(path: &Path) -> Self {
        Self { servers: documents::load_records(path, false), structural: false }
    }

    pub fn get(&self, id: ServerId) -> Option<&Server> {
        self.servers.get(&id)
    }

    /// Existing record, or one with default telemetry for a server never seen.
    pub fn get_or_create(&mut self, id: ServerId) -> &mut Server {
        if !self.servers.contains_key(&id) {
            tracing::info!("server {}: created", id);
            self.structural = true;
        }
        self.servers.entry(id).or_default()
    }

    /// Add `device` to the server's claimed set. Returns whether it was new.
    pub fn claim(&mut self, id: ServerId, device: DeviceId) -> bool {
        let server = self.get_or_create(id);
        let added = server.member_device_ids.insert(device);
        if added {
            server.needs_persist = true;
        }
        added
    }

    /// Remove `device` from the server's claimed set. Returns whether it was there.
    pub fn release(&mut self, id: ServerId, device: DeviceId) -> bool {
        let Some(server) = self.servers.get_mut(&id) else {
            return false;
        };
        let removed = server.member_device_ids.remove(&device);
        if removed {
            server.needs_persist = true;
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (ServerId, &Server)> {
        self.servers.iter().map(|(id, s)| (*id, s))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ServerId, &mut Server)> {
        self.servers.iter_mut().map(|(id, s)| (*id, s))
    }

    pub fn is_dirty(&self) -> bool {
        self.structural || self.servers.values().any(|s| s.needs_persist)
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        documents::save(path, &self.servers)?;
        for server in self.servers.values_mut() {
            server.needs_persist = false;
        }
        self.structural = false;
        Ok(())
    }
}
