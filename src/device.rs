//! ==============================================================================
//! device.rs - sensor boards and their liveness
//! ==============================================================================
//!
//! purpose:
//!     one record per known board, plus the liveness state machine that
//!     escalates a silent board from suspect to alerted.
//!
//! state machine:
//!
//!     ┌────────┐  not seen / orphaned   ┌─────────────┐  first_alert  ┌──────────┐  second_alert  ┌──────────┐
//!     │ Active │ ─────────────────────> │ SuspectDead │ ────────────> │ Alerted1 │ ─────────────> │ Alerted2 │
//!     └────────┘                        └─────────────┘               └──────────┘                └──────────┘
//!          ^                                                                                           │
//!          └───────────────────────────── any fresh report ────────────────────────────────────────────┘
//!
//!     `forgotten` is orthogonal: stored data purged, identity and project kept.
//!
//! invariants:
//!     - a device that is not Active has `server_id == 0`
//!     - every frequency change lands in the history log
//!
//! relationships:
//!     - used by: engine.rs, history.rs (needs_redraw)
//!     - uses: history.rs (frequency samples), documents.rs (persistence)
//!
//! ==============================================================================

use crate::config::DeviceConfig;
use crate::documents::{self, lenient};
use crate::error::Result;
use crate::history::HistoryLog;
use crate::timestamp::Stamp;
use crate::{DeviceId, ProjectId, ServerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

// ==============================================================================
// liveness
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum Liveness {
    #[default]
    Active,
    SuspectDead,
    Alerted1,
    Alerted2,
}

impl Liveness {
    pub fn code(self) -> u8 {
        match self {
            Liveness::Active => 0,
            Liveness::SuspectDead => 1,
            Liveness::Alerted1 => 2,
            Liveness::Alerted2 => 3,
        }
    }

    pub fn is_alive(self) -> bool {
        self == Liveness::Active
    }

    /// The next escalation step and the silence that must pass before it.
    fn next_step(self, config: &DeviceConfig) -> Option<(Liveness, Duration)> {
        match self {
            Liveness::Active => None,
            Liveness::SuspectDead => Some((Liveness::Alerted1, config.first_alert())),
            Liveness::Alerted1 => Some((Liveness::Alerted2, config.second_alert())),
            Liveness::Alerted2 => None,
        }
    }
}

// unknown codes come from newer or corrupted documents; treat them as fully alerted
impl From<u8> for Liveness {
    fn from(code: u8) -> Self {
        match code {
            0 => Liveness::Active,
            1 => Liveness::SuspectDead,
            2 => Liveness::Alerted1,
            _ => Liveness::Alerted2,
        }
    }
}

impl From<Liveness> for u8 {
    fn from(liveness: Liveness) -> Self {
        liveness.code()
    }
}

// ==============================================================================
// records
// ==============================================================================

/// Persisted device record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Device {
    pub mac: String,
    pub board_type: String,
    pub version: String,
    pub server_id: ServerId,
    #[serde(rename = "livenessCode")]
    pub liveness: Liveness,
    /// Board reports that it stopped sampling.
    pub is_stopped: bool,
    /// Stored data was purged by an operator.
    pub forgotten: bool,
    pub boot_time: Stamp,
    pub last_seen: Stamp,
    pub last_report: Stamp,
    pub project_id: ProjectId,
    pub sensor_descriptor: String,
    pub frequency: u32,
    pub rating: i32,
    pub rssi: i32,
    pub repo_file_count: u64,
    pub repo_byte_size: u64,
    pub last_drawn: Stamp,
    pub history_window_start: Stamp,
    pub note: String,
    #[serde(skip)]
    pub needs_persist: bool,
}

/// What a relay server says about one board. Every field is optional and
/// wrongly typed fields read as empty/zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceReport {
    #[serde(deserialize_with = "lenient")]
    pub id: Option<DeviceId>,
    #[serde(deserialize_with = "lenient")]
    pub mac: String,
    #[serde(deserialize_with = "lenient")]
    pub board_type: String,
    #[serde(deserialize_with = "lenient")]
    pub version: String,
    #[serde(deserialize_with = "lenient")]
    pub boot_time: Stamp,
    #[serde(deserialize_with = "lenient")]
    pub sensor_descriptor: String,
    #[serde(deserialize_with = "lenient")]
    pub frequency: u32,
    #[serde(deserialize_with = "lenient")]
    pub rating: i32,
    #[serde(deserialize_with = "lenient")]
    pub rssi: i32,
    #[serde(deserialize_with = "lenient")]
    pub repo_file_count: u64,
    #[serde(deserialize_with = "lenient")]
    pub repo_byte_size: u64,
    #[serde(deserialize_with = "lenient")]
    pub is_stopped: bool,
}

/// Side effects of merging a report that the caller must apply elsewhere.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeEffects {
    /// The device left this server for another one.
    pub left_server: Option<ServerId>,
    /// Server, boot time or frequency changed; the history graph must be redrawn.
    pub history_changed: bool,
    /// Something a device listing shows changed.
    pub display_changed: bool,
}

impl Device {
    pub fn new(mac: impl Into<String>) -> Self {
        Self { mac: mac.into(), needs_persist: true, ..Self::default() }
    }

    /// The record without the receipt times every report refreshes.
    fn listing(&self) -> Device {
        Device {
            last_seen: Stamp::default(),
            last_report: Stamp::default(),
            needs_persist: false,
            ..self.clone()
        }
    }

    fn record_frequency(&mut self, id: DeviceId, frequency: u32, now: Stamp, history: &HistoryLog) {
        self.frequency = frequency;
        if let Err(e) = history.append(id, now, frequency) {
            tracing::warn!("device {}: history append failed: {}", id, e);
        }
    }

    /// Merge a fresh report from `server_id` and bring the device back to Active.
    pub fn update(
        &mut self,
        id: DeviceId,
        server_id: ServerId,
        report: &DeviceReport,
        now: Stamp,
        history: &HistoryLog,
    ) -> MergeEffects {
        let mut effects = MergeEffects::default();
        let before = self.listing();

        if self.server_id != server_id {
            if self.server_id != 0 {
                effects.left_server = Some(self.server_id);
            }
            tracing::info!("device {}: server {} -> {}", id, self.server_id, server_id);
            self.server_id = server_id;
            self.record_frequency(id, 0, now, history);
            effects.history_changed = true;
        }
        if !report.boot_time.is_never() && report.boot_time != self.boot_time {
            if !self.boot_time.is_never() {
                tracing::info!("device {}: reboot detected", id);
            }
            self.boot_time = report.boot_time;
            self.record_frequency(id, 0, now, history);
            effects.history_changed = true;
        }
        if report.frequency != self.frequency {
            self.record_frequency(id, report.frequency, now, history);
            effects.history_changed = true;
        }

        if !report.board_type.is_empty() {
            self.board_type = report.board_type.clone();
        }
        if !report.version.is_empty() {
            self.version = report.version.clone();
        }
        if !report.sensor_descriptor.is_empty() {
            self.sensor_descriptor = report.sensor_descriptor.clone();
        }
        if self.mac.is_empty() && !report.mac.is_empty() {
            self.mac = crate::registry::normalize_mac(&report.mac);
        }
        self.rating = report.rating;
        self.rssi = report.rssi;
        self.repo_file_count = report.repo_file_count;
        self.repo_byte_size = report.repo_byte_size;
        self.is_stopped = report.is_stopped;

        if !self.liveness.is_alive() {
            tracing::info!("device {}: back from {:?}", id, self.liveness);
        }
        self.liveness = Liveness::Active;
        self.forgotten = false;
        self.last_seen = now;
        self.last_report = now;
        if effects.history_changed {
            self.request_redraw();
        }
        self.needs_persist = true;
        effects.display_changed = self.listing() != before;
        effects
    }

    /// Active -> SuspectDead: frequency drops to zero and the server link is cut.
    ///
    /// Returns the server the device was detached from, if any. Devices that
    /// are already dead are only detached.
    pub fn mark_suspect_dead(&mut self, id: DeviceId, now: Stamp, history: &HistoryLog) -> Option<ServerId> {
        if self.liveness.is_alive() {
            tracing::info!("device {}: suspected dead", id);
            self.liveness = Liveness::SuspectDead;
            self.record_frequency(id, 0, now, history);
            self.request_redraw();
            self.needs_persist = true;
        }
        self.detach()
    }

    /// Advance one escalation step if the device has been silent long enough.
    pub fn escalate(&mut self, now: Stamp, config: &DeviceConfig) -> Option<Liveness> {
        let (next, threshold) = self.liveness.next_step(config)?;
        if !self.last_seen.older_than(now, threshold) {
            return None;
        }
        self.liveness = next;
        self.needs_persist = true;
        Some(next)
    }

    /// Purge stored-data counters and leave the server, keeping identity.
    pub fn forget_data(&mut self) -> Option<ServerId> {
        self.repo_file_count = 0;
        self.repo_byte_size = 0;
        self.forgotten = true;
        self.needs_persist = true;
        self.detach()
    }

    /// The server reported the board offline.
    pub fn go_offline(&mut self, id: DeviceId, now: Stamp, history: &HistoryLog) -> Option<ServerId> {
        self.boot_time = Stamp::NEVER;
        if self.frequency != 0 {
            self.record_frequency(id, 0, now, history);
            self.request_redraw();
        }
        self.needs_persist = true;
        self.detach()
    }

    pub fn detach(&mut self) -> Option<ServerId> {
        if self.server_id == 0 {
            return None;
        }
        let old = self.server_id;
        self.server_id = 0;
        self.needs_persist = true;
        Some(old)
    }

    /// Force the next redraw check to fire.
    pub fn request_redraw(&mut self) {
        self.last_drawn = Stamp::NEVER;
        self.needs_persist = true;
    }

    /// Seen within the retirement window.
    pub fn is_current(&self, now: Stamp, retire_after: Duration) -> bool {
        !self.last_seen.older_than(now, retire_after)
    }
}

// ==============================================================================
// store
// ==============================================================================

#[derive(Debug, Default)]
pub struct DeviceStore {
    devices: BTreeMap<DeviceId, Device>,
    /// Records were added or removed.
    structural: bool,
}

impl DeviceStore {
    pub fn load(path: &Path) -> Self {
        let mut devices: BTreeMap<DeviceId, Device> = documents::load_records(path, false);
        for (id, device) in devices.iter_mut() {
            if !device.liveness.is_alive() && device.server_id != 0 {
                tracing::warn!("device {}: dead but attached to server {}, detaching", id, device.server_id);
                device.detach();
            }
        }
        Self { devices, structural: false }
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(&id)
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.devices.contains_key(&id)
    }

    /// Existing record, or a fresh one in project 0.
    pub fn get_or_create(&mut self, id: DeviceId, mac: &str) -> &mut Device {
        if !self.devices.contains_key(&id) {
            tracing::info!("device {}: created", id);
            self.structural = true;
        }
        self.devices.entry(id).or_insert_with(|| Device::new(mac))
    }

    pub fn remove(&mut self, id: DeviceId) -> Option<Device> {
        let removed = self.devices.remove(&id);
        if removed.is_some() {
            self.structural = true;
        }
        removed
    }

    pub fn ids(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.devices.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, &Device)> {
        self.devices.iter().map(|(id, d)| (*id, d))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (DeviceId, &mut Device)> {
        self.devices.iter_mut().map(|(id, d)| (*id, d))
    }

    /// Devices whose record names `server_id` as owner.
    pub fn attached_to(&self, server_id: ServerId) -> Vec<DeviceId> {
        self.iter().filter(|(_, d)| d.server_id == server_id).map(|(id, _)| id).collect()
    }

    /// Devices not yet retired, for listings.
    pub fn current(&self, now: Stamp, retire_after: Duration) -> Vec<DeviceId> {
        self.iter()
            .filter(|(_, d)| d.is_current(now, retire_after))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.structural || self.devices.values().any(|d| d.needs_persist)
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        documents::save(path, &self.devices)?;
        for device in self.devices.values_mut() {
            device.needs_persist = false;
        }
        self.structural = false;
        Ok(())
    }
}
