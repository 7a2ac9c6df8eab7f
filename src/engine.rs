//! ==============================================================================
//! engine.rs - reconciliation engine
//! ==============================================================================
//!
//! purpose:
//!     applies one unit of work (a heartbeat, a device report, a boot or
//!     offline event, a liveness sweep, an operator command) to the loaded
//!     stores, then runs the repair passes that restore the cross-document
//!     invariants:
//!
//!     1. merge every claimed device (allocating ids for unseen addresses)
//!     2. orphan devices the server stopped claiming
//!     3. server claim sets follow the device records
//!     4. each device sits in exactly one project (duplicates dropped,
//!        strays adopted by project 0)
//!     5. each project's server set is re-derived from its members
//!
//!     nothing here fails on bad input. unknown servers and projects are
//!     created on first reference, malformed fields read as zero.
//!
//! relationships:
//!     - used by: service.rs (one call per unit, then save)
//!     - uses: registry.rs, device.rs, server.rs, project.rs, history.rs, alert.rs
//!
//! ==============================================================================

use crate::alert::{Alert, Recipient};
use crate::config::AuthorityConfig;
use crate::device::{Device, DeviceReport, DeviceStore, Liveness};
use crate::documents::{lenient, lenient_list};
use crate::error::Result;
use crate::history::{self, HistoryLog};
use crate::project::{ProjectStore, UNASSIGNED};
use crate::registry::IdentityRegistry;
use crate::server::{ServerStatus, ServerStore, ServerTelemetry};
use crate::timestamp::Stamp;
use crate::{DeviceId, ProjectId, ServerId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

// ==============================================================================
// units of work
// ==============================================================================

/// A relay server's periodic report with every board it currently serves.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerHeartbeat {
    #[serde(deserialize_with = "lenient")]
    pub server_id: ServerId,
    #[serde(deserialize_with = "lenient")]
    pub telemetry: ServerTelemetry,
    #[serde(deserialize_with = "lenient_list")]
    pub devices: Vec<DeviceReport>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SingleDeviceReport {
    #[serde(deserialize_with = "lenient")]
    pub server_id: ServerId,
    #[serde(deserialize_with = "lenient")]
    pub device: DeviceReport,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceBoot {
    #[serde(deserialize_with = "lenient")]
    pub mac: String,
    #[serde(deserialize_with = "lenient")]
    pub board_type: String,
    #[serde(deserialize_with = "lenient")]
    pub version: String,
    #[serde(deserialize_with = "lenient")]
    pub server_id: ServerId,
    #[serde(deserialize_with = "lenient")]
    pub boot_time: Stamp,
}

/// Everything the authority can be asked to do.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Unit {
    Heartbeat(ServerHeartbeat),
    DeviceReport(SingleDeviceReport),
    DeviceBoot(DeviceBoot),
    #[serde(rename_all = "camelCase")]
    DeviceOffline {
        #[serde(default, deserialize_with = "lenient")]
        server_id: ServerId,
        #[serde(default, deserialize_with = "lenient")]
        device_id: DeviceId,
    },
    Sweep,
    #[serde(rename_all = "camelCase")]
    RemoveDevice { device_id: DeviceId },
    #[serde(rename_all = "camelCase")]
    ForgetData { device_id: DeviceId },
    #[serde(rename_all = "camelCase")]
    SetNote { device_id: DeviceId, note: String },
    #[serde(rename_all = "camelCase")]
    CreateProject { title: String, owner: String, #[serde(default)] email: String },
    #[serde(rename_all = "camelCase")]
    DeleteProject { project_id: ProjectId },
    #[serde(rename_all = "camelCase")]
    MoveDevice { device_id: DeviceId, project_id: ProjectId },
    #[serde(rename_all = "camelCase")]
    SetProjectEmail { project_id: ProjectId, email: String },
    #[serde(rename_all = "camelCase")]
    MarkDrawn { device_id: DeviceId },
}

/// Direct answer to a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    /// Whether the unit changed anything.
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
}

impl Reply {
    fn applied(applied: bool) -> Self {
        Self { applied, ..Self::default() }
    }
}

/// Signals accumulated since the last `take_outcome`, for the rendering
/// and mail collaborators.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub dirty_projects: BTreeSet<ProjectId>,
    pub stale_projects: BTreeSet<ProjectId>,
    pub stale_servers: BTreeSet<ServerId>,
    pub redraw_devices: BTreeSet<DeviceId>,
    pub alerts: Vec<Alert>,
}

// ==============================================================================
// document layout
// ==============================================================================

#[derive(Debug, Clone)]
pub struct DocumentPaths {
    pub registry: PathBuf,
    pub devices: PathBuf,
    pub servers: PathBuf,
    pub projects: PathBuf,
    pub history_dir: PathBuf,
    pub backup_dir: PathBuf,
}

impl DocumentPaths {
    pub fn new(data_dir: &Path, backup_dir: &Path) -> Self {
        Self {
            registry: data_dir.join("registry.json"),
            devices: data_dir.join("devices.json"),
            servers: data_dir.join("servers.json"),
            projects: data_dir.join("projects.json"),
            history_dir: data_dir.join("history"),
            backup_dir: backup_dir.to_path_buf(),
        }
    }
}

// ==============================================================================
// authority
// ==============================================================================

pub struct Authority {
    config: AuthorityConfig,
    paths: DocumentPaths,
    registry: IdentityRegistry,
    devices: DeviceStore,
    servers: ServerStore,
    projects: ProjectStore,
    history: HistoryLog,
    pending: Outcome,
}

impl Authority {
    /// Load every document and repair whatever a crash left inconsistent.
    pub fn open(config: AuthorityConfig) -> Self {
        let paths = DocumentPaths::new(&config.storage.data_dir, &config.storage.backup_dir());
        let mut authority = Self {
            registry: IdentityRegistry::load(&paths.registry),
            devices: DeviceStore::load(&paths.devices),
            servers: ServerStore::load(&paths.servers),
            projects: ProjectStore::load(&paths.projects),
            history: HistoryLog::new(&paths.history_dir),
            pending: Outcome::default(),
            paths,
            config,
        };
        authority.reconcile();
        tracing::info!(
            devices = authority.devices.len(),
            registered = authority.registry.len(),
            "documents loaded"
        );
        authority
    }

    /// Rewrite every document that changed.
    pub fn save(&mut self, now: Stamp) -> Result<()> {
        self.registry.save(&self.paths.registry, &self.paths.backup_dir, now)?;
        self.devices.save(&self.paths.devices)?;
        self.servers.save(&self.paths.servers)?;
        self.projects.save(&self.paths.projects)?;
        Ok(())
    }

    /// Apply one unit of work and run the repair passes.
    pub fn apply(&mut self, unit: Unit, now: Stamp) -> Reply {
        let reply = match unit {
            Unit::Heartbeat(heartbeat) => self.heartbeat(&heartbeat, now),
            Unit::DeviceReport(report) => {
                let device_id = self.device_report(&report, now);
                Reply { applied: device_id.is_some(), device_id, project_id: None }
            }
            Unit::DeviceBoot(boot) => {
                let device_id = self.device_boot(&boot, now);
                Reply { applied: device_id.is_some(), device_id, project_id: None }
            }
            Unit::DeviceOffline { server_id, device_id } => {
                Reply::applied(self.device_offline(server_id, device_id, now))
            }
            Unit::Sweep => {
                self.sweep(now);
                Reply::applied(true)
            }
            Unit::RemoveDevice { device_id } => Reply::applied(self.remove_device(device_id)),
            Unit::ForgetData { device_id } => Reply::applied(self.forget_data(device_id)),
            Unit::SetNote { device_id, note } => Reply::applied(self.set_note(device_id, &note)),
            Unit::CreateProject { title, owner, email } => {
                let project_id = self.create_project(&title, &owner, &email);
                Reply { applied: project_id.is_some(), device_id: None, project_id }
            }
            Unit::DeleteProject { project_id } => Reply::applied(self.delete_project(project_id)),
            Unit::MoveDevice { device_id, project_id } => {
                Reply::applied(self.move_device(device_id, project_id))
            }
            Unit::SetProjectEmail { project_id, email } => {
                Reply::applied(self.projects.set_email(project_id, &email))
            }
            Unit::MarkDrawn { device_id } => Reply::applied(self.mark_drawn(device_id, now)),
        };
        self.reconcile();
        reply
    }

    /// Drain signals and alerts accumulated so far.
    pub fn take_outcome(&mut self) -> Outcome {
        let signals = self.projects.take_signals();
        let mut outcome = std::mem::take(&mut self.pending);
        outcome.dirty_projects.extend(signals.dirty);
        outcome.stale_projects.extend(signals.stale);
        outcome
    }

    // --- accessors ---

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn devices(&self) -> &DeviceStore {
        &self.devices
    }

    pub fn servers(&self) -> &ServerStore {
        &self.servers
    }

    pub fn projects(&self) -> &ProjectStore {
        &self.projects
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn server_status(&self, id: ServerId, now: Stamp) -> Option<ServerStatus> {
        self.servers.get(id).map(|s| s.status(now, &self.config.server))
    }

    /// Devices seen within the retirement window.
    pub fn active_devices(&self, now: Stamp) -> Vec<DeviceId> {
        self.devices.current(now, self.config.device.retire_after())
    }

    /// Devices whose history graph is due.
    pub fn redraw_candidates(&self, now: Stamp) -> Vec<DeviceId> {
        let retire_after = self.config.device.retire_after();
        self.devices
            .iter()
            .filter(|(_, d)| history::needs_redraw(d, now, &self.config.history, retire_after))
            .map(|(id, _)| id)
            .collect()
    }

    // ==========================================================================
    // inbound reports
    // ==========================================================================

    /// Registry id for a reported board; the address wins over a stated id.
    fn resolve(&mut self, report: &DeviceReport) -> Option<DeviceId> {
        if !report.mac.trim().is_empty() {
            let known: BTreeSet<DeviceId> = self.devices.ids().collect();
            let id = self.registry.allocate_avoiding(&report.mac, &known);
            if let Some(stated) = report.id.filter(|s| *s != id) {
                tracing::warn!("report names device {} but address {} is device {}", stated, report.mac, id);
            }
            return Some(id);
        }
        match report.id {
            Some(id) if id > 0 => Some(id),
            _ => {
                tracing::warn!("device report without address or id ignored");
                None
            }
        }
    }

    fn merge(&mut self, server_id: ServerId, report: &DeviceReport, now: Stamp) -> Option<DeviceId> {
        let id = self.resolve(report)?;
        let mac = self.registry.mac_of(id).unwrap_or_default().to_string();
        let device = self.devices.get_or_create(id, &mac);
        let effects = device.update(id, server_id, report, now, &self.history);
        let project_id = device.project_id;

        if let Some(old) = effects.left_server {
            self.servers.release(old, id);
            self.pending.stale_servers.insert(old);
        }
        if effects.history_changed {
            self.pending.redraw_devices.insert(id);
        }
        if server_id != 0 {
            self.servers.claim(server_id, id);
        }
        if effects.display_changed {
            self.projects.mark_stale(project_id);
        }
        Some(id)
    }

    fn heartbeat(&mut self, heartbeat: &ServerHeartbeat, now: Stamp) -> Reply {
        let sid = heartbeat.server_id;
        if sid == 0 {
            tracing::warn!("heartbeat without server id ignored");
            return Reply::applied(false);
        }

        let server = self.servers.get_or_create(sid);
        let effects = server.apply_heartbeat(&heartbeat.telemetry, now, &self.config.server);
        let previous: BTreeSet<DeviceId> = server.member_device_ids.clone();
        if effects.recovered {
            tracing::info!("server {}: heartbeat resumed", sid);
        }
        if effects.disk_low_raised {
            let server = &*server;
            self.pending.alerts.push(Alert::new(
                Recipient::Operators,
                format!("Server {} low on disk", sid),
                format!(
                    "server {} ({}) has {} of {} bytes free",
                    sid, server.machine, server.disk_free, server.disk_size
                ),
            ));
        }
        self.pending.stale_servers.insert(sid);

        let mut claimed = BTreeSet::new();
        for report in &heartbeat.devices {
            if let Some(id) = self.merge(sid, report, now) {
                claimed.insert(id);
            }
        }

        let mut dropped: BTreeSet<DeviceId> = self.devices.attached_to(sid).into_iter().collect();
        dropped.extend(previous);
        for id in dropped.difference(&claimed) {
            self.orphan(*id, sid, now);
        }
        Reply::applied(true)
    }

    /// `server_id` no longer claims `id`.
    fn orphan(&mut self, id: DeviceId, server_id: ServerId, now: Stamp) {
        self.servers.release(server_id, id);
        let Some(device) = self.devices.get_mut(id) else {
            return;
        };
        if device.server_id != server_id {
            return;
        }
        tracing::info!("device {}: dropped by server {}", id, server_id);
        device.mark_suspect_dead(id, now, &self.history);
        let project_id = device.project_id;
        self.pending.redraw_devices.insert(id);
        self.projects.mark_stale(project_id);
    }

    fn device_report(&mut self, report: &SingleDeviceReport, now: Stamp) -> Option<DeviceId> {
        if report.server_id != 0 && self.servers.get(report.server_id).is_none() {
            tracing::info!("device report through unknown server {}", report.server_id);
        }
        let id = self.merge(report.server_id, &report.device, now)?;
        if report.server_id != 0 {
            self.pending.stale_servers.insert(report.server_id);
        }
        Some(id)
    }

    fn device_boot(&mut self, boot: &DeviceBoot, now: Stamp) -> Option<DeviceId> {
        if boot.mac.trim().is_empty() {
            tracing::warn!("boot event without address ignored");
            return None;
        }
        let id = self.registry.lookup(&boot.mac);
        let current = id.and_then(|id| self.devices.get(id)).cloned().unwrap_or_default();
        let report = DeviceReport {
            id,
            mac: boot.mac.clone(),
            board_type: boot.board_type.clone(),
            version: boot.version.clone(),
            boot_time: boot.boot_time,
            sensor_descriptor: current.sensor_descriptor,
            frequency: 0,
            rating: current.rating,
            rssi: current.rssi,
            repo_file_count: current.repo_file_count,
            repo_byte_size: current.repo_byte_size,
            is_stopped: false,
        };
        let id = self.merge(boot.server_id, &report, now)?;
        tracing::info!("device {}: booted on server {}", id, boot.server_id);
        Some(id)
    }

    fn device_offline(&mut self, server_id: ServerId, device_id: DeviceId, now: Stamp) -> bool {
        self.servers.release(server_id, device_id);
        let Some(device) = self.devices.get_mut(device_id) else {
            return false;
        };
        if device.server_id != server_id {
            tracing::debug!("device {}: offline notice from server {} it no longer uses", device_id, server_id);
            return false;
        }
        device.go_offline(device_id, now, &self.history);
        let project_id = device.project_id;
        tracing::info!("device {}: offline", device_id);
        self.pending.redraw_devices.insert(device_id);
        self.pending.stale_servers.insert(server_id);
        self.projects.mark_stale(project_id);
        true
    }

    // ==========================================================================
    // liveness sweep
    // ==========================================================================

    /// Escalate silent devices and servers by at most one step each.
    pub fn sweep(&mut self, now: Stamp) {
        let missing_after = self.config.device.missing_after();
        let mut escalated: Vec<(DeviceId, Liveness)> = Vec::new();
        let mut detached: Vec<(DeviceId, ServerId)> = Vec::new();

        for (id, device) in self.devices.iter_mut() {
            if device.liveness.is_alive() {
                if device.last_seen.older_than(now, missing_after) {
                    if let Some(old) = device.mark_suspect_dead(id, now, &self.history) {
                        detached.push((id, old));
                    }
                    self.pending.redraw_devices.insert(id);
                    self.projects.mark_stale(device.project_id);
                }
            } else if let Some(next) = device.escalate(now, &self.config.device) {
                escalated.push((id, next));
            }
        }

        for (id, server_id) in detached {
            self.servers.release(server_id, id);
            self.pending.stale_servers.insert(server_id);
        }
        for (id, next) in escalated {
            if let Some(device) = self.devices.get(id) {
                let alert = self.device_alert(id, device, next);
                self.projects.mark_stale(device.project_id);
                self.pending.alerts.push(alert);
            }
        }

        for (sid, server) in self.servers.iter_mut() {
            if let Some(counter) = server.escalate(now, &self.config.server) {
                tracing::warn!("server {}: down, alert {}", sid, counter);
                self.pending.stale_servers.insert(sid);
                self.pending.alerts.push(Alert::new(
                    Recipient::Operators,
                    format!("Server {} unreachable", sid),
                    format!(
                        "server {} ({}, {}) has not reported since {} (alert {} of 2)",
                        sid, server.machine, server.ip, server.last_update, counter
                    ),
                ));
            }
        }
    }

    fn device_alert(&self, id: DeviceId, device: &Device, state: Liveness) -> Alert {
        let recipient = match self.projects.get(device.project_id) {
            Some(p) if !p.email.is_empty() => Recipient::Project { project_id: device.project_id, email: p.email.clone() },
            _ => Recipient::Operators,
        };
        let level = if state == Liveness::Alerted1 { 1 } else { 2 };
        Alert::new(
            recipient,
            format!("Device {} unreachable", id),
            format!(
                "device {} ({}, {} {}) has not reported since {} (alert {} of 2)",
                id, device.mac, device.board_type, device.version, device.last_seen, level
            ),
        )
    }

    // ==========================================================================
    // operator commands
    // ==========================================================================

    /// Delete a device with its history and identity.
    pub fn remove_device(&mut self, id: DeviceId) -> bool {
        let Some(device) = self.devices.remove(id) else {
            return false;
        };
        if let Err(e) = self.history.remove(id) {
            tracing::warn!("device {}: history removal failed: {}", id, e);
        }
        self.registry.release(id);
        self.projects.remove_member(id);
        if device.server_id != 0 {
            self.servers.release(device.server_id, id);
            self.pending.stale_servers.insert(device.server_id);
        }
        tracing::info!("device {}: removed", id);
        true
    }

    pub fn forget_data(&mut self, id: DeviceId) -> bool {
        let Some(device) = self.devices.get_mut(id) else {
            return false;
        };
        let project_id = device.project_id;
        if let Some(server_id) = device.forget_data() {
            self.servers.release(server_id, id);
            self.pending.stale_servers.insert(server_id);
        }
        tracing::info!("device {}: stored data forgotten", id);
        self.projects.mark_stale(project_id);
        true
    }

    pub fn set_note(&mut self, id: DeviceId, note: &str) -> bool {
        let Some(device) = self.devices.get_mut(id) else {
            return false;
        };
        device.note = note.trim().to_string();
        device.needs_persist = true;
        let project_id = device.project_id;
        self.projects.mark_stale(project_id);
        true
    }

    pub fn create_project(&mut self, title: &str, owner: &str, email: &str) -> Option<ProjectId> {
        self.projects.create(title, owner, email)
    }

    pub fn delete_project(&mut self, id: ProjectId) -> bool {
        self.projects.delete(id)
    }

    /// Move a known device; an unknown target project is created.
    pub fn move_device(&mut self, device_id: DeviceId, project_id: ProjectId) -> bool {
        let Some(device) = self.devices.get_mut(device_id) else {
            return false;
        };
        let from = device.project_id;
        device.project_id = project_id;
        device.needs_persist = true;
        self.projects.remove_member(device_id);
        self.projects.add_member(project_id, device_id);
        self.projects.mark_stale(from);
        self.projects.mark_stale(project_id);
        tracing::info!("device {}: project {} -> {}", device_id, from, project_id);
        true
    }

    /// Trim the device's history to the display window and record the draw.
    pub fn mark_drawn(&mut self, id: DeviceId, now: Stamp) -> bool {
        let Some(device) = self.devices.get_mut(id) else {
            return false;
        };
        let max_span = self.config.history.max_span();
        let seed = device.liveness.is_alive().then_some((device.boot_time, device.frequency));
        if let Err(e) = self.history.cut(id, now, max_span, seed) {
            tracing::warn!("device {}: history cut failed: {}", id, e);
        }
        device.history_window_start = now.minus(max_span);
        device.last_drawn = now;
        device.needs_persist = true;
        true
    }

    // ==========================================================================
    // repair passes
    // ==========================================================================

    /// Restore the cross-document invariants. Safe to run any number of times.
    pub fn reconcile(&mut self) {
        // the registry lost entries the device records still carry
        for (id, device) in self.devices.iter() {
            if !device.mac.is_empty() && self.registry.lookup(&device.mac).is_none() {
                self.registry.restore(&device.mac, id);
            }
        }

        // server claim sets follow the device records
        let devices = &self.devices;
        for (sid, server) in self.servers.iter_mut() {
            let before = server.member_device_ids.len();
            server
                .member_device_ids
                .retain(|d| devices.get(*d).is_some_and(|dev| dev.server_id == sid));
            if server.member_device_ids.len() != before {
                server.needs_persist = true;
                self.pending.stale_servers.insert(sid);
            }
        }
        let attached: Vec<(DeviceId, ServerId)> = self
            .devices
            .iter()
            .filter(|(_, d)| d.server_id != 0)
            .map(|(id, d)| (id, d.server_id))
            .collect();
        for (id, sid) in attached {
            if self.servers.claim(sid, id) {
                tracing::warn!("server {}: restored missing claim on device {}", sid, id);
                self.pending.stale_servers.insert(sid);
            }
        }

        // exactly one project per device
        let known: BTreeSet<DeviceId> = self.devices.ids().collect();
        self.projects.prune_members(&known);
        self.projects.dedupe_members();
        let adopted = self.projects.adopt_unassigned(&known);
        if !adopted.is_empty() {
            tracing::info!("devices {:?} adopted by project {}", adopted, UNASSIGNED);
        }

        let membership: BTreeMap<DeviceId, ProjectId> = self
            .projects
            .iter()
            .flat_map(|(pid, p)| p.member_device_ids.iter().map(move |d| (*d, pid)))
            .collect();
        for (id, device) in self.devices.iter_mut() {
            let project_id = membership.get(&id).copied().unwrap_or(UNASSIGNED);
            if device.project_id != project_id {
                device.project_id = project_id;
                device.needs_persist = true;
            }
        }

        let devices = &self.devices;
        self.projects
            .derive_servers(|d| devices.get(d).map(|dev| dev.server_id).unwrap_or(0));
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::Sample;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn t(secs: i64) -> Stamp {
        Stamp::from_secs(1_700_000_000 + secs)
    }

    fn authority() -> (TempDir, Authority) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AuthorityConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        let authority = Authority::open(config);
        (dir, authority)
    }

    fn claim(mac: &str, frequency: u32) -> DeviceReport {
        DeviceReport { mac: mac.into(), frequency, ..Default::default() }
    }

    fn heartbeat(server_id: ServerId, devices: Vec<DeviceReport>) -> Unit {
        Unit::Heartbeat(ServerHeartbeat { server_id, telemetry: ServerTelemetry::default(), devices })
    }

    #[test]
    fn first_heartbeat_then_empty_heartbeat_orphans_device() {
        let (_dir, mut authority) = authority();
        authority.take_outcome();

        authority.apply(heartbeat(1, vec![claim("AA:BB:CC:DD:EE:FF", 0)]), t(0));
        assert_eq!(authority.registry().lookup("AA:BB:CC:DD:EE:FF"), Some(1));
        let device = authority.devices().get(1).unwrap();
        assert_eq!(device.server_id, 1);
        assert_eq!(device.project_id, UNASSIGNED);
        assert_eq!(
            authority.projects().get(UNASSIGNED).unwrap().member_device_ids,
            BTreeSet::from([1])
        );
        let outcome = authority.take_outcome();
        assert!(outcome.dirty_projects.contains(&UNASSIGNED));

        authority.apply(heartbeat(1, vec![]), t(60));
        let device = authority.devices().get(1).unwrap();
        assert_eq!(device.server_id, 0);
        assert_ne!(device.liveness, Liveness::Active);
        assert!(authority.servers().get(1).unwrap().member_device_ids.is_empty());
    }

    #[test]
    fn moving_between_servers_updates_both_claims() {
        let (_dir, mut authority) = authority();
        authority.apply(heartbeat(1, vec![claim("AA:00:00:00:00:01", 10)]), t(0));
        authority.apply(heartbeat(2, vec![claim("AA:00:00:00:00:01", 10)]), t(10));

        assert!(authority.servers().get(1).unwrap().member_device_ids.is_empty());
        assert_eq!(authority.servers().get(2).unwrap().member_device_ids, BTreeSet::from([1]));
        assert_eq!(authority.devices().get(1).unwrap().server_id, 2);

        // the old server's next heartbeat must not kill the moved device
        authority.apply(heartbeat(1, vec![]), t(20));
        assert_eq!(authority.devices().get(1).unwrap().liveness, Liveness::Active);
        assert_eq!(authority.projects().get(UNASSIGNED).unwrap().server_ids, BTreeSet::from([2]));
    }

    #[test]
    fn sweep_walks_liveness_ladder_and_alerts_project() {
        let (_dir, mut authority) = authority();
        let project = authority.create_project("Field", "ana", "ana@example.org").unwrap();
        authority.apply(heartbeat(1, vec![claim("AA:00:00:00:00:01", 10)]), t(0));
        authority.apply(Unit::MoveDevice { device_id: 1, project_id: project }, t(0));
        authority.take_outcome();

        let cfg = authority.config().device.clone();
        let missing = cfg.missing_after_secs as i64;
        let first = cfg.first_alert_secs as i64;
        let second = cfg.second_alert_secs as i64;

        authority.apply(Unit::Sweep, t(missing - 1));
        assert_eq!(authority.devices().get(1).unwrap().liveness, Liveness::Active);

        authority.apply(Unit::Sweep, t(missing + 1));
        let device = authority.devices().get(1).unwrap();
        assert_eq!(device.liveness, Liveness::SuspectDead);
        assert_eq!(device.server_id, 0);
        assert_eq!(authority.history().read(1).last(), Some(&Sample::new(t(missing + 1), 0)));
        assert!(authority.take_outcome().alerts.is_empty());

        // the relay keeps heartbeating without the board
        authority.apply(heartbeat(1, vec![]), t(first + 1));
        authority.apply(Unit::Sweep, t(first + 1));
        assert_eq!(authority.devices().get(1).unwrap().liveness, Liveness::Alerted1);
        let alerts = authority.take_outcome().alerts;
        assert_eq!(alerts.len(), 1);
        assert_eq!(
            alerts[0].recipient,
            Recipient::Project { project_id: project, email: "ana@example.org".into() }
        );

        authority.apply(heartbeat(1, vec![]), t(second + 1));
        authority.apply(Unit::Sweep, t(second + 1));
        assert_eq!(authority.devices().get(1).unwrap().liveness, Liveness::Alerted2);
        assert_eq!(authority.take_outcome().alerts.len(), 1);

        authority.apply(heartbeat(1, vec![claim("AA:00:00:00:00:01", 10)]), t(second + 2));
        let device = authority.devices().get(1).unwrap();
        assert_eq!(device.liveness, Liveness::Active);
        assert_eq!(device.server_id, 1);
        assert_eq!(device.project_id, project);
    }

    #[test]
    fn silent_server_alerts_operators_twice() {
        let (_dir, mut authority) = authority();
        authority.apply(heartbeat(3, vec![]), t(0));
        authority.take_outcome();
        let cfg = authority.config().server.clone();

        authority.apply(Unit::Sweep, t(cfg.first_alert_secs as i64 + 1));
        authority.apply(Unit::Sweep, t(cfg.first_alert_secs as i64 + 2));
        authority.apply(Unit::Sweep, t(cfg.second_alert_secs as i64 + 1));
        let alerts = authority.take_outcome().alerts;
        assert_eq!(alerts.len(), 2);
        assert!(alerts.iter().all(|a| a.recipient == Recipient::Operators));
        assert_eq!(authority.server_status(3, t(cfg.second_alert_secs as i64 + 1)), Some(ServerStatus::Down));
    }

    #[test]
    fn low_disk_heartbeat_alerts_once() {
        let (_dir, mut authority) = authority();
        let telemetry = ServerTelemetry { disk_size: 100, disk_free: 1, ..Default::default() };
        for n in 0..3 {
            authority.apply(
                Unit::Heartbeat(ServerHeartbeat { server_id: 4, telemetry: telemetry.clone(), devices: vec![] }),
                t(n),
            );
        }
        assert_eq!(authority.take_outcome().alerts.len(), 1);
    }

    #[test]
    fn boot_allocates_and_offline_detaches() {
        let (_dir, mut authority) = authority();
        let boot = DeviceBoot {
            mac: "aa:bb:cc:00:00:01".into(),
            board_type: "rev4".into(),
            version: "2.1".into(),
            server_id: 5,
            boot_time: t(-30),
        };
        let reply = authority.apply(Unit::DeviceBoot(boot.clone()), t(0));
        assert_eq!(reply.device_id, Some(1));
        assert_eq!(authority.apply(Unit::DeviceBoot(boot), t(5)).device_id, Some(1));
        assert_eq!(authority.devices().get(1).unwrap().board_type, "rev4");
        assert!(authority.servers().get(5).unwrap().member_device_ids.contains(&1));

        assert!(!authority.apply(Unit::DeviceOffline { server_id: 9, device_id: 1 }, t(10)).applied);
        assert!(authority.apply(Unit::DeviceOffline { server_id: 5, device_id: 1 }, t(10)).applied);
        let device = authority.devices().get(1).unwrap();
        assert_eq!(device.server_id, 0);
        assert!(device.boot_time.is_never());
        assert!(authority.servers().get(5).unwrap().member_device_ids.is_empty());
    }

    #[test]
    fn single_report_through_unknown_server_creates_it() {
        let (_dir, mut authority) = authority();
        let reply = authority.apply(
            Unit::DeviceReport(SingleDeviceReport { server_id: 12, device: claim("AA:00:00:00:00:07", 3) }),
            t(0),
        );
        assert_eq!(reply.device_id, Some(1));
        assert!(authority.servers().get(12).unwrap().member_device_ids.contains(&1));
    }

    #[test]
    fn removed_id_is_reused() {
        let (_dir, mut authority) = authority();
        let macs = ["00:00:00:00:00:01", "00:00:00:00:00:02", "00:00:00:00:00:03", "00:00:00:00:00:04"];
        authority.apply(heartbeat(1, macs.iter().map(|m| claim(m, 1)).collect()), t(0));
        assert!(authority.apply(Unit::RemoveDevice { device_id: 3 }, t(1)).applied);
        assert!(!authority.history().exists(3));
        assert!(!authority.projects().get(UNASSIGNED).unwrap().member_device_ids.contains(&3));

        authority.apply(heartbeat(2, vec![claim("00:00:00:00:00:99", 1)]), t(2));
        assert_eq!(authority.registry().lookup("00:00:00:00:00:99"), Some(3));
    }

    #[test]
    fn id_only_device_is_not_reallocated() {
        let (_dir, mut authority) = authority();
        let report = DeviceReport { id: Some(1), ..Default::default() };
        authority.apply(Unit::DeviceReport(SingleDeviceReport { server_id: 1, device: report }), t(0));
        authority.apply(heartbeat(1, vec![DeviceReport { id: Some(1), ..Default::default() }, claim("AA:00:00:00:00:01", 0)]), t(1));
        assert_eq!(authority.registry().lookup("AA:00:00:00:00:01"), Some(2));
    }

    #[test]
    fn forget_keeps_membership() {
        let (_dir, mut authority) = authority();
        authority.apply(heartbeat(1, vec![claim("AA:00:00:00:00:01", 5)]), t(0));
        assert!(authority.apply(Unit::ForgetData { device_id: 1 }, t(1)).applied);
        let device = authority.devices().get(1).unwrap();
        assert!(device.forgotten);
        assert_eq!(device.server_id, 0);
        assert_eq!(authority.projects().project_of(1), Some(UNASSIGNED));
        assert!(authority.servers().get(1).unwrap().member_device_ids.is_empty());
    }

    #[test]
    fn project_commands() {
        let (_dir, mut authority) = authority();
        assert!(!authority.apply(Unit::CreateProject { title: "".into(), owner: "x".into(), email: "".into() }, t(0)).applied);
        let reply = authority.apply(Unit::CreateProject { title: "Roof".into(), owner: "bo".into(), email: "".into() }, t(0));
        let pid = reply.project_id.unwrap();

        authority.apply(heartbeat(1, vec![claim("AA:00:00:00:00:01", 5)]), t(0));
        assert!(authority.apply(Unit::MoveDevice { device_id: 1, project_id: pid }, t(1)).applied);
        assert!(!authority.apply(Unit::DeleteProject { project_id: pid }, t(1)).applied);
        assert_eq!(authority.projects().get(pid).unwrap().server_ids, BTreeSet::from([1]));

        // unknown target project is created on the fly
        assert!(authority.apply(Unit::MoveDevice { device_id: 1, project_id: 40 }, t(2)).applied);
        assert!(authority.projects().contains(40));
        assert!(authority.apply(Unit::DeleteProject { project_id: pid }, t(2)).applied);
        assert!(!authority.apply(Unit::MoveDevice { device_id: 99, project_id: 40 }, t(2)).applied);
    }

    #[test]
    fn redraw_and_mark_drawn() {
        let (_dir, mut authority) = authority();
        authority.apply(heartbeat(1, vec![claim("AA:00:00:00:00:01", 5)]), t(0));
        assert_eq!(authority.redraw_candidates(t(1)), vec![1]);

        assert!(authority.apply(Unit::MarkDrawn { device_id: 1 }, t(1)).applied);
        assert!(authority.redraw_candidates(t(2)).is_empty());
        let redraw = authority.config().history.redraw_secs as i64;
        assert_eq!(authority.redraw_candidates(t(2 + redraw)), vec![1]);

        let span = authority.config().history.max_span_secs as i64;
        let device = authority.devices().get(1).unwrap();
        assert_eq!(device.history_window_start, t(1 - span));

        let retire = authority.config().device.retire_after_secs as i64;
        assert_eq!(authority.active_devices(t(retire)), vec![1]);
        assert!(authority.active_devices(t(retire + 1)).is_empty());
        // live devices keep their redraw cadence even past retirement
        assert_eq!(authority.redraw_candidates(t(retire + 1)), vec![1]);
    }

    #[test]
    fn state_survives_reopen() {
        let (dir, mut authority) = authority();
        authority.apply(heartbeat(1, vec![claim("AA:00:00:00:00:01", 5)]), t(0));
        authority.apply(Unit::SetNote { device_id: 1, note: "north mast".into() }, t(0));
        authority.save(t(0)).unwrap();

        let mut config = AuthorityConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        let reopened = Authority::open(config);
        assert_eq!(reopened.devices().get(1).unwrap().note, "north mast");
        assert_eq!(reopened.registry().lookup("AA:00:00:00:00:01"), Some(1));
        assert!(reopened.servers().get(1).unwrap().member_device_ids.contains(&1));
    }

    #[test]
    fn units_parse_from_json() {
        let unit: Unit = serde_json::from_str(
            r#"{"type": "heartbeat", "serverId": 2, "telemetry": {"diskSize": "lots"},
                "devices": [{"mac": "aa:bb:cc:dd:ee:ff", "frequency": 12}]}"#,
        )
        .unwrap();
        match unit {
            Unit::Heartbeat(hb) => {
                assert_eq!(hb.server_id, 2);
                assert_eq!(hb.telemetry.disk_size, 0);
                assert_eq!(hb.devices[0].frequency, 12);
            }
            other => panic!("unexpected unit {:?}", other),
        }
        let unit: Unit = serde_json::from_str(r#"{"type": "deviceOffline", "serverId": 2, "deviceId": 7}"#).unwrap();
        assert!(matches!(unit, Unit::DeviceOffline { server_id: 2, device_id: 7 }));
        assert!(matches!(serde_json::from_str::<Unit>(r#"{"type": "sweep"}"#).unwrap(), Unit::Sweep));
    }

    #[test]
    fn malformed_heartbeat_still_counts_as_contact() {
        let unit: Unit = serde_json::from_str(
            r#"{"type": "heartbeat", "serverId": 3, "telemetry": null, "devices": null}"#,
        )
        .unwrap();
        match &unit {
            Unit::Heartbeat(hb) => {
                assert_eq!(hb.telemetry, ServerTelemetry::default());
                assert!(hb.devices.is_empty());
            }
            other => panic!("unexpected unit {:?}", other),
        }
        let (_dir, mut authority) = authority();
        assert!(authority.apply(unit, t(5)).applied);
        assert_eq!(authority.servers().get(3).unwrap().last_update, t(5));

        let unit: Unit = serde_json::from_str(
            r#"{"type": "heartbeat", "serverId": 3, "telemetry": "junk",
                "devices": [{"mac": "AA:BB:CC:DD:EE:01", "frequency": 4}, "junk", 7]}"#,
        )
        .unwrap();
        authority.apply(unit, t(10));
        assert_eq!(authority.devices().ids().collect::<Vec<_>>(), vec![1]);
        assert_eq!(authority.servers().get(3).unwrap().member_device_ids, BTreeSet::from([1]));
        assert_eq!(authority.servers().get(3).unwrap().last_update, t(10));
    }

    #[test]
    fn bad_ids_in_small_units_read_as_zero() {
        let unit: Unit = serde_json::from_str(r#"{"type": "deviceOffline", "serverId": 2, "deviceId": "7x"}"#).unwrap();
        assert!(matches!(unit, Unit::DeviceOffline { server_id: 2, device_id: 0 }));
        let unit: Unit = serde_json::from_str(r#"{"type": "deviceOffline"}"#).unwrap();
        assert!(matches!(unit, Unit::DeviceOffline { server_id: 0, device_id: 0 }));

        let unit: Unit = serde_json::from_str(r#"{"type": "deviceReport", "serverId": 2, "device": [1, 2]}"#).unwrap();
        let (_dir, mut authority) = authority();
        assert!(!authority.apply(unit, t(0)).applied);
        assert!(authority.devices().is_empty());
    }

    #[test]
    fn unchanged_reports_leave_projects_fresh() {
        let (_dir, mut authority) = authority();
        let report = DeviceReport { rssi: -60, ..claim("AA:00:00:00:00:01", 10) };
        authority.apply(heartbeat(1, vec![report.clone()]), t(0));
        authority.take_outcome();

        authority.apply(heartbeat(1, vec![report.clone()]), t(60));
        assert!(authority.take_outcome().stale_projects.is_empty());
        assert_eq!(authority.devices().get(1).unwrap().last_seen, t(60));

        let weaker = DeviceReport { rssi: -85, ..report };
        authority.apply(heartbeat(1, vec![weaker]), t(120));
        assert!(authority.take_outcome().stale_projects.contains(&UNASSIGNED));
    }

    fn write_documents(dir: &Path, documents: &[(&str, &str)]) -> Authority {
        for (name, body) in documents {
            std::fs::write(dir.join(name), body).unwrap();
        }
        let mut config = AuthorityConfig::default();
        config.storage.data_dir = dir.to_path_buf();
        Authority::open(config)
    }

    #[test]
    fn corrupt_registry_is_rebuilt_from_devices() {
        let dir = tempfile::tempdir().unwrap();
        let mut authority = write_documents(
            dir.path(),
            &[
                ("registry.json", "{ not json"),
                ("devices.json", r#"{"1": {"mac": "AA:BB:CC:DD:EE:FF", "serverId": 1}}"#),
                ("servers.json", r#"{"1": {"memberDeviceIds": [1]}}"#),
            ],
        );
        assert_eq!(authority.registry().lookup("AA:BB:CC:DD:EE:FF"), Some(1));
        assert!(authority.registry().is_dirty());

        authority.apply(heartbeat(1, vec![claim("aa:bb:cc:dd:ee:ff", 3)]), t(0));
        assert_eq!(authority.devices().ids().collect::<Vec<_>>(), vec![1]);
        let device = authority.devices().get(1).unwrap();
        assert_eq!(device.liveness, Liveness::Active);
        assert_eq!(device.server_id, 1);
        assert_eq!(authority.servers().get(1).unwrap().member_device_ids, BTreeSet::from([1]));

        authority.save(t(0)).unwrap();
        let saved: BTreeMap<String, DeviceId> =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("registry.json")).unwrap()).unwrap();
        assert_eq!(saved, BTreeMap::from([("AA:BB:CC:DD:EE:FF".to_string(), 1)]));
    }

    #[test]
    fn open_repairs_inconsistent_documents() {
        let dir = tempfile::tempdir().unwrap();
        let mut authority = write_documents(
            dir.path(),
            &[
                ("registry.json", r#"{"AA:00:00:00:00:02": 2}"#),
                (
                    "devices.json",
                    r#"{"1": {"mac": "AA:00:00:00:00:01", "serverId": 2},
                        "2": {"mac": "AA:00:00:00:00:02", "serverId": 1, "livenessCode": 1}}"#,
                ),
                ("servers.json", r#"{"1": {"memberDeviceIds": [1, 2, 9]}, "2": {"memberDeviceIds": []}}"#),
                ("projects.json", r#"{"4": {"title": "t", "owner": "o", "memberDeviceIds": [1, 9]}}"#),
            ],
        );

        // device missing from the registry
        assert_eq!(authority.registry().lookup("AA:00:00:00:00:01"), Some(1));
        assert_eq!(authority.registry().lookup("AA:00:00:00:00:02"), Some(2));
        // claims follow the device records
        assert!(authority.servers().get(1).unwrap().member_device_ids.is_empty());
        assert_eq!(authority.servers().get(2).unwrap().member_device_ids, BTreeSet::from([1]));
        assert_eq!(authority.devices().get(2).unwrap().server_id, 0);
        assert_eq!(authority.devices().get(1).unwrap().project_id, 4);

        let field = authority.projects().get(4).unwrap();
        assert_eq!(field.member_device_ids, BTreeSet::from([1]));
        assert_eq!(field.server_ids, BTreeSet::from([2]));
        assert_eq!(authority.projects().get(UNASSIGNED).unwrap().member_device_ids, BTreeSet::from([2]));

        let outcome = authority.take_outcome();
        assert!(outcome.stale_servers.contains(&1));
        assert!(outcome.stale_servers.contains(&2));

        authority.apply(heartbeat(2, vec![claim("AA:00:00:00:00:01", 8)]), t(0));
        assert_eq!(authority.devices().len(), 2);
        assert_eq!(authority.devices().get(1).unwrap().server_id, 2);
    }

    fn seeded(devices: u32, memberships: &[(ProjectId, DeviceId)]) -> (TempDir, Authority) {
        let dir = tempfile::tempdir().unwrap();
        let mut projects: BTreeMap<ProjectId, serde_json::Value> = BTreeMap::new();
        for (pid, did) in memberships {
            let entry = projects
                .entry(*pid)
                .or_insert_with(|| serde_json::json!({"title": "p", "owner": "o", "memberDeviceIds": []}));
            entry["memberDeviceIds"].as_array_mut().unwrap().push((*did).into());
        }
        let device_doc: BTreeMap<u32, serde_json::Value> =
            (1..=devices).map(|id| (id, serde_json::json!({"mac": format!("M{}", id)}))).collect();
        std::fs::write(dir.path().join("projects.json"), serde_json::to_string(&projects).unwrap()).unwrap();
        std::fs::write(dir.path().join("devices.json"), serde_json::to_string(&device_doc).unwrap()).unwrap();

        let mut config = AuthorityConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        let authority = Authority::open(config);
        (dir, authority)
    }

    proptest! {
        #[test]
        fn every_device_in_exactly_one_project(
            devices in 1u32..12,
            memberships in prop::collection::vec((0u32..5, 1u32..16), 0..40),
        ) {
            let (_dir, authority) = seeded(devices, &memberships);
            for id in authority.devices().ids() {
                let homes = authority
                    .projects()
                    .iter()
                    .filter(|(_, p)| p.member_device_ids.contains(&id))
                    .count();
                prop_assert_eq!(homes, 1);
                let project = authority.projects().project_of(id);
                prop_assert_eq!(project, Some(authority.devices().get(id).unwrap().project_id));
            }
            for (_, project) in authority.projects().iter() {
                for member in &project.member_device_ids {
                    prop_assert!(authority.devices().contains(*member));
                }
            }
        }
    }
}
