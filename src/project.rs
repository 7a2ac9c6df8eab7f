//! ==============================================================================
//! project.rs - project membership
//! ==============================================================================
//!
//! purpose:
//!     groups devices under an owner with a notification address. project 0
//!     always exists and collects every device nobody claimed.
//!
//!     two change signals are kept per project for the rendering side:
//!     - dirty: the member set changed
//!     - stale: something displayable about a member changed
//!
//! invariant (restored by the repair passes, not by construction):
//!     every known device id is a member of exactly one project.
//!
//! relationships:
//!     - used by: engine.rs (repair passes, operator commands, alert routing)
//!     - uses: documents.rs (persistence)
//!
//! ==============================================================================

use crate::documents;
use crate::error::Result;
use crate::{DeviceId, ProjectId, ServerId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

pub const UNASSIGNED: ProjectId = 0;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Project {
    pub title: String,
    pub owner: String,
    pub email: String,
    pub member_device_ids: BTreeSet<DeviceId>,
    /// Owning servers of the members, derived on every reconcile.
    #[serde(skip)]
    pub server_ids: BTreeSet<ServerId>,
    #[serde(skip)]
    pub dirty: bool,
    #[serde(skip)]
    pub stale: bool,
    #[serde(skip)]
    needs_persist: bool,
}

impl Project {
    fn unassigned() -> Self {
        Self { title: "Unassigned".into(), needs_persist: true, ..Self::default() }
    }

    fn touch_membership(&mut self) {
        self.dirty = true;
        self.needs_persist = true;
    }
}

/// Signals drained by the rendering side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectSignals {
    pub dirty: BTreeSet<ProjectId>,
    pub stale: BTreeSet<ProjectId>,
}

#[derive(Debug)]
pub struct ProjectStore {
    projects: BTreeMap<ProjectId, Project>,
    structural: bool,
}

impl Default for ProjectStore {
    fn default() -> Self {
        let mut projects = BTreeMap::new();
        projects.insert(UNASSIGNED, Project::unassigned());
        Self { projects, structural: true }
    }
}

impl ProjectStore {
    pub fn load(path: &Path) -> Self {
        let mut projects: BTreeMap<ProjectId, Project> = documents::load_records(path, true);
        let mut structural = false;
        if !projects.contains_key(&UNASSIGNED) {
            projects.insert(UNASSIGNED, Project::unassigned());
            structural = true;
        }
        Self { projects, structural }
    }

    pub fn get(&self, id: ProjectId) -> Option<&Project> {
        self.projects.get(&id)
    }

    pub fn contains(&self, id: ProjectId) -> bool {
        self.projects.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProjectId, &Project)> {
        self.projects.iter().map(|(id, p)| (*id, p))
    }

    fn next_free_id(&self) -> ProjectId {
        let mut id = 1;
        while self.projects.contains_key(&id) {
            id += 1;
        }
        id
    }

    /// New project with a title and owner; both are required.
    pub fn create(&mut self, title: &str, owner: &str, email: &str) -> Option<ProjectId> {
        let (title, owner) = (title.trim(), owner.trim());
        if title.is_empty() || owner.is_empty() {
            tracing::debug!("project creation without title or owner ignored");
            return None;
        }
        let id = self.next_free_id();
        let project = Project {
            title: title.to_string(),
            owner: owner.to_string(),
            email: email.trim().to_string(),
            dirty: true,
            needs_persist: true,
            ..Project::default()
        };
        self.projects.insert(id, project);
        self.structural = true;
        tracing::info!("project {}: created ({})", id, title);
        Some(id)
    }

    /// Existing project, or a placeholder for an id nobody created yet.
    pub fn get_or_create(&mut self, id: ProjectId) -> &mut Project {
        if !self.projects.contains_key(&id) {
            tracing::info!("project {}: created implicitly", id);
            self.structural = true;
        }
        self.projects.entry(id).or_insert_with(|| Project {
            title: format!("Project {}", id),
            dirty: true,
            needs_persist: true,
            ..Project::default()
        })
    }

    /// Delete an empty project other than 0.
    pub fn delete(&mut self, id: ProjectId) -> bool {
        match self.projects.get(&id) {
            Some(p) if id != UNASSIGNED && p.member_device_ids.is_empty() => {
                self.projects.remove(&id);
                self.structural = true;
                tracing::info!("project {}: deleted", id);
                true
            }
            _ => false,
        }
    }

    pub fn set_email(&mut self, id: ProjectId, email: &str) -> bool {
        match self.projects.get_mut(&id) {
            Some(p) => {
                p.email = email.trim().to_string();
                p.stale = true;
                p.needs_persist = true;
                true
            }
            None => false,
        }
    }

    pub fn project_of(&self, device: DeviceId) -> Option<ProjectId> {
        self.iter().find(|(_, p)| p.member_device_ids.contains(&device)).map(|(id, _)| id)
    }

    pub fn add_member(&mut self, id: ProjectId, device: DeviceId) {
        let project = self.get_or_create(id);
        if project.member_device_ids.insert(device) {
            project.touch_membership();
        }
    }

    /// Take `device` out of every project.
    pub fn remove_member(&mut self, device: DeviceId) {
        for project in self.projects.values_mut() {
            if project.member_device_ids.remove(&device) {
                project.touch_membership();
            }
        }
    }

    pub fn mark_stale(&mut self, id: ProjectId) {
        if let Some(p) = self.projects.get_mut(&id) {
            p.stale = true;
        }
    }

    // --- repair passes ---

    /// Keep each device only in the lowest-numbered project that lists it.
    pub fn dedupe_members(&mut self) -> usize {
        let mut seen = BTreeSet::new();
        let mut repaired = 0;
        for (id, project) in self.projects.iter_mut() {
            let duplicates: Vec<DeviceId> =
                project.member_device_ids.iter().copied().filter(|d| seen.contains(d)).collect();
            for device in &duplicates {
                tracing::warn!("device {} listed in several projects, dropped from project {}", device, id);
                project.member_device_ids.remove(device);
            }
            if !duplicates.is_empty() {
                project.touch_membership();
                repaired += duplicates.len();
            }
            seen.extend(project.member_device_ids.iter().copied());
        }
        repaired
    }

    /// Drop members the device store does not know.
    pub fn prune_members(&mut self, known: &BTreeSet<DeviceId>) {
        for (id, project) in self.projects.iter_mut() {
            let before = project.member_device_ids.len();
            project.member_device_ids.retain(|d| known.contains(d));
            if project.member_device_ids.len() != before {
                tracing::warn!("project {}: dropped {} unknown members", id, before - project.member_device_ids.len());
                project.touch_membership();
            }
        }
    }

    /// Put every known device that belongs nowhere into project 0.
    pub fn adopt_unassigned(&mut self, known: &BTreeSet<DeviceId>) -> Vec<DeviceId> {
        let assigned: BTreeSet<DeviceId> =
            self.projects.values().flat_map(|p| p.member_device_ids.iter().copied()).collect();
        let orphans: Vec<DeviceId> = known.difference(&assigned).copied().collect();
        if !orphans.is_empty() {
            let unassigned = self.get_or_create(UNASSIGNED);
            unassigned.member_device_ids.extend(orphans.iter().copied());
            unassigned.touch_membership();
            unassigned.stale = true;
        }
        orphans
    }

    /// Recompute each project's server set from its members' owners.
    pub fn derive_servers(&mut self, owner_of: impl Fn(DeviceId) -> ServerId) {
        for project in self.projects.values_mut() {
            let servers: BTreeSet<ServerId> = project
                .member_device_ids
                .iter()
                .map(|d| owner_of(*d))
                .filter(|s| *s != 0)
                .collect();
            if servers != project.server_ids {
                project.server_ids = servers;
                project.stale = true;
            }
        }
    }

    /// Drain the dirty/stale signals.
    pub fn take_signals(&mut self) -> ProjectSignals {
        let mut signals = ProjectSignals::default();
        for (id, project) in self.projects.iter_mut() {
            if std::mem::take(&mut project.dirty) {
                signals.dirty.insert(*id);
            }
            if std::mem::take(&mut project.stale) {
                signals.stale.insert(*id);
            }
        }
        signals
    }

    pub fn is_dirty(&self) -> bool {
        self.structural || self.projects.values().any(|p| p.needs_persist)
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        documents::save(path, &self.projects)?;
        for project in self.projects.values_mut() {
            project.needs_persist = false;
        }
        self.structural = false;
        Ok(())
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_zero_always_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("projects.json");
        std::fs::write(&path, r#"{"3": {"title": "Field", "owner": "ana"}}"#).unwrap();
        let store = ProjectStore::load(&path);
        assert!(store.contains(UNASSIGNED));
        assert!(store.contains(3));
        assert!(store.is_dirty());
    }

    #[test]
    fn creation_requires_title_and_owner() {
        let mut store = ProjectStore::default();
        assert_eq!(store.create("  ", "ana", ""), None);
        assert_eq!(store.create("Field", "", ""), None);
        assert_eq!(store.create("Field", "ana", "ana@example.org"), Some(1));
        assert_eq!(store.create("Lab", "bo", ""), Some(2));
        assert!(store.delete(1));
        assert_eq!(store.create("Roof", "cy", ""), Some(1));
    }

    #[test]
    fn only_empty_projects_are_deleted() {
        let mut store = ProjectStore::default();
        let id = store.create("Field", "ana", "").unwrap();
        store.add_member(id, 5);
        assert!(!store.delete(id));
        assert!(!store.delete(UNASSIGNED));
        store.remove_member(5);
        assert!(store.delete(id));
    }

    #[test]
    fn duplicates_stay_in_first_project() {
        let mut store = ProjectStore::default();
        let a = store.create("A", "ana", "").unwrap();
        let b = store.create("B", "bo", "").unwrap();
        store.add_member(a, 1);
        store.add_member(b, 1);
        store.add_member(b, 2);
        store.take_signals();

        assert_eq!(store.dedupe_members(), 1);
        assert_eq!(store.project_of(1), Some(a));
        assert!(store.get(b).unwrap().member_device_ids.contains(&2));
        let signals = store.take_signals();
        assert_eq!(signals.dirty, BTreeSet::from([b]));
    }

    #[test]
    fn unassigned_devices_land_in_project_zero() {
        let mut store = ProjectStore::default();
        let a = store.create("A", "ana", "").unwrap();
        store.add_member(a, 1);
        store.take_signals();

        let known = BTreeSet::from([1, 2, 3]);
        assert_eq!(store.adopt_unassigned(&known), vec![2, 3]);
        assert_eq!(store.get(UNASSIGNED).unwrap().member_device_ids, BTreeSet::from([2, 3]));
        let signals = store.take_signals();
        assert!(signals.dirty.contains(&UNASSIGNED));
        assert!(signals.stale.contains(&UNASSIGNED));
    }

    #[test]
    fn server_set_change_marks_stale() {
        let mut store = ProjectStore::default();
        store.add_member(UNASSIGNED, 1);
        store.add_member(UNASSIGNED, 2);
        store.take_signals();

        store.derive_servers(|d| if d == 1 { 7 } else { 0 });
        assert_eq!(store.get(UNASSIGNED).unwrap().server_ids, BTreeSet::from([7]));
        assert!(store.take_signals().stale.contains(&UNASSIGNED));

        store.derive_servers(|d| if d == 1 { 7 } else { 0 });
        assert!(store.take_signals().stale.is_empty());
    }
}
