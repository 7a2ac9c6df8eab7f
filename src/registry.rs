//! ==============================================================================
//! registry.rs - stable device identities
//! ==============================================================================
//!
//! purpose:
//!     maps a board's hardware address to the small integer id every other
//!     document uses. ids are allocated smallest-free-first, so ids released
//!     by an operator removal are handed out again before new ones.
//!
//! relationships:
//!     - used by: engine.rs (resolve on boot and on every claimed device)
//!     - uses: documents.rs (load / save / backup), hex (address normalization)
//!
//! ==============================================================================

use crate::documents;
use crate::error::Result;
use crate::timestamp::Stamp;
use crate::DeviceId;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Canonical `AA:BB:CC:DD:EE:FF` form of a hardware address.
///
/// Anything that is not six hex bytes is kept as trimmed upper-case text.
pub fn normalize_mac(raw: &str) -> String {
    let digits: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();
    match hex::decode(&digits) {
        Ok(bytes) if bytes.len() == 6 => bytes
            .iter()
            .map(|b| hex::encode_upper([*b]))
            .collect::<Vec<_>>()
            .join(":"),
        _ => raw.trim().to_uppercase(),
    }
}

#[derive(Debug, Default)]
pub struct IdentityRegistry {
    by_mac: BTreeMap<String, DeviceId>,
    dirty: bool,
}

impl IdentityRegistry {
    pub fn load(path: &Path) -> Self {
        let raw: BTreeMap<String, DeviceId> = documents::load_or_default(path);
        let mut registry = Self::default();
        let mut taken = BTreeSet::new();
        for (mac, id) in raw {
            let mac = normalize_mac(&mac);
            if id == 0 || mac.is_empty() || !taken.insert(id) || registry.by_mac.contains_key(&mac) {
                tracing::warn!("dropping invalid registry entry {} -> {}", mac, id);
                registry.dirty = true;
                continue;
            }
            registry.by_mac.insert(mac, id);
        }
        registry
    }

    pub fn lookup(&self, mac: &str) -> Option<DeviceId> {
        self.by_mac.get(&normalize_mac(mac)).copied()
    }

    pub fn mac_of(&self, id: DeviceId) -> Option<&str> {
        self.by_mac.iter().find(|(_, v)| **v == id).map(|(k, _)| k.as_str())
    }

    /// Return the id for `mac`, allocating the smallest unused one if needed.
    pub fn allocate(&mut self, mac: &str) -> DeviceId {
        self.allocate_avoiding(mac, &BTreeSet::new())
    }

    /// Like `allocate`, but never hands out an id in `reserved` (devices
    /// known by id only, without a registered address).
    pub fn allocate_avoiding(&mut self, mac: &str, reserved: &BTreeSet<DeviceId>) -> DeviceId {
        let mac = normalize_mac(mac);
        if let Some(id) = self.by_mac.get(&mac) {
            return *id;
        }
        let mut used: BTreeSet<DeviceId> = self.by_mac.values().copied().collect();
        used.extend(reserved.iter().copied());
        let mut id = 1;
        for taken in &used {
            if *taken != id {
                break;
            }
            id += 1;
        }
        tracing::info!("allocated device id {} for {}", id, mac);
        self.by_mac.insert(mac, id);
        self.dirty = true;
        id
    }

    /// Re-register `mac` under the id a device record already carries.
    ///
    /// Returns whether an entry was added. Nothing changes when the address
    /// is already mapped or another address owns `id`.
    pub fn restore(&mut self, mac: &str, id: DeviceId) -> bool {
        let mac = normalize_mac(mac);
        if id == 0 || mac.is_empty() || self.by_mac.contains_key(&mac) {
            return false;
        }
        if let Some((other, _)) = self.by_mac.iter().find(|(_, v)| **v == id) {
            tracing::warn!("cannot restore {} -> {}: id belongs to {}", mac, id, other);
            return false;
        }
        tracing::warn!("restored registry entry {} -> {} from device record", mac, id);
        self.by_mac.insert(mac, id);
        self.dirty = true;
        true
    }

    pub fn release(&mut self, id: DeviceId) {
        let before = self.by_mac.len();
        self.by_mac.retain(|_, v| *v != id);
        if self.by_mac.len() != before {
            tracing::info!("released device id {}", id);
            self.dirty = true;
        }
    }

    pub fn len(&self) -> usize {
        self.by_mac.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_mac.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Back up the previous document, then rewrite it if anything changed.
    pub fn save(&mut self, path: &Path, backup_dir: &Path, now: Stamp) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        documents::backup(path, backup_dir, now);
        documents::save(path, &self.by_mac)?;
        self.dirty = false;
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
    fn normalizes_addresses() {
        assert_eq!(normalize_mac("aa:bb:cc:dd:ee:ff"), "AA:BB:CC:DD:EE:FF");
        assert_eq!(normalize_mac("aa-bb-cc-dd-ee-ff"), "AA:BB:CC:DD:EE:FF");
        assert_eq!(normalize_mac(" aabb.ccdd.eeff "), "AA:BB:CC:DD:EE:FF");
        assert_eq!(normalize_mac("board-7"), "BOARD-7");
    }

    #[test]
    fn allocation_is_stable() {
        let mut registry = IdentityRegistry::default();
        let a = registry.allocate("AA:BB:CC:DD:EE:01");
        let b = registry.allocate("AA:BB:CC:DD:EE:02");
        assert_eq!((a, b), (1, 2));
        assert_eq!(registry.allocate("aa:bb:cc:dd:ee:01"), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn released_gap_is_reused_first() {
        let mut registry = IdentityRegistry::default();
        for n in 1..=4 {
            assert_eq!(registry.allocate(&format!("00:00:00:00:00:0{}", n)), n);
        }
        registry.release(3);
        assert_eq!(registry.lookup("00:00:00:00:00:03"), None);
        assert_eq!(registry.allocate("00:00:00:00:00:09"), 3);
        assert_eq!(registry.allocate("00:00:00:00:00:0A"), 5);
    }

    #[test]
    fn reserved_ids_are_skipped() {
        let mut registry = IdentityRegistry::default();
        let reserved = BTreeSet::from([1, 2, 4]);
        assert_eq!(registry.allocate_avoiding("00:00:00:00:00:01", &reserved), 3);
        assert_eq!(registry.allocate_avoiding("00:00:00:00:00:02", &reserved), 5);
        assert_eq!(registry.allocate_avoiding("00:00:00:00:00:01", &reserved), 3);
    }

    #[test]
    fn restore_only_fills_free_slots() {
        let mut registry = IdentityRegistry::default();
        registry.allocate("AA:BB:CC:DD:EE:01");
        assert!(registry.restore("aa:bb:cc:dd:ee:05", 5));
        assert_eq!(registry.lookup("AA:BB:CC:DD:EE:05"), Some(5));
        assert!(!registry.restore("AA:BB:CC:DD:EE:05", 5));
        assert!(!registry.restore("AA:BB:CC:DD:EE:09", 1));
        assert!(!registry.restore("", 7));
        assert_eq!(registry.allocate("AA:BB:CC:DD:EE:02"), 2);
    }

    #[test]
    fn save_writes_backup_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let backups = dir.path().join("backups");
        let now = Stamp::parse("20240601120000").unwrap();

        let mut registry = IdentityRegistry::default();
        registry.allocate("AA:BB:CC:DD:EE:FF");
        registry.save(&path, &backups, now).unwrap();
        assert!(!registry.is_dirty());

        let mut reloaded = IdentityRegistry::load(&path);
        assert_eq!(reloaded.lookup("AA:BB:CC:DD:EE:FF"), Some(1));
        reloaded.allocate("AA:BB:CC:DD:EE:00");
        reloaded.save(&path, &backups, now).unwrap();
        assert!(backups.join("registry.json.20240601120000").exists());
    }

    #[test]
    fn load_drops_colliding_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, r#"{"AA:AA:AA:AA:AA:01": 1, "AA:AA:AA:AA:AA:02": 1, "X": 0}"#).unwrap();
        let registry = IdentityRegistry::load(&path);
        assert_eq!(registry.len(), 1);
        assert!(registry.is_dirty());
    }
}
