//! ==============================================================================
//! documents.rs - whole-document persistence
//! ==============================================================================
//!
//! purpose:
//!     every store (registry, devices, servers, projects) is one json document
//!     that is read in full and rewritten in full. this module owns the
//!     file operations they share:
//!     - lenient load: missing or malformed documents come back as `Default`
//!     - atomic save: write a sibling temp file, then rename over the target
//!     - backup: timestamped copy of the previous document, best effort
//!     - per-record validation: one bad record is dropped, not the document
//!
//! relationships:
//!     - used by: registry.rs, device.rs, server.rs, project.rs
//!     - uses: serde_json, timestamp.rs (backup names)
//!
//! ==============================================================================

use crate::error::Result;
use crate::timestamp::Stamp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Read a document, treating absence or corruption as an empty document.
pub fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            tracing::warn!("cannot read {}: {}, starting empty", path.display(), e);
            return T::default();
        }
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return T::default();
    }
    match serde_json::from_slice(&bytes) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::warn!("malformed document {}: {}, starting empty", path.display(), e);
            T::default()
        }
    }
}

/// Read an id-keyed document record by record.
///
/// Keys that are not integers (or are zero when `allow_zero` is false) and
/// records that do not decode are dropped with a warning.
pub fn load_records<T: DeserializeOwned>(path: &Path, allow_zero: bool) -> BTreeMap<u32, T> {
    let raw: BTreeMap<String, serde_json::Value> = load_or_default(path);
    let mut records = BTreeMap::new();
    for (key, value) in raw {
        let id = match key.trim().parse::<u32>() {
            Ok(id) if id > 0 || allow_zero => id,
            _ => {
                tracing::warn!("{}: dropping record with bad key {:?}", path.display(), key);
                continue;
            }
        };
        match serde_json::from_value(value) {
            Ok(record) => {
                records.insert(id, record);
            }
            Err(e) => tracing::warn!("{}: dropping record {}: {}", path.display(), id, e),
        }
    }
    records
}

/// Field deserializer that turns a wrongly typed value into its default.
pub fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// List deserializer that keeps the entries that decode.
///
/// Anything other than an array reads as an empty list.
pub fn lenient_list<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let items = match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Null => return Ok(Vec::new()),
        other => {
            tracing::warn!("expected a list, got {}", other);
            return Ok(Vec::new());
        }
    };
    Ok(items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("dropping malformed list entry: {}", e);
                None
            }
        })
        .collect())
}

/// Rewrite a document in full.
pub fn save<T: Serialize>(path: &Path, doc: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(doc)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Copy the current document to `<backup_dir>/<name>.<stamp>`.
///
/// Failures are logged and swallowed.
pub fn backup(path: &Path, backup_dir: &Path, now: Stamp) {
    if !path.exists() {
        return;
    }
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let target = backup_dir.join(format!("{}.{}", name, now));
    let result = fs::create_dir_all(backup_dir).and_then(|_| fs::copy(path, &target));
    match result {
        Ok(_) => tracing::debug!("backed up {} to {}", path.display(), target.display()),
        Err(e) => tracing::warn!("backup of {} failed: {}", path.display(), e),
    }
}
