//! ==============================================================================
//! config.rs - authority configuration loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `authority.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - StorageConfig: where documents, history logs and backups live.
//!     - DeviceConfig: liveness thresholds for sensor boards.
//!     - ServerConfig: liveness thresholds and disk alarm for relay servers.
//!     - HistoryConfig: history span and redraw cadence.
//!     - ServiceConfig: sweep cadence and queue depth of the writer task.
//!     - LoggingConfig: default log filter.
//!
//! ==============================================================================

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthorityConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/backups`.
    pub backup_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { data_dir: PathBuf::from("data"), backup_dir: None }
    }
}

impl StorageConfig {
    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir.clone().unwrap_or_else(|| self.data_dir.join("backups"))
    }
}

/// Device liveness thresholds, all measured from last-seen.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceConfig {
    /// Active devices not seen for this long become SuspectDead.
    pub missing_after_secs: u64,
    pub first_alert_secs: u64,
    pub second_alert_secs: u64,
    /// Past this, the device drops out of active listings and redraws.
    pub retire_after_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            missing_after_secs: 10 * 60,
            first_alert_secs: 60 * 60,
            second_alert_secs: 24 * 60 * 60,
            retire_after_secs: 30 * 24 * 60 * 60,
        }
    }
}

impl DeviceConfig {
    pub fn missing_after(&self) -> Duration {
        Duration::from_secs(self.missing_after_secs)
    }

    pub fn first_alert(&self) -> Duration {
        Duration::from_secs(self.first_alert_secs)
    }

    pub fn second_alert(&self) -> Duration {
        Duration::from_secs(self.second_alert_secs)
    }

    pub fn retire_after(&self) -> Duration {
        Duration::from_secs(self.retire_after_secs)
    }
}

/// Relay server thresholds, all measured from the last heartbeat.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub down_after_secs: u64,
    pub first_alert_secs: u64,
    pub second_alert_secs: u64,
    pub retire_after_secs: u64,
    /// Free disk below this percentage of disk size raises the low-disk flag.
    pub low_disk_pct: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            down_after_secs: 10 * 60,
            first_alert_secs: 30 * 60,
            second_alert_secs: 12 * 60 * 60,
            retire_after_secs: 30 * 24 * 60 * 60,
            low_disk_pct: 10,
        }
    }
}

impl ServerConfig {
    pub fn down_after(&self) -> Duration {
        Duration::from_secs(self.down_after_secs)
    }

    pub fn first_alert(&self) -> Duration {
        Duration::from_secs(self.first_alert_secs)
    }

    pub fn second_alert(&self) -> Duration {
        Duration::from_secs(self.second_alert_secs)
    }

    pub fn retire_after(&self) -> Duration {
        Duration::from_secs(self.retire_after_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HistoryConfig {
    /// Longest span a history log keeps once cut.
    pub max_span_secs: u64,
    /// Redraw cadence for live devices.
    pub redraw_secs: u64,
    /// Redraw cadence for dead, not yet retired devices.
    pub dead_redraw_secs: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_span_secs: 7 * 24 * 60 * 60,
            redraw_secs: 5 * 60,
            dead_redraw_secs: 6 * 60 * 60,
        }
    }
}

impl HistoryConfig {
    pub fn max_span(&self) -> Duration {
        Duration::from_secs(self.max_span_secs)
    }

    pub fn redraw(&self) -> Duration {
        Duration::from_secs(self.redraw_secs)
    }

    pub fn dead_redraw(&self) -> Duration {
        Duration::from_secs(self.dead_redraw_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub sweep_interval_secs: u64,
    pub queue_depth: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { sweep_interval_secs: 60, queue_depth: 64 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

/// Where the active configuration came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigOrigin {
    /// File the configuration was read from; `None` means built-in defaults.
    pub source: Option<PathBuf>,
    /// Files that were found but failed to load, with the reason.
    pub rejected: Vec<(PathBuf, String)>,
}

impl ConfigOrigin {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self { source: Some(path.into()), rejected: Vec::new() }
    }

    pub fn log(&self) {
        for (path, reason) in &self.rejected {
            tracing::warn!("failed to load {}: {}", path.display(), reason);
        }
        match &self.source {
            Some(path) => tracing::info!("config loaded from {}", path.display()),
            None => tracing::warn!("no usable config file found, using defaults"),
        }
    }
}

impl AuthorityConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {}", path.as_ref().display()))?;

        let config: AuthorityConfig = toml::from_str(&content).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback
    pub fn load_or_default() -> (Self, ConfigOrigin) {
        Self::load_first(&[
            PathBuf::from("config").join("authority.toml"),
            PathBuf::from("..").join("config").join("authority.toml"),
        ])
    }

    /// First file in `paths` that exists and loads, else the defaults.
    ///
    /// Nothing is logged here; the caller reports the origin once logging is up.
    pub fn load_first(paths: &[PathBuf]) -> (Self, ConfigOrigin) {
        let mut origin = ConfigOrigin::default();
        for path in paths {
            if !path.exists() {
                continue;
            }
            match Self::load(path) {
                Ok(config) => {
                    origin.source = Some(path.clone());
                    return (config, origin);
                }
                Err(e) => origin.rejected.push((path.clone(), format!("{:#}", e))),
            }
        }
        (Self::default(), origin)
    }

    /// Thresholds must escalate, otherwise liveness could skip states.
    pub fn validate(&self) -> crate::Result<()> {
        let d = &self.device;
        if !(d.first_alert_secs < d.second_alert_secs && d.second_alert_secs <= d.retire_after_secs) {
            return Err(crate::Error::Config(
                "device thresholds must satisfy first_alert < second_alert <= retire_after".into(),
            ));
        }
        let s = &self.server;
        if !(s.down_after_secs <= s.first_alert_secs && s.first_alert_secs < s.second_alert_secs) {
            return Err(crate::Error::Config(
                "server thresholds must satisfy down_after <= first_alert < second_alert".into(),
            ));
        }
        if s.low_disk_pct > 100 {
            return Err(crate::Error::Config("low_disk_pct must be a percentage".into()));
        }
        if self.service.queue_depth == 0 {
            return Err(crate::Error::Config("queue_depth must be positive".into()));
        }
        Ok(())
    }

    /// Log a configuration summary
    pub fn log_summary(&self) {
        tracing::info!(
            data_dir = %self.storage.data_dir.display(),
            sweep_secs = self.service.sweep_interval_secs,
            device_missing_secs = self.device.missing_after_secs,
            server_down_secs = self.server.down_after_secs,
            history_span_secs = self.history.max_span_secs,
            "authority configuration"
        );
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: AuthorityConfig = toml::from_str(
            r#"
            [device]
            first_alert_secs = 120
            "#,
        )
        .unwrap();
        assert_eq!(config.device.first_alert_secs, 120);
        assert_eq!(config.device.second_alert_secs, DeviceConfig::default().second_alert_secs);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config = AuthorityConfig::default();
        config.device.first_alert_secs = config.device.second_alert_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authority.toml");
        std::fs::write(&path, "[storage]\ndata_dir = \"/var/fleet\"\n").unwrap();
        let config = AuthorityConfig::load(&path).unwrap();
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/fleet"));
        assert_eq!(config.storage.backup_dir(), PathBuf::from("/var/fleet/backups"));
    }

    #[test]
    fn invalid_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[device]\nfirst_alert_secs = 999999999\n").unwrap();
        let missing = dir.path().join("missing.toml");

        let (config, origin) = AuthorityConfig::load_first(&[missing, bad.clone()]);
        assert_eq!(config.device.first_alert_secs, DeviceConfig::default().first_alert_secs);
        assert_eq!(origin.source, None);
        assert_eq!(origin.rejected.len(), 1);
        assert_eq!(origin.rejected[0].0, bad);
    }

    #[test]
    fn search_skips_rejected_file() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.toml");
        let good = dir.path().join("good.toml");
        std::fs::write(&bad, "not = [toml").unwrap();
        std::fs::write(&good, "[service]\nqueue_depth = 8\n").unwrap();

        let (config, origin) = AuthorityConfig::load_first(&[bad, good.clone()]);
        assert_eq!(config.service.queue_depth, 8);
        assert_eq!(origin.source, Some(good));
        assert_eq!(origin.rejected.len(), 1);
    }
}
