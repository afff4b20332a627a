//! Configuration types for the check-in core.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, VigilError};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    /// Storage settings.
    pub storage: StorageConfig,
    /// Check-in cadence and escalation settings.
    pub checkin: CheckinConfig,
    /// Obligation materialization sweep settings.
    pub scheduler: SchedulerConfig,
    /// Outbound delivery settings.
    pub delivery: DeliveryConfig,
    /// Check-in photo archival settings.
    pub media: MediaConfig,
}

impl VigilConfig {
    /// Load configuration from a TOML file.
    ///
    /// Missing keys fall back to defaults; a missing file is an error so a
    /// typoed path fails loudly instead of silently running on defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| VigilError::Config(format!("{}: {e}", path.display())))
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the SQLite database file.
    pub root_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("data"),
        }
    }
}

/// Check-in cadence, grace, and escalation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckinConfig {
    /// Minutes after due time until the deadline fires.
    pub grace_minutes: i64,
    /// Minutes after due time at which reminders #1..#3 fire.
    pub reminder_offsets_min: Vec<i64>,
    /// Hours after the deadline during which a late arrival after an
    /// escalation still gets the late-notify prompt.
    pub late_grace_hours: i64,
    /// Hours to wait before the single unreachability recheck.
    pub unreachable_recheck_hours: i64,
    /// Days to retain resolved daily rows before they become purgeable.
    pub retention_days: i64,
    /// Maximum trusted contacts per user.
    pub contact_cap: usize,
}

impl Default for CheckinConfig {
    fn default() -> Self {
        Self {
            grace_minutes: 90,
            reminder_offsets_min: vec![30, 60, 90],
            late_grace_hours: 6,
            unreachable_recheck_hours: 12,
            retention_days: 7,
            contact_cap: 5,
        }
    }
}

/// Sweep loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How far ahead (hours) daily rows and timed events are materialized.
    pub window_hours: i64,
    /// Seconds between sweep ticks.
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            window_hours: 36,
            tick_secs: 300,
        }
    }
}

/// Outbound delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Per-second outbound message budget against the shared channel.
    pub rate_limit_per_sec: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_sec: 25,
        }
    }
}

/// Check-in photo archival configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// When false the archival path is fully disabled.
    pub archive_photos: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            archive_photos: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_fixed_constants() {
        let cfg = VigilConfig::default();
        assert_eq!(cfg.checkin.grace_minutes, 90);
        assert_eq!(cfg.checkin.reminder_offsets_min, vec![30, 60, 90]);
        assert_eq!(cfg.checkin.contact_cap, 5);
        assert_eq!(cfg.scheduler.window_hours, 36);
        assert_eq!(cfg.delivery.rate_limit_per_sec, 25);
        assert!(!cfg.media.archive_photos);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: VigilConfig = toml::from_str(
            r#"
            [scheduler]
            window_hours = 48
            "#,
        )
        .expect("parse partial config");
        assert_eq!(cfg.scheduler.window_hours, 48);
        assert_eq!(cfg.scheduler.tick_secs, 300);
        assert_eq!(cfg.checkin.grace_minutes, 90);
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let err = VigilConfig::load(Path::new("/nonexistent/vigil.toml"));
        assert!(err.is_err());
    }
}
