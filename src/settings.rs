use crate::error::SettingsError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppSettings {
    /// Release catalog location. `None` means no update information.
    #[serde(default)]
    pub update_server_url: Option<String>,
    #[serde(default)]
    pub show_beta_versions: bool,

    // Discovery
    #[serde(default)]
    pub undiscover_enabled: bool,
    #[serde(default = "default_undiscover_check_period_ms")]
    pub undiscover_check_period_ms: u64,
    #[serde(default = "default_undiscover_threshold_ms")]
    pub undiscover_threshold_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    // Firmware updates
    #[serde(default = "default_dfu_transfer_timeout_secs")]
    pub dfu_transfer_timeout_secs: u64,
    #[serde(default = "default_dfu_finalize_timeout_secs")]
    pub dfu_finalize_timeout_secs: u64,
    #[serde(default = "default_dfu_cancel_grace_ms")]
    pub dfu_cancel_grace_ms: u64,

    // UART export preferences
    #[serde(default)]
    pub uart_hex_mode: bool,
    #[serde(default)]
    pub uart_display_timestamp: bool,

    /// Enables file logging when set.
    #[serde(default)]
    pub reports_dir: Option<String>,
}

fn default_undiscover_check_period_ms() -> u64 {
    1000
}
fn default_undiscover_threshold_ms() -> u64 {
    30_000
}
fn default_connect_timeout_secs() -> u64 {
    15
}
fn default_dfu_transfer_timeout_secs() -> u64 {
    300
}
fn default_dfu_finalize_timeout_secs() -> u64 {
    30
}
fn default_dfu_cancel_grace_ms() -> u64 {
    2000
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            update_server_url: None,
            show_beta_versions: false,
            undiscover_enabled: false,
            undiscover_check_period_ms: default_undiscover_check_period_ms(),
            undiscover_threshold_ms: default_undiscover_threshold_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            dfu_transfer_timeout_secs: default_dfu_transfer_timeout_secs(),
            dfu_finalize_timeout_secs: default_dfu_finalize_timeout_secs(),
            dfu_cancel_grace_ms: default_dfu_cancel_grace_ms(),
            uart_hex_mode: false,
            uart_display_timestamp: false,
            reports_dir: None,
        }
    }
}

/// Staleness eviction tunables consumed by the BLE manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryConfig {
    pub undiscover_enabled: bool,
    pub check_period: Duration,
    pub threshold: Duration,
    /// Bound on each adapter call: scan start and stop, connect, disconnect.
    pub connect_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        AppSettings::default().discovery_config()
    }
}

/// Timeouts consumed by the DFU orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuTimeouts {
    pub transfer: Duration,
    pub finalize: Duration,
    pub cancel_grace: Duration,
}

impl Default for DfuTimeouts {
    fn default() -> Self {
        AppSettings::default().dfu_timeouts()
    }
}

impl AppSettings {
    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            undiscover_enabled: self.undiscover_enabled,
            // A zero period would spin the sweep timer.
            check_period: Duration::from_millis(self.undiscover_check_period_ms.max(10)),
            threshold: Duration::from_millis(self.undiscover_threshold_ms),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    pub fn dfu_timeouts(&self) -> DfuTimeouts {
        DfuTimeouts {
            transfer: Duration::from_secs(self.dfu_transfer_timeout_secs),
            finalize: Duration::from_secs(self.dfu_finalize_timeout_secs),
            cancel_grace: Duration::from_millis(self.dfu_cancel_grace_ms),
        }
    }
}

/// Default location: `<config dir>/bluefruit-connect/settings.json`.
pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir()
        .ok_or(SettingsError::NoConfigDir)?
        .join("bluefruit-connect");
    Ok(dir.join("settings.json"))
}

/// Load settings from `path`. First run writes and returns the defaults.
pub fn load_settings(path: &Path) -> Result<AppSettings, SettingsError> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        let settings = AppSettings::default();
        save_settings(path, &settings)?;
        Ok(settings)
    }
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_take_defaults() {
        let settings: AppSettings =
            serde_json::from_str(r#"{ "show_beta_versions": true }"#).unwrap();
        assert!(settings.show_beta_versions);
        assert!(!settings.undiscover_enabled);
        assert_eq!(settings.undiscover_threshold_ms, 30_000);
        assert_eq!(settings.dfu_cancel_grace_ms, 2000);
    }

    #[test]
    fn test_load_creates_defaults() {
        let dir = std::env::temp_dir().join(format!(
            "bluefruit-settings-test-{}",
            std::process::id()
        ));
        let path = dir.join("settings.json");
        let _ = std::fs::remove_file(&path);

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings, AppSettings::default());
        assert!(path.exists());

        let mut changed = settings.clone();
        changed.uart_hex_mode = true;
        save_settings(&path, &changed).unwrap();
        assert!(load_settings(&path).unwrap().uart_hex_mode);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_projections() {
        let settings = AppSettings {
            undiscover_check_period_ms: 0,
            ..AppSettings::default()
        };
        let discovery = settings.discovery_config();
        assert_eq!(discovery.check_period, Duration::from_millis(10));
        assert_eq!(settings.dfu_timeouts().finalize, Duration::from_secs(30));
    }
}
