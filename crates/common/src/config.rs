//! Host configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Default log filter when RUST_LOG is unset
    #[serde(default = "HostConfig::default_log_level")]
    pub log_level: String,
    /// Device-number dispatch settings
    #[serde(default)]
    pub dispatch: DispatchSettings,
    /// USB transfer settings
    #[serde(default)]
    pub usb: UsbSettings,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            dispatch: DispatchSettings::default(),
            usb: UsbSettings::default(),
        }
    }
}

/// Device-number dispatch settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Invert the low bit of tuner front-end instance numbers.
    ///
    /// Some dual-tuner boards enumerate their front ends in the opposite
    /// order from what the hosted driver registers.
    #[serde(default)]
    pub swap_frontend_parity: bool,
}

/// USB transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Target buffering latency for isochronous endpoints, in milliseconds
    #[serde(default = "UsbSettings::default_iso_latency_ms")]
    pub iso_latency_ms: u64,
    /// Time slice for one hardware transfer attempt, in milliseconds.
    /// Bounds how long a cancellation can lag behind an in-flight transfer.
    #[serde(default = "UsbSettings::default_transfer_slice_ms")]
    pub transfer_slice_ms: u64,
    /// VID:PID patterns selecting which enumerated devices may attach
    /// (empty means all), e.g. `["0x2040:*", "0x0fd9:0x0066"]`
    #[serde(default)]
    pub filters: Vec<String>,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            iso_latency_ms: Self::default_iso_latency_ms(),
            transfer_slice_ms: Self::default_transfer_slice_ms(),
            filters: Vec::new(),
        }
    }
}

impl UsbSettings {
    fn default_iso_latency_ms() -> u64 {
        30
    }

    fn default_transfer_slice_ms() -> u64 {
        250
    }
}

impl HostConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("driver-host").join("config.toml")
        } else {
            PathBuf::from("/etc/driver-host/config.toml")
        }
    }

    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load from the default path, falling back to defaults when the file
    /// does not exist
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            debug!("no config file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config dir: {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(!config.dispatch.swap_frontend_parity);
        assert_eq!(config.usb.iso_latency_ms, 30);
        assert_eq!(config.usb.transfer_slice_ms, 250);
        assert!(config.usb.filters.is_empty());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: HostConfig = toml::from_str(
            r#"
[usb]
iso_latency_ms = 60
"#,
        )
        .unwrap();
        assert_eq!(config.usb.iso_latency_ms, 60);
        assert_eq!(config.usb.transfer_slice_ms, 250);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_round_trip() {
        let mut config = HostConfig::default();
        config.dispatch.swap_frontend_parity = true;
        config.usb.filters = vec!["0x2040:*".to_string()];

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: HostConfig = toml::from_str(&text).unwrap();
        assert!(parsed.dispatch.swap_frontend_parity);
        assert_eq!(parsed.usb.filters, config.usb.filters);
    }
}
