//! Integration tests for configuration parsing
//!
//! Tests host configuration parsing, including:
//! - Full config with all options
//! - Minimal config falling back to defaults
//! - Invalid configuration handling
//! - File save/load round trip

use common::HostConfig;

const FULL_CONFIG: &str = r#"
log_level = "debug"

[dispatch]
swap_frontend_parity = true

[usb]
iso_latency_ms = 50
transfer_slice_ms = 100
filters = ["0x2040:*", "0x0fd9:0x0066"]
"#;

#[test]
fn test_full_config() {
    let config: HostConfig = toml::from_str(FULL_CONFIG).unwrap();
    assert_eq!(config.log_level, "debug");
    assert!(config.dispatch.swap_frontend_parity);
    assert_eq!(config.usb.iso_latency_ms, 50);
    assert_eq!(config.usb.transfer_slice_ms, 100);
    assert_eq!(config.usb.filters.len(), 2);
}

#[test]
fn test_empty_config_is_all_defaults() {
    let config: HostConfig = toml::from_str("").unwrap();
    assert_eq!(config.log_level, "info");
    assert!(!config.dispatch.swap_frontend_parity);
    assert_eq!(config.usb.iso_latency_ms, 30);
}

#[test]
fn test_invalid_config_rejected() {
    let result: Result<HostConfig, _> = toml::from_str(
        r#"
[usb]
iso_latency_ms = "not a number"
"#,
    );
    assert!(result.is_err());
}

#[test]
fn test_save_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    let mut config = HostConfig::default();
    config.usb.iso_latency_ms = 45;
    config.usb.filters = vec!["0x2040:0x7200".to_string()];
    config.save(&path).unwrap();

    let loaded = HostConfig::load(&path).unwrap();
    assert_eq!(loaded.usb.iso_latency_ms, 45);
    assert_eq!(loaded.usb.filters, config.usb.filters);
}

#[test]
fn test_load_missing_file_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("does-not-exist.toml");
    assert!(HostConfig::load(&path).is_err());
}
