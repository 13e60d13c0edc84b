//! Configuration file parsing tests
//!
//! Tests that host configuration files load from disk, fall back to defaults
//! for omitted sections and are rejected when values are out of range.

use host::config::HostConfig;
use protocol::ChannelMode;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

const MINIMAL_CONFIG: &str = r#"
[host]
log_level = "info"
mode = "accessory"
"#;

const FULL_CONFIG: &str = r#"
[host]
log_level = "debug"
mode = "accessory+audio"
accessory_socket = "/run/aoa/accessory.sock"
audio_socket = "/run/aoa/audio.sock"
retry_interval_ms = 500

[device]
vendor_id = 0x18d1
product_ids = [0x4ee2]
discovery_timeout_ms = 200
reacquire_timeout_ms = 3000
poll_interval_ms = 100
control_timeout_ms = 500

[identity]
manufacturer = "Example"
model = "Car Head Unit"
description = "In-car audio"
version = "2.1"
uri = "https://example.com/head-unit"
serial = "HU-0001"

[bridge]
buffer_size = 4096
poll_interval_ms = 50

[audio]
packets_per_transfer = 64
alternate_setting = 1
"#;

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("host.toml");
    fs::write(&path, content).unwrap();
    path
}

mod loading {
    use super::*;

    #[test]
    fn test_load_minimal_config() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, MINIMAL_CONFIG);

        let config = HostConfig::load(Some(path)).unwrap();
        assert_eq!(config.host.mode, ChannelMode::ACCESSORY);
        assert_eq!(config.host.retry_interval(), Duration::from_millis(100));
        assert_eq!(config.device, HostConfig::default().device);
        assert_eq!(config.identity, HostConfig::default().identity);
        assert_eq!(config.bridge.buffer_size, 16384);
    }

    #[test]
    fn test_load_full_config() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, FULL_CONFIG);

        let config = HostConfig::load(Some(path)).unwrap();
        assert_eq!(config.host.mode, ChannelMode::ALL);
        assert_eq!(config.host.audio_socket_path().to_str(), Some("/run/aoa/audio.sock"));
        assert_eq!(config.identity.model, "Car Head Unit");

        let settings = config.session_settings();
        assert_eq!(settings.product_ids, vec![0x4ee2]);
        assert_eq!(settings.reacquire_timeout, Duration::from_secs(3));
        assert_eq!(settings.bridge.poll_interval, Duration::from_millis(50));
        assert_eq!(settings.packets_per_transfer, 64);
        assert_eq!(settings.alternate_setting, Some(1));
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("host.toml");

        let mut config = HostConfig::default();
        config.host.mode = ChannelMode::AUDIO;
        config.identity.serial = "0042".to_string();
        config.save(&path).unwrap();

        assert_eq!(HostConfig::load(Some(path)).unwrap(), config);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(HostConfig::load(Some(dir.path().join("absent.toml"))).is_err());
    }
}

mod validation {
    use super::*;

    fn load(content: &str) -> anyhow::Result<HostConfig> {
        let dir = TempDir::new().unwrap();
        HostConfig::load(Some(write_config(&dir, content)))
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let result = load("[host]\nlog_level = \"info\"\nmode = \"video\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_mode_rejected() {
        let result = load("[host]\nlog_level = \"info\"\nmode = \"\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let result = load("[host]\nlog_level = \"loud\"\nmode = \"audio\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_host_section_rejected() {
        let result = load("[bridge]\nbuffer_size = 1024\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let content = format!("{}\n[bridge]\nbuffer_size = 0\n", MINIMAL_CONFIG);
        assert!(load(&content).is_err());
    }

    #[test]
    fn test_unaligned_buffer_rejected() {
        let content = format!("{}\n[bridge]\nbuffer_size = 4000\n", MINIMAL_CONFIG);
        assert!(load(&content).is_err());

        let content = format!("{}\n[bridge]\nbuffer_size = 4096\n", MINIMAL_CONFIG);
        assert_eq!(load(&content).unwrap().bridge.buffer_size, 4096);
    }

    #[test]
    fn test_nul_in_identity_rejected() {
        let content = format!("{}\n[identity]\nserial = \"12\\u00003\"\n", MINIMAL_CONFIG);
        assert!(load(&content).is_err());
    }
}
