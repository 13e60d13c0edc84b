//! Host configuration management

use crate::session::SessionSettings;
use crate::usb::bridge::BridgeSettings;
use anyhow::{Context, Result, anyhow};
use protocol::aoa::{GOOGLE_VENDOR_ID, PID_ANGLER, PID_HAMMERHEAD};
use protocol::{AccessoryIdentity, ChannelMode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest bulk max packet size (high speed); bulk IN buffers must be a
/// multiple of it or libusb may report an overflow
const BULK_PACKET_SIZE: usize = 512;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    pub host: HostSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    /// Identification strings sent during the accessory handshake
    #[serde(default)]
    pub identity: AccessoryIdentity,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub audio: AudioSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSettings {
    pub log_level: String,
    /// Channels to open: "accessory", "audio" or "accessory+audio"
    pub mode: ChannelMode,
    /// Unix socket serving the accessory byte pipe (`~` is expanded)
    #[serde(default = "HostSettings::default_accessory_socket")]
    pub accessory_socket: String,
    /// Unix socket serving the audio stream (`~` is expanded)
    #[serde(default = "HostSettings::default_audio_socket")]
    pub audio_socket: String,
    /// Delay between attempts while no device is attached
    #[serde(default = "HostSettings::default_retry_interval")]
    pub retry_interval_ms: u64,
}

impl HostSettings {
    fn default_accessory_socket() -> String {
        "/tmp/aoa-bridge/accessory.sock".to_string()
    }

    fn default_audio_socket() -> String {
        "/tmp/aoa-bridge/audio.sock".to_string()
    }

    fn default_retry_interval() -> u64 {
        100
    }

    pub fn accessory_socket_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.accessory_socket).as_ref())
    }

    pub fn audio_socket_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.audio_socket).as_ref())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Which phone to look for and how long to wait for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub vendor_id: u16,
    pub product_ids: Vec<u16>,
    pub discovery_timeout_ms: u64,
    /// Wait for the device to come back after switching to accessory mode
    pub reacquire_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub control_timeout_ms: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            vendor_id: GOOGLE_VENDOR_ID,
            product_ids: vec![PID_HAMMERHEAD, PID_ANGLER],
            discovery_timeout_ms: 100,
            reacquire_timeout_ms: 5000,
            poll_interval_ms: 250,
            control_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Size of the bulk transfer buffers in bytes
    pub buffer_size: usize,
    /// Timeout of blocking calls; shutdown is noticed within one interval
    pub poll_interval_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            buffer_size: 16 * 1024,
            poll_interval_ms: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub packets_per_transfer: usize,
    /// Audio streaming alternate setting; the largest packet size wins when unset
    pub alternate_setting: Option<u8>,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            packets_per_transfer: 128,
            alternate_setting: None,
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: HostSettings {
                log_level: "info".to_string(),
                mode: ChannelMode::ALL,
                accessory_socket: HostSettings::default_accessory_socket(),
                audio_socket: HostSettings::default_audio_socket(),
                retry_interval_ms: HostSettings::default_retry_interval(),
            },
            device: DeviceSettings::default(),
            identity: AccessoryIdentity::default(),
            bridge: BridgeConfig::default(),
            audio: AudioSettings::default(),
        }
    }
}

impl HostConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/aoa-bridge/host.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("aoa-bridge").join("host.toml")
        } else {
            PathBuf::from(".config/aoa-bridge/host.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.device.product_ids.is_empty() {
            return Err(anyhow!("device.product_ids must name at least one product id"));
        }

        if self.device.poll_interval_ms == 0 || self.bridge.poll_interval_ms == 0 {
            return Err(anyhow!("Poll intervals must be greater than 0"));
        }

        if self.bridge.buffer_size == 0 || self.bridge.buffer_size % BULK_PACKET_SIZE != 0 {
            return Err(anyhow!(
                "bridge.buffer_size must be a non-zero multiple of {} bytes, got {}",
                BULK_PACKET_SIZE,
                self.bridge.buffer_size
            ));
        }

        if self.audio.packets_per_transfer == 0 {
            return Err(anyhow!("audio.packets_per_transfer must be greater than 0"));
        }

        self.identity
            .validate()
            .context("Invalid identification string")?;

        Ok(())
    }

    /// Settings for opening a session with this configuration
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            vendor_id: self.device.vendor_id,
            product_ids: self.device.product_ids.clone(),
            discovery_timeout: Duration::from_millis(self.device.discovery_timeout_ms),
            reacquire_timeout: Duration::from_millis(self.device.reacquire_timeout_ms),
            poll_interval: Duration::from_millis(self.device.poll_interval_ms),
            control_timeout: Duration::from_millis(self.device.control_timeout_ms),
            identity: self.identity.clone(),
            bridge: BridgeSettings {
                buffer_size: self.bridge.buffer_size,
                poll_interval: Duration::from_millis(self.bridge.poll_interval_ms),
            },
            packets_per_transfer: self.audio.packets_per_transfer,
            alternate_setting: self.audio.alternate_setting,
        }
    }
}
