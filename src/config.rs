// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving application settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bluetooth::{config as ble, normal, provisioning, ConfigKey, ConnectOptions};

/// Directory name under the platform config dir.
const APP_DIR: &str = "hid-typer";

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// File this configuration was loaded from.
    #[serde(skip)]
    pub path: PathBuf,

    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,

    /// Local device settings, owned by the front end.
    pub settings: DeviceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Name prefix advertised by unprovisioned devices.
    pub provisioning_name_prefix: String,

    /// Name prefix advertised by provisioned devices.
    pub normal_name_prefix: String,

    /// Connect only to this address when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_address: Option<String>,

    /// How long to scan, in seconds.
    pub scan_timeout_secs: u64,

    /// Status re-read interval in milliseconds.
    pub status_poll_interval_ms: u64,

    /// Wait for a provisioning result in milliseconds. 0 waits forever.
    pub rpc_timeout_ms: u64,

    /// Largest single GATT write.
    pub write_mtu: usize,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            provisioning_name_prefix: provisioning::DEVICE_NAME.to_string(),
            normal_name_prefix: normal::DEVICE_NAME.to_string(),
            device_address: None,
            scan_timeout_secs: ble::SCAN_TIMEOUT_SECS,
            status_poll_interval_ms: ble::STATUS_POLL_INTERVAL_MS,
            rpc_timeout_ms: ble::RPC_TIMEOUT_MS,
            write_mtu: ble::WRITE_MTU,
        }
    }
}

impl BluetoothConfig {
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            provisioning_name_prefix: self.provisioning_name_prefix.clone(),
            normal_name_prefix: self.normal_name_prefix.clone(),
            scan_timeout: Duration::from_secs(self.scan_timeout_secs),
        }
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms.max(100))
    }
}

/// Device settings as last applied from this machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Delay between typed characters in milliseconds (5-100).
    pub typing_delay_ms: u32,

    /// LED brightness in percent (1-100).
    pub led_brightness: u32,

    /// Show key combinations that can affect the host system.
    pub advanced_commands: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            typing_delay_ms: 10,
            led_brightness: 5,
            advanced_commands: false,
        }
    }
}

/// Read/write access to local settings.
pub trait SettingsStore {
    fn get(&self, key: ConfigKey) -> u32;

    /// Store `value` clamped to the key's range and return what was stored.
    fn set(&mut self, key: ConfigKey, value: u32) -> Result<u32>;

    fn advanced_commands(&self) -> bool;

    fn set_advanced_commands(&mut self, enabled: bool) -> Result<()>;
}

impl SettingsStore for DeviceSettings {
    fn get(&self, key: ConfigKey) -> u32 {
        match key {
            ConfigKey::TypingDelay => self.typing_delay_ms,
            ConfigKey::LedBrightness => self.led_brightness,
        }
    }

    fn set(&mut self, key: ConfigKey, value: u32) -> Result<u32> {
        let value = key.clamp(value);
        match key {
            ConfigKey::TypingDelay => self.typing_delay_ms = value,
            ConfigKey::LedBrightness => self.led_brightness = value,
        }
        Ok(value)
    }

    fn advanced_commands(&self) -> bool {
        self.advanced_commands
    }

    fn set_advanced_commands(&mut self, enabled: bool) -> Result<()> {
        self.advanced_commands = enabled;
        Ok(())
    }
}

/// Settings backed by the config file; every change is saved.
impl SettingsStore for Config {
    fn get(&self, key: ConfigKey) -> u32 {
        self.settings.get(key)
    }

    fn set(&mut self, key: ConfigKey, value: u32) -> Result<u32> {
        let value = self.settings.set(key, value)?;
        self.save()?;
        Ok(value)
    }

    fn advanced_commands(&self) -> bool {
        self.settings.advanced_commands
    }

    fn set_advanced_commands(&mut self, enabled: bool) -> Result<()> {
        self.settings.set_advanced_commands(enabled)?;
        self.save()
    }
}

impl Config {
    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load from `path`, writing defaults there if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }

        let mut config: Self = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
        } else {
            let config = Self::default();
            let content = toml::to_string_pretty(&config)?;
            std::fs::write(path, content)?;
            config
        };

        config.path = path.to_path_buf();
        config.normalize();
        Ok(config)
    }

    /// Save configuration to the file it was loaded from.
    pub fn save(&self) -> Result<()> {
        let path = if self.path.as_os_str().is_empty() {
            Self::default_path()
        } else {
            self.path.clone()
        };
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Clamp hand-edited values back into range.
    fn normalize(&mut self) {
        self.settings.typing_delay_ms = ConfigKey::TypingDelay.clamp(self.settings.typing_delay_ms);
        self.settings.led_brightness = ConfigKey::LedBrightness.clamp(self.settings.led_brightness);
        self.bluetooth.write_mtu = self.bluetooth.write_mtu.max(1);
    }
}
