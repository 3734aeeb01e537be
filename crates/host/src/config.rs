//! Host configuration management

use anyhow::{Context, Result, anyhow};
use protocol::DeviceSpeed;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub transfers: TransferSettings,
    /// Devices attached to the simulated controller at startup
    #[serde(default)]
    pub devices: Vec<DeviceAttachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    #[serde(default = "HostSettings::default_log_level")]
    pub log_level: String,
    /// Capacity of the port event bridge
    #[serde(default = "HostSettings::default_event_queue_depth")]
    pub event_queue_depth: usize,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            event_queue_depth: Self::default_event_queue_depth(),
        }
    }
}

impl HostSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_event_queue_depth() -> usize {
        common::channel::DEFAULT_EVENT_QUEUE_DEPTH
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    #[serde(default = "ControllerSettings::default_max_ports")]
    pub max_ports: u8,
    #[serde(default = "ControllerSettings::default_max_slots")]
    pub max_slots: u8,
    /// Bandwidth the controller reports free on every port
    #[serde(default = "ControllerSettings::default_port_bandwidth")]
    pub port_bandwidth: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            max_ports: Self::default_max_ports(),
            max_slots: Self::default_max_slots(),
            port_bandwidth: Self::default_port_bandwidth(),
        }
    }
}

impl ControllerSettings {
    fn default_max_ports() -> u8 {
        4
    }

    fn default_max_slots() -> u8 {
        32
    }

    fn default_port_bandwidth() -> u64 {
        // One microframe's worth at high speed
        7500
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Bound on synchronous waits
    #[serde(default = "TransferSettings::default_timeout", with = "duration_serde")]
    pub default_timeout: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            default_timeout: Self::default_timeout(),
        }
    }
}

impl TransferSettings {
    fn default_timeout() -> Duration {
        Duration::from_secs(5)
    }
}

/// A device attached to a port at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAttachment {
    pub port: u8,
    pub speed: DeviceSpeed,
    /// Name to publish instead of the default `usb<addr>-<x>s`
    #[serde(default)]
    pub name: Option<String>,
}

/// Custom serde module for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format_duration(*duration).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string like "5s", "250ms", "1m30s"
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim().to_lowercase();
        let mut total_ms: u64 = 0;
        let mut current_num = String::new();
        let mut chars = s.chars().peekable();

        while let Some(c) = chars.next() {
            if c.is_ascii_digit() {
                current_num.push(c);
                continue;
            }
            if current_num.is_empty() {
                return Err(format!("Invalid duration format: {}", s));
            }
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            current_num.clear();

            let unit_ms = match c {
                'h' => 3_600_000,
                'm' if chars.peek() == Some(&'s') => {
                    chars.next();
                    1
                }
                'm' => 60_000,
                's' => 1000,
                _ => return Err(format!("Invalid duration unit: {}", c)),
            };
            total_ms = total_ms.saturating_add(num.saturating_mul(unit_ms));
        }

        // A bare number is seconds
        if !current_num.is_empty() {
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            total_ms = total_ms.saturating_add(num.saturating_mul(1000));
        }

        if total_ms == 0 {
            return Err("Duration must be greater than 0".to_string());
        }

        Ok(Duration::from_millis(total_ms))
    }

    pub fn format_duration(d: Duration) -> String {
        let total_ms = d.as_millis();
        if total_ms % 1000 != 0 {
            return format!("{}ms", total_ms);
        }

        let secs = d.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        let mut result = String::new();
        if hours > 0 {
            result.push_str(&format!("{}h", hours));
        }
        if mins > 0 {
            result.push_str(&format!("{}m", mins));
        }
        if secs > 0 || result.is_empty() {
            result.push_str(&format!("{}s", secs));
        }
        result
    }
}

pub use duration_serde::parse_duration;

impl HostConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/usb-host/host.toml")];

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
            config_dir.join("usb-host").join("host.toml")
        } else {
            PathBuf::from(".config/usb-host/host.toml")
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

        if self.host.event_queue_depth == 0 {
            return Err(anyhow!("event_queue_depth must be greater than 0"));
        }
        if self.controller.max_ports == 0 {
            return Err(anyhow!("max_ports must be greater than 0"));
        }
        if self.controller.max_slots == 0 {
            return Err(anyhow!("max_slots must be greater than 0"));
        }

        let mut ports = HashSet::new();
        for device in &self.devices {
            if device.port == 0 || device.port > self.controller.max_ports {
                return Err(anyhow!(
                    "Device port {} out of range, controller has ports 1-{}",
                    device.port,
                    self.controller.max_ports
                ));
            }
            if !ports.insert(device.port) {
                return Err(anyhow!("Port {} has more than one device", device.port));
            }
            if device.name.as_deref().is_some_and(str::is_empty) {
                return Err(anyhow!("Empty device name for port {}", device.port));
            }
        }

        Ok(())
    }
}

/// Load configuration from a path that may start with `~`
pub fn load_config(path: &str) -> Result<HostConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    HostConfig::load(Some(path_buf))
}
