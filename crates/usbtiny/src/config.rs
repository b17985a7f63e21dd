//! Daemon configuration management

use crate::driver::registrar::{MAX_USB_MINORS, USBTINY_MINOR_BASE};
use anyhow::{Context, Result, anyhow};
use common::DeviceIdentity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub driver: DriverSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "DaemonSettings::default_log_level")]
    pub log_level: String,
    /// Print the emitting module with each log line
    #[serde(default)]
    pub log_targets: bool,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            log_targets: false,
        }
    }
}

impl DaemonSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

/// Driver settings
///
/// # Example Configuration
/// ```toml
/// [driver]
/// minor_base = 192
/// minor_count = 64
/// node_dir = "/run/usbtiny"
/// extra_ids = ["0x16c0:0x05dc"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSettings {
    /// First minor of the reserved range
    #[serde(default = "DriverSettings::default_minor_base")]
    pub minor_base: u8,
    /// Number of minors reserved from `minor_base`
    #[serde(default = "DriverSettings::default_minor_count")]
    pub minor_count: u16,
    /// Directory where node descriptors are published (None = not published)
    #[serde(default)]
    pub node_dir: Option<PathBuf>,
    /// Bytes reserved per device for control transfers
    #[serde(default = "DriverSettings::default_control_buffer_size")]
    pub control_buffer_size: usize,
    /// Additional exact identities to claim, "0xVVVV:0xPPPP"
    #[serde(default)]
    pub extra_ids: Vec<String>,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            minor_base: Self::default_minor_base(),
            minor_count: Self::default_minor_count(),
            node_dir: None,
            control_buffer_size: Self::default_control_buffer_size(),
            extra_ids: Vec::new(),
        }
    }
}

impl DriverSettings {
    fn default_minor_base() -> u8 {
        USBTINY_MINOR_BASE
    }

    fn default_minor_count() -> u16 {
        MAX_USB_MINORS - USBTINY_MINOR_BASE as u16
    }

    fn default_control_buffer_size() -> usize {
        64
    }

    /// Node directory with `~` expanded
    pub fn resolved_node_dir(&self) -> Option<PathBuf> {
        self.node_dir
            .as_ref()
            .map(|p| PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Rescan interval when libusb has no hot-plug support
    #[serde(default = "UsbSettings::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on one libusb event-loop wait
    #[serde(default = "UsbSettings::default_event_timeout_ms")]
    pub event_timeout_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::default_poll_interval_ms(),
            event_timeout_ms: Self::default_event_timeout_ms(),
        }
    }
}

impl UsbSettings {
    fn default_poll_interval_ms() -> u64 {
        1000
    }

    fn default_event_timeout_ms() -> u64 {
        100
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }
}

impl DaemonConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbtiny-hotplug/daemon.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
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
            config_dir.join("usbtiny-hotplug").join("daemon.toml")
        } else {
            PathBuf::from(".config/usbtiny-hotplug/daemon.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.daemon.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.daemon.log_level,
                valid_levels.join(", ")
            ));
        }

        let driver = &self.driver;
        if driver.minor_count == 0 {
            return Err(anyhow!("minor_count must be at least 1"));
        }
        let end = (driver.minor_base as u16).saturating_add(driver.minor_count);
        if end > MAX_USB_MINORS {
            return Err(anyhow!(
                "Minor range {}..{} exceeds the {} USB minors",
                driver.minor_base,
                end,
                MAX_USB_MINORS
            ));
        }

        for id in &driver.extra_ids {
            Self::validate_id(id)?;
        }

        if self.usb.event_timeout_ms == 0 {
            return Err(anyhow!("event_timeout_ms must be greater than 0"));
        }
        if self.usb.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be greater than 0"));
        }

        Ok(())
    }

    /// Validate an exact device identity (VID:PID, no wildcards)
    fn validate_id(id: &str) -> Result<()> {
        if id.contains('*') {
            return Err(anyhow!(
                "Invalid device id '{}', wildcards are not supported",
                id
            ));
        }
        DeviceIdentity::parse(id).map(|_| ()).ok_or_else(|| {
            anyhow!(
                "Invalid device id '{}', expected VID:PID (e.g., '0x1781:0x0c9f')",
                id
            )
        })
    }
}
