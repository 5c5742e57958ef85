//! Configuration file loading and management
//!
//! This module handles loading and parsing the plugin configuration from
//! `$XDG_CONFIG_HOME/generic-device-plugin/config.toml`, or from the path in
//! `GENERIC_DEVICE_PLUGIN_CONFIG`. If the configuration file doesn't exist, a
//! default configuration is created with documented comments.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::discovery::{PathGroup, ResourceSpec};

/// Environment variable overriding the configuration file location
pub const CONFIG_ENV: &str = "GENERIC_DEVICE_PLUGIN_CONFIG";

/// Main plugin configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Daemon-specific configuration
    pub daemon: DaemonConfig,
    /// Device classes to advertise
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    /// Domain prefixed to every resource name
    /// Default: "device-plugin.io"
    pub domain: String,
    /// Directory holding the resource manager's plugin sockets. The plugin
    /// core never touches it; the registration transport that serves the
    /// socket reads it from here.
    /// Default: "/var/lib/kubelet/device-plugins"
    pub plugin_directory: PathBuf,
    /// Log level (trace, debug, info, warn, error)
    /// Default: "info"
    pub log_level: String,
}

/// One device class
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Resource name, without the domain
    pub name: String,
    /// Path groups making up the devices of this class
    pub groups: Vec<GroupConfig>,
}

/// One path group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupConfig {
    /// Glob patterns, matched positionally
    pub paths: Vec<String>,
    /// Instances advertised per matched device
    /// Default: 1
    #[serde(default = "default_count")]
    pub count: u32,
}

fn default_count() -> u32 {
    1
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            domain: "device-plugin.io".to_string(),
            plugin_directory: PathBuf::from("/var/lib/kubelet/device-plugins"),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the specified path
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    /// The parsed configuration or an error if loading/parsing fails
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `GENERIC_DEVICE_PLUGIN_CONFIG` or the default
    /// XDG config location
    ///
    /// If the default configuration file doesn't exist, creates one with
    /// documented comments.
    pub fn load_default() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(path);
        }

        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_file(&config_path)?;
        }

        Self::load(&config_path)
    }

    /// Get the default configuration file path
    ///
    /// Returns `$XDG_CONFIG_HOME/generic-device-plugin/config.toml`
    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "generic-device-plugin")
            .context("Failed to determine project directories")?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Create a default configuration file with documented comments
    fn create_default_file(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, Self::default_config_content())
            .with_context(|| format!("Failed to write default config file: {}", path.display()))?;

        tracing::info!("Created default configuration file at: {}", path.display());
        Ok(())
    }

    /// Generate the default configuration file content with comments
    fn default_config_content() -> String {
        r#"# Generic Device Plugin Configuration

[daemon]
# Domain prefixed to every resource name: <domain>/<device name>
# Default: "device-plugin.io"
domain = "device-plugin.io"

# Directory holding the resource manager's plugin sockets
# Default: "/var/lib/kubelet/device-plugins"
plugin_directory = "/var/lib/kubelet/device-plugins"

# Log level: trace, debug, info, warn, error
# Default: "info"
log_level = "info"

# Device classes
# Each device class has a name and one or more path groups:
# - paths: glob patterns; the n-th match of every pattern forms the n-th device
# - count: instances advertised per device (default: 1)

# Example: USB serial adapters, each usable by one container
[[devices]]
name = "serial"

[[devices.groups]]
paths = ["/dev/ttyUSB*"]

# Example: a device made of a character device and its sysfs node,
# shared by up to four containers
# [[devices]]
# name = "fpga"
#
# [[devices.groups]]
# paths = ["/dev/fpga*", "/sys/class/fpga_manager/fpga*"]
# count = 4
"#
        .to_string()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.daemon.log_level.as_str()) {
            anyhow::bail!(
                "Invalid log_level: {}. Must be one of: {}",
                self.daemon.log_level,
                valid_log_levels.join(", ")
            );
        }

        if self.daemon.domain.trim().is_empty() {
            anyhow::bail!("daemon.domain must not be empty");
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                anyhow::bail!("Device name must not be empty");
            }
            if device.name.contains('/') {
                anyhow::bail!("Device '{}': name must not contain '/'", device.name);
            }
            if !names.insert(device.name.as_str()) {
                anyhow::bail!("Device '{}' is configured more than once", device.name);
            }
            if device.groups.is_empty() {
                anyhow::bail!("Device '{}': at least one group is required", device.name);
            }

            for group in &device.groups {
                if group.paths.is_empty() {
                    anyhow::bail!("Device '{}': group has no paths", device.name);
                }
                if group.count == 0 {
                    anyhow::bail!("Device '{}': count must be greater than 0", device.name);
                }
                for path in &group.paths {
                    glob::Pattern::new(path).with_context(|| {
                        format!("Device '{}': invalid path pattern: {}", device.name, path)
                    })?;
                }
            }
        }

        Ok(())
    }

    /// Fully qualified resource name of a device class
    pub fn resource_name(&self, device: &DeviceConfig) -> String {
        format!("{}/{}", self.daemon.domain, device.name)
    }

    /// Resource specifications for every configured device class
    pub fn resource_specs(&self) -> Vec<ResourceSpec> {
        self.devices
            .iter()
            .map(|device| ResourceSpec {
                resource: self.resource_name(device),
                groups: device
                    .groups
                    .iter()
                    .map(|g| PathGroup::new(g.paths.iter().cloned(), g.count))
                    .collect(),
            })
            .collect()
    }
}
