//! Link settings and the `.upytester.yml` project file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Timing and serial settings for one connection.
///
/// All durations are in milliseconds so the YAML stays readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Serial baud rate.
    pub baud_rate: u32,
    /// Read timeout of the link; also bounds how long the receiver keeps
    /// collecting diagnostic lines after a fault.
    pub read_timeout_ms: u64,
    /// How long the transmitter waits on an empty queue before checking for
    /// a halt request.
    pub write_timeout_ms: u64,
    /// How long to wait for an acknowledgement or a response.
    pub response_timeout_ms: u64,
    /// Poll interval of the workers.
    pub idle_poll_ms: u64,
    /// Enable the device heartbeat after opening, when the device offers one.
    pub heartbeat: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            baud_rate: 115_200,
            read_timeout_ms: 100,
            write_timeout_ms: 100,
            response_timeout_ms: 1000,
            idle_poll_ms: 1,
            heartbeat: false,
        }
    }
}

impl LinkConfig {
    /// Link read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Transmit queue poll timeout.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Acknowledgement and response timeout.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Worker poll interval (at least 1 ms).
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }
}

/// Per-device changes to the project's [`LinkConfig`]. Fields left out keep
/// the project value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkOverrides {
    /// Serial baud rate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baud_rate: Option<u32>,
    /// Link read timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_timeout_ms: Option<u64>,
    /// Transmit queue poll timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_timeout_ms: Option<u64>,
    /// Acknowledgement and response timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_timeout_ms: Option<u64>,
    /// Worker poll interval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_poll_ms: Option<u64>,
    /// Enable the heartbeat after opening.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<bool>,
}

impl LinkOverrides {
    /// True when nothing is overridden.
    pub fn is_empty(&self) -> bool {
        *self == LinkOverrides::default()
    }

    /// `base` with every present field replaced.
    pub fn apply(&self, base: &LinkConfig) -> LinkConfig {
        LinkConfig {
            baud_rate: self.baud_rate.unwrap_or(base.baud_rate),
            read_timeout_ms: self.read_timeout_ms.unwrap_or(base.read_timeout_ms),
            write_timeout_ms: self.write_timeout_ms.unwrap_or(base.write_timeout_ms),
            response_timeout_ms: self.response_timeout_ms.unwrap_or(base.response_timeout_ms),
            idle_poll_ms: self.idle_poll_ms.unwrap_or(base.idle_poll_ms),
            heartbeat: self.heartbeat.unwrap_or(base.heartbeat),
        }
    }
}

/// One configured device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// USB serial number of the board.
    pub serial: String,
    /// Per-device link overrides, merged field by field over the project's
    /// `link:` block.
    #[serde(default, skip_serializing_if = "LinkOverrides::is_empty")]
    pub link: LinkOverrides,
}

/// Contents of a `.upytester.yml` file.
///
/// ```yaml
/// devices:
///   pyboard:
///     serial: 3676345A3036
/// link:
///   response_timeout_ms: 2000
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Devices by name.
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceEntry>,
    /// Link settings shared by all devices.
    #[serde(default)]
    pub link: LinkConfig,
}

impl ProjectConfig {
    /// Project file name.
    pub const FILE_NAME: &'static str = ".upytester.yml";

    /// Parse YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Load a specific file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Candidate locations, in lookup order: `explicit`, the working
    /// directory, then the home directory.
    pub fn search_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(path) = explicit {
            paths.push(path.to_path_buf());
        }
        paths.push(PathBuf::from(Self::FILE_NAME));
        if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
            paths.push(PathBuf::from(home).join(Self::FILE_NAME));
        }
        paths
    }

    /// Load the first existing file from [`ProjectConfig::search_paths`].
    ///
    /// An explicit path that does not exist is an error rather than being
    /// skipped.
    pub fn discover(explicit: Option<&Path>) -> Result<(PathBuf, Self), ConfigError> {
        if let Some(path) = explicit {
            return Ok((path.to_path_buf(), Self::load(path)?));
        }
        let searched = Self::search_paths(None);
        for path in &searched {
            if path.is_file() {
                tracing::debug!("using configuration {}", path.display());
                return Ok((path.clone(), Self::load(path)?));
            }
        }
        Err(ConfigError::NotFound { searched })
    }

    /// The entry for a named device.
    pub fn device_entry(&self, name: &str) -> Result<&DeviceEntry, ConfigError> {
        self.devices
            .get(name)
            .ok_or_else(|| ConfigError::UnknownDevice(name.to_string()))
    }

    /// Effective link settings for a named device.
    pub fn link_for(&self, name: &str) -> Result<LinkConfig, ConfigError> {
        let entry = self.device_entry(name)?;
        Ok(entry.link.apply(&self.link))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.response_timeout(), Duration::from_secs(1));
        assert_eq!(config.idle_poll(), Duration::from_millis(1));
        assert!(!config.heartbeat);
    }

    #[test]
    fn test_parse_project_file() {
        let config = ProjectConfig::from_yaml(
            "devices:\n  pyboard:\n    serial: 3676345A3036\n  slow:\n    serial: ABC\n    link:\n      response_timeout_ms: 5000\nlink:\n  heartbeat: true\n",
        )
        .unwrap();
        assert_eq!(config.device_entry("pyboard").unwrap().serial, "3676345A3036");
        assert!(config.link.heartbeat);
        assert_eq!(config.link.baud_rate, 115_200);

        let slow = config.link_for("slow").unwrap();
        assert_eq!(slow.response_timeout_ms, 5000);
        assert!(config.link_for("pyboard").unwrap().heartbeat);
    }

    #[test]
    fn test_device_link_merges_over_project_link() {
        let config = ProjectConfig::from_yaml(
            "devices:\n  fast:\n    serial: F1\n    link:\n      baud_rate: 921600\nlink:\n  heartbeat: true\n  response_timeout_ms: 2500\n",
        )
        .unwrap();
        let fast = config.link_for("fast").unwrap();
        assert_eq!(fast.baud_rate, 921_600);
        assert!(fast.heartbeat);
        assert_eq!(fast.response_timeout_ms, 2500);
        assert_eq!(fast.read_timeout_ms, LinkConfig::default().read_timeout_ms);
    }

    #[test]
    fn test_unknown_device() {
        let config = ProjectConfig::default();
        assert!(matches!(
            config.device_entry("nope"),
            Err(ConfigError::UnknownDevice(_))
        ));
    }

    #[test]
    fn test_search_order() {
        let paths = ProjectConfig::search_paths(Some(Path::new("/tmp/custom.yml")));
        assert_eq!(paths[0], PathBuf::from("/tmp/custom.yml"));
        assert_eq!(paths[1], PathBuf::from(ProjectConfig::FILE_NAME));
    }

    #[test]
    fn test_missing_explicit_file() {
        let result = ProjectConfig::discover(Some(Path::new("/nonexistent/.upytester.yml")));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
