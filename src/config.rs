//! Plugin configuration
//!
//! Built with [`PluginConfig::builder`]; every setting has a default that
//! matches a stock Linux node.

use crate::error::{VolumeError, VolumeResult};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings shared by the plugin and the iscsiadm disk manager
#[derive(Debug, Clone)]
pub struct PluginConfig {
    root_dir: PathBuf,
    attach_tool: String,
    default_fs_type: String,
    by_path_dir: PathBuf,
    device_wait_attempts: u32,
    device_wait_interval: Duration,
}

impl PluginConfig {
    pub fn builder() -> PluginConfigBuilder {
        PluginConfigBuilder::default()
    }

    /// Host root holding plugin and consumer directories
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn attach_tool(&self) -> &str {
        &self.attach_tool
    }

    pub fn default_fs_type(&self) -> &str {
        &self.default_fs_type
    }

    /// Directory of udev's stable by-path device links
    pub fn by_path_dir(&self) -> &Path {
        &self.by_path_dir
    }

    pub fn device_wait_attempts(&self) -> u32 {
        self.device_wait_attempts
    }

    pub fn device_wait_interval(&self) -> Duration {
        self.device_wait_interval
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        PluginConfig {
            root_dir: PathBuf::from("/var/lib/kubelet"),
            attach_tool: "iscsiadm".to_string(),
            default_fs_type: "ext4".to_string(),
            by_path_dir: PathBuf::from("/dev/disk/by-path"),
            device_wait_attempts: 10,
            device_wait_interval: Duration::from_secs(1),
        }
    }
}

/// Builder for [`PluginConfig`]
#[derive(Debug, Default)]
pub struct PluginConfigBuilder {
    root_dir: Option<PathBuf>,
    attach_tool: Option<String>,
    default_fs_type: Option<String>,
    by_path_dir: Option<PathBuf>,
    device_wait_attempts: Option<u32>,
    device_wait_interval: Option<Duration>,
}

impl PluginConfigBuilder {
    /// Set the host root directory (default: /var/lib/kubelet)
    pub fn root_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(dir.into());
        self
    }

    /// Set the attach tool name or path (default: iscsiadm)
    pub fn attach_tool(mut self, tool: &str) -> Self {
        self.attach_tool = Some(tool.to_string());
        self
    }

    /// Filesystem used when a volume does not name one (default: ext4)
    pub fn default_fs_type(mut self, fs_type: &str) -> Self {
        self.default_fs_type = Some(fs_type.to_string());
        self
    }

    pub fn by_path_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.by_path_dir = Some(dir.into());
        self
    }

    /// How many times to look for the device node after login (default: 10)
    pub fn device_wait_attempts(mut self, attempts: u32) -> Self {
        self.device_wait_attempts = Some(attempts);
        self
    }

    /// Pause between device node lookups (default: 1s)
    pub fn device_wait_interval(mut self, interval: Duration) -> Self {
        self.device_wait_interval = Some(interval);
        self
    }

    pub fn build(self) -> VolumeResult<PluginConfig> {
        let defaults = PluginConfig::default();
        let config = PluginConfig {
            root_dir: self.root_dir.unwrap_or(defaults.root_dir),
            attach_tool: self.attach_tool.unwrap_or(defaults.attach_tool),
            default_fs_type: self.default_fs_type.unwrap_or(defaults.default_fs_type),
            by_path_dir: self.by_path_dir.unwrap_or(defaults.by_path_dir),
            device_wait_attempts: self.device_wait_attempts.unwrap_or(defaults.device_wait_attempts),
            device_wait_interval: self.device_wait_interval.unwrap_or(defaults.device_wait_interval),
        };

        if !config.root_dir.is_absolute() {
            return Err(VolumeError::Config(format!(
                "root_dir must be absolute, got {}",
                config.root_dir.display()
            )));
        }
        if !config.by_path_dir.is_absolute() {
            return Err(VolumeError::Config(format!(
                "by_path_dir must be absolute, got {}",
                config.by_path_dir.display()
            )));
        }
        if config.attach_tool.trim().is_empty() {
            return Err(VolumeError::Config("attach_tool must not be empty".to_string()));
        }
        if config.default_fs_type.trim().is_empty() {
            return Err(VolumeError::Config("default_fs_type must not be empty".to_string()));
        }
        if config.device_wait_attempts == 0 {
            return Err(VolumeError::Config(
                "device_wait_attempts must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }
}
