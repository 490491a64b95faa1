//! Host directory conventions
//!
//! The host decides where plugin state and per-consumer volume directories
//! live. [`HostLayout`] provides the conventional layout below one root.

use std::path::{Path, PathBuf};

/// Paths supplied by the host environment
pub trait VolumeHost: Send + Sync {
    /// Directory owned by the named plugin
    fn plugin_dir(&self, plugin_name: &str) -> PathBuf;

    /// Consumer-private directory for one volume of one consumer
    fn consumer_volume_dir(&self, consumer_id: &str, plugin_name: &str, volume_name: &str) -> PathBuf;
}

/// `<root>/plugins/<plugin>` and `<root>/pods/<consumer>/volumes/<plugin>/<volume>`
#[derive(Debug, Clone)]
pub struct HostLayout {
    root: PathBuf,
}

impl HostLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        HostLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl VolumeHost for HostLayout {
    fn plugin_dir(&self, plugin_name: &str) -> PathBuf {
        self.root
            .join("plugins")
            .join(escape_qualified_name(plugin_name))
    }

    fn consumer_volume_dir(&self, consumer_id: &str, plugin_name: &str, volume_name: &str) -> PathBuf {
        self.root
            .join("pods")
            .join(consumer_id)
            .join("volumes")
            .join(escape_qualified_name(plugin_name))
            .join(volume_name)
    }
}

/// Make a qualified name (`vendor.io/name`) usable as one path component.
pub fn escape_qualified_name(name: &str) -> String {
    name.replace('/', "~")
}
