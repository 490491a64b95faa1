//! iSCSI volume plugin
//!
//! Wires configuration, host paths and collaborators together and exposes
//! the setup/teardown entry points the orchestrator calls per consumer.

use crate::config::PluginConfig;
use crate::device::DeviceIdentity;
use crate::disk::DiskManager;
use crate::error::{VolumeError, VolumeResult};
use crate::exec::{CommandRunner, SystemRunner};
use crate::host::{HostLayout, VolumeHost};
use crate::iscsiadm::IscsiAdm;
use crate::lock::DeviceLocks;
use crate::mount::Mounter;
use crate::orchestrator::{self, Collaborators};
use crate::session::{AccessMode, VolumeSession, VolumeSpec};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Qualified plugin name
pub const PLUGIN_NAME: &str = "kubernetes.io/iscsi";

const ACCESS_MODES: [AccessMode; 2] = [AccessMode::ReadWriteOnce, AccessMode::ReadOnlyMany];

/// iSCSI volume plugin
pub struct IscsiPlugin {
    config: PluginConfig,
    host: Arc<dyn VolumeHost>,
    manager: Arc<dyn DiskManager>,
    mounter: Arc<dyn Mounter>,
    runner: Arc<dyn CommandRunner>,
    locks: DeviceLocks,
}

impl IscsiPlugin {
    /// Create a new builder for configuring the plugin
    pub fn builder() -> IscsiPluginBuilder {
        IscsiPluginBuilder::default()
    }

    pub fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    pub fn access_modes(&self) -> &'static [AccessMode] {
        &ACCESS_MODES
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Whether this plugin handles `spec` on this host.
    ///
    /// A host without the attach tool cannot serve iSCSI volumes; that is a
    /// negative answer, not an error.
    pub fn can_support(&self, spec: &VolumeSpec) -> bool {
        spec.iscsi.is_some() && self.runner.locate(self.config.attach_tool()).is_some()
    }

    /// Like [`can_support`](Self::can_support) for the host alone, as an error.
    pub fn ensure_supported(&self) -> VolumeResult<()> {
        match self.runner.locate(self.config.attach_tool()) {
            Some(path) => {
                log::debug!("iscsi: using {}", path.display());
                Ok(())
            }
            None => Err(VolumeError::UnsupportedEnvironment {
                tool: self.config.attach_tool().to_string(),
            }),
        }
    }

    /// Build the setup session for one consumer of `spec`.
    pub fn new_session(&self, spec: &VolumeSpec, consumer_id: &str) -> VolumeResult<VolumeSession> {
        let source = spec.iscsi.as_ref().ok_or_else(|| {
            VolumeError::InvalidArgument(format!("volume {} has no iSCSI source", spec.name))
        })?;

        let device = DeviceIdentity::new(&source.target_portal, &source.iqn, source.lun)?;
        let fs_type = if source.fs_type.trim().is_empty() {
            self.config.default_fs_type()
        } else {
            source.fs_type.as_str()
        };

        VolumeSession::for_setup(consumer_id, &spec.name, device, source.read_only, fs_type)
    }

    /// Build a teardown session knowing only the volume's name.
    pub fn session_for_teardown(&self, volume_name: &str, consumer_id: &str) -> VolumeResult<VolumeSession> {
        VolumeSession::for_teardown(consumer_id, volume_name)
    }

    /// Consumer-private path of `session`
    pub fn volume_path(&self, session: &VolumeSession) -> PathBuf {
        self.host
            .consumer_volume_dir(session.consumer_id(), PLUGIN_NAME, session.volume_name())
    }

    pub fn set_up(&self, session: &VolumeSession) -> VolumeResult<()> {
        self.set_up_at(session, &self.volume_path(session))
    }

    pub fn set_up_at(&self, session: &VolumeSession, dir: &Path) -> VolumeResult<()> {
        self.ensure_supported()?;
        orchestrator::set_up(session, dir, self.collaborators()).map_err(|e| {
            log::error!("iscsi: failed to set up {}: {}", dir.display(), e);
            e
        })
    }

    /// Unmount the consumer's view; detach the disk only when it was the
    /// last reference to it on this host.
    pub fn tear_down(&self, session: &VolumeSession) -> VolumeResult<()> {
        self.tear_down_at(session, &self.volume_path(session))
    }

    pub fn tear_down_at(&self, session: &VolumeSession, dir: &Path) -> VolumeResult<()> {
        orchestrator::tear_down(session, dir, self.collaborators()).map_err(|e| {
            log::error!("iscsi: failed to tear down {}: {}", dir.display(), e);
            e
        })
    }

    fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            manager: self.manager.as_ref(),
            mounter: self.mounter.as_ref(),
            locks: &self.locks,
        }
    }
}

/// Builder for [`IscsiPlugin`]; unset collaborators get the real implementations.
#[derive(Default)]
pub struct IscsiPluginBuilder {
    config: Option<PluginConfig>,
    host: Option<Arc<dyn VolumeHost>>,
    manager: Option<Arc<dyn DiskManager>>,
    mounter: Option<Arc<dyn Mounter>>,
    runner: Option<Arc<dyn CommandRunner>>,
}

impl IscsiPluginBuilder {
    pub fn config(mut self, config: PluginConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Host path conventions (default: [`HostLayout`] under the configured root)
    pub fn host(mut self, host: Arc<dyn VolumeHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Disk manager (default: [`IscsiAdm`])
    pub fn disk_manager(mut self, manager: Arc<dyn DiskManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Mounter (default: `SystemMounter` on Linux)
    pub fn mounter(mut self, mounter: Arc<dyn Mounter>) -> Self {
        self.mounter = Some(mounter);
        self
    }

    /// Command runner used for the capability probe and by the default disk manager
    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn build(self) -> VolumeResult<IscsiPlugin> {
        let config = match self.config {
            Some(config) => config,
            None => PluginConfig::builder().build()?,
        };
        let host = self
            .host
            .unwrap_or_else(|| Arc::new(HostLayout::new(config.root_dir())));
        let runner = self.runner.unwrap_or_else(|| Arc::new(SystemRunner));
        let manager = self.manager.unwrap_or_else(|| {
            Arc::new(IscsiAdm::new(
                &config,
                &host.plugin_dir(PLUGIN_NAME),
                runner.clone(),
            ))
        });
        let mounter = match self.mounter {
            Some(mounter) => mounter,
            None => default_mounter()?,
        };

        Ok(IscsiPlugin {
            config,
            host,
            manager,
            mounter,
            runner,
            locks: DeviceLocks::new(),
        })
    }
}

#[cfg(target_os = "linux")]
fn default_mounter() -> VolumeResult<Arc<dyn Mounter>> {
    Ok(Arc::new(crate::mount::SystemMounter::new()))
}

#[cfg(not(target_os = "linux"))]
fn default_mounter() -> VolumeResult<Arc<dyn Mounter>> {
    Err(VolumeError::Config(
        "no system mounter on this platform; supply one with IscsiPluginBuilder::mounter".to_string(),
    ))
}
