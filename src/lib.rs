//! iSCSI volume attach, share and release
//!
//! This library attaches an iSCSI LUN to the host, mounts it once at a
//! canonical shared path, and bind-mounts that path into each consumer's
//! private directory with the consumer's own access mode. Teardown removes a
//! consumer's view and detaches the LUN once no other consumer references it.
//!
//! The mount table is the only durable state: every call re-reads it, so a
//! setup or teardown repeated after a crash converges instead of mounting or
//! detaching twice.
//!
//! # Example
//!
//! ```no_run
//! use iscsi_volume::{IscsiPlugin, IscsiVolumeSource, VolumeSpec};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let plugin = IscsiPlugin::builder().build()?;
//! let spec = VolumeSpec::iscsi(
//!     "data",
//!     IscsiVolumeSource {
//!         target_portal: "10.0.0.1:3260".to_string(),
//!         iqn: "iqn.2015-01.com.example:disk1".to_string(),
//!         lun: 0,
//!         fs_type: "ext4".to_string(),
//!         read_only: false,
//!     },
//! );
//!
//! if plugin.can_support(&spec) {
//!     let session = plugin.new_session(&spec, "3f1c9a2e-consumer")?;
//!     plugin.set_up(&session)?;
//!     // ... workload runs ...
//!     plugin.tear_down(&session)?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod disk;
pub mod error;
pub mod exec;
pub mod fake;
pub mod host;
pub mod iscsiadm;
pub mod lock;
pub mod mount;
pub mod mountinfo;
pub mod orchestrator;
pub mod plugin;
pub mod session;

pub use config::{PluginConfig, PluginConfigBuilder};
pub use device::DeviceIdentity;
pub use disk::DiskManager;
pub use error::{decode_iscsiadm_exit, VolumeError, VolumeResult};
pub use lock::DeviceLocks;
pub use mount::{MountOption, MountProbe, Mounter};
pub use orchestrator::{set_up, tear_down, Collaborators};
pub use plugin::{IscsiPlugin, IscsiPluginBuilder, PLUGIN_NAME};
pub use session::{AccessMode, IscsiVolumeSource, VolumeSession, VolumeSpec};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
