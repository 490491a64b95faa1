//! Per-consumer volume session
//!
//! A [`VolumeSession`] is built for one setup or teardown call and dropped
//! when the call returns. Nothing here is persisted; the mount table is the
//! only durable state.

use crate::device::DeviceIdentity;
use crate::error::{VolumeError, VolumeResult};

/// Access modes an iSCSI volume can be offered with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Mounted read-write by a single node
    ReadWriteOnce,
    /// Mounted read-only by many consumers
    ReadOnlyMany,
}

/// iSCSI volume source as declared by the workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiVolumeSource {
    /// Portal address, `host` or `host:port`
    pub target_portal: String,
    /// Target name (IQN)
    pub iqn: String,
    /// Logical unit number
    pub lun: u32,
    /// Filesystem type; empty selects the configured default
    pub fs_type: String,
    pub read_only: bool,
}

/// Named volume declaration; `iscsi` is `None` for other volume types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub iscsi: Option<IscsiVolumeSource>,
}

impl VolumeSpec {
    pub fn iscsi(name: &str, source: IscsiVolumeSource) -> Self {
        VolumeSpec {
            name: name.to_string(),
            iscsi: Some(source),
        }
    }
}

/// State driving one setup or teardown sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSession {
    consumer_id: String,
    volume_name: String,
    device: Option<DeviceIdentity>,
    read_only: bool,
    fs_type: String,
}

impl VolumeSession {
    /// Session for setup; the device identity is mandatory.
    pub fn for_setup(
        consumer_id: &str,
        volume_name: &str,
        device: DeviceIdentity,
        read_only: bool,
        fs_type: &str,
    ) -> VolumeResult<Self> {
        validate_component("consumer id", consumer_id)?;
        validate_component("volume name", volume_name)?;
        if fs_type.trim().is_empty() {
            return Err(VolumeError::InvalidArgument(
                "filesystem type must not be empty".to_string(),
            ));
        }

        Ok(VolumeSession {
            consumer_id: consumer_id.to_string(),
            volume_name: volume_name.to_string(),
            device: Some(device),
            read_only,
            fs_type: fs_type.to_string(),
        })
    }

    /// Session for teardown by volume name. The device identity is recovered
    /// from the mount table when the teardown runs.
    pub fn for_teardown(consumer_id: &str, volume_name: &str) -> VolumeResult<Self> {
        validate_component("consumer id", consumer_id)?;
        validate_component("volume name", volume_name)?;

        Ok(VolumeSession {
            consumer_id: consumer_id.to_string(),
            volume_name: volume_name.to_string(),
            device: None,
            read_only: false,
            fs_type: String::new(),
        })
    }

    /// Attach a known device identity to a teardown session, skipping the
    /// mount-table lookup.
    pub fn with_device(mut self, device: DeviceIdentity) -> Self {
        self.device = Some(device);
        self
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn volume_name(&self) -> &str {
        &self.volume_name
    }

    pub fn device(&self) -> Option<&DeviceIdentity> {
        self.device.as_ref()
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn fs_type(&self) -> &str {
        &self.fs_type
    }
}

// Both values become path components under the host root
fn validate_component(what: &str, value: &str) -> VolumeResult<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains('/') || value.contains('\0') {
        return Err(VolumeError::InvalidArgument(format!(
            "{} {:?} is not a valid path component",
            what, value
        )));
    }
    Ok(())
}
