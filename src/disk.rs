//! Disk manager contract
//!
//! A disk manager establishes and releases the remote session that makes a
//! LUN appear as a local block device, and decides where that device's
//! shared mount lives.

use crate::device::DeviceIdentity;
use crate::error::VolumeResult;
use std::path::{Path, PathBuf};

/// Attach/detach against a remote target
pub trait DiskManager: Send + Sync {
    /// Log in to the target if needed and return the local device node.
    ///
    /// Calling this for an already attached device returns the existing
    /// node without error.
    fn attach(&self, device: &DeviceIdentity) -> VolumeResult<PathBuf>;

    /// Log out of the target.
    ///
    /// Idempotent: detaching a device that is no longer attached is a no-op.
    /// `device_path` is the node that backed the shared mount when it is
    /// still known.
    fn detach(&self, device: &DeviceIdentity, device_path: Option<&Path>) -> VolumeResult<()>;

    /// Deterministic shared mount path for `device`. No I/O.
    fn canonical_shared_path(&self, device: &DeviceIdentity) -> PathBuf;
}

/// Canonical path layout shared by every disk manager: `<root>/<canonical name>`
pub fn canonical_path_under(root: &Path, device: &DeviceIdentity) -> PathBuf {
    root.join(device.canonical_name())
}
