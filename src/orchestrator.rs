//! Setup and teardown of a consumer's view of a shared iSCSI device
//!
//! Setup:
//!
//! 1. **CheckExisting** - a mounted consumer path means a previous call
//!    already succeeded; return.
//! 2. **EnsureSharedMount** - attach the device and mount it once at the
//!    canonical shared path unless something is already mounted there.
//! 3. **BindToConsumerPath** - bind the shared mount into the consumer path.
//! 4. **ApplyAccessMode** - remount the consumer view `ro` or `rw`.
//!
//! Teardown:
//!
//! 1. **UnmountConsumerPath** - nothing mounted means nothing to unmount;
//!    an unreferenced canonical directory left by an earlier failure is
//!    still released when the session names its device.
//! 2. **ReferenceCheck** - re-read the mount table; other consumers keep the
//!    device attached.
//! 3. **ReleaseSharedMount** - unmount the shared path, then detach.
//!
//! Steps 2-4 of setup and 1-3 of teardown run under the device's lock from
//! [`DeviceLocks`]. Nothing is rolled back on failure; the mount table is
//! re-read on every call, so a later setup or teardown picks up where a
//! failed one stopped.

use crate::device::DeviceIdentity;
use crate::disk::DiskManager;
use crate::error::{VolumeError, VolumeResult};
use crate::lock::DeviceLocks;
use crate::mount::{access_mode_options, MountOption, Mounter};
use crate::session::VolumeSession;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Collaborators injected into each setup/teardown call
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub manager: &'a dyn DiskManager,
    pub mounter: &'a dyn Mounter,
    pub locks: &'a DeviceLocks,
}

/// Make the session's device available at `consumer_path`.
pub fn set_up(session: &VolumeSession, consumer_path: &Path, env: Collaborators<'_>) -> VolumeResult<()> {
    if env.mounter.is_mount_point(consumer_path)? {
        log::debug!(
            "iscsi: {} already mounted, skipping setup",
            consumer_path.display()
        );
        return Ok(());
    }

    let device = session.device().ok_or_else(|| {
        VolumeError::InvalidArgument(format!(
            "setup of volume {} requires a device identity",
            session.volume_name()
        ))
    })?;

    let _guard = env.locks.lock(device);

    // A concurrent setup of the same consumer path may have won the lock
    if env.mounter.is_mount_point(consumer_path)? {
        return Ok(());
    }

    let shared = env.manager.canonical_shared_path(device);
    ensure_shared_mount(session, device, &shared, env)?;

    fs::create_dir_all(consumer_path).map_err(|e| VolumeError::mount("mkdir", consumer_path, e))?;
    env.mounter
        .mount(&shared, consumer_path, None, &[MountOption::Bind])?;
    log::debug!(
        "iscsi: bound {} to {}",
        shared.display(),
        consumer_path.display()
    );

    env.mounter.mount(
        &shared,
        consumer_path,
        None,
        &access_mode_options(session.read_only()),
    )?;

    log::info!(
        "iscsi: volume {} of {} ready at {} ({})",
        session.volume_name(),
        session.consumer_id(),
        consumer_path.display(),
        if session.read_only() { "ro" } else { "rw" }
    );
    Ok(())
}

fn ensure_shared_mount(
    session: &VolumeSession,
    device: &DeviceIdentity,
    shared: &Path,
    env: Collaborators<'_>,
) -> VolumeResult<()> {
    let node = env.manager.attach(device)?;

    if env.mounter.is_mount_point(shared)? {
        log::debug!("iscsi: shared mount {} already present", shared.display());
        return Ok(());
    }

    fs::create_dir_all(shared).map_err(|e| VolumeError::mount("mkdir", shared, e))?;
    env.mounter.mount(
        &node,
        shared,
        Some(session.fs_type()),
        &[MountOption::ReadWrite],
    )?;
    log::info!(
        "iscsi: mounted {} at {} as {}",
        node.display(),
        shared.display(),
        session.fs_type()
    );
    Ok(())
}

/// Remove the consumer's view and release the device once unreferenced.
pub fn tear_down(session: &VolumeSession, consumer_path: &Path, env: Collaborators<'_>) -> VolumeResult<()> {
    if !env.mounter.is_mount_point(consumer_path)? {
        log::debug!(
            "iscsi: {} not mounted, nothing to unmount",
            consumer_path.display()
        );
        remove_dir_if_present(consumer_path);
        return match session.device() {
            Some(device) => release_leftover(device, env),
            None => Ok(()),
        };
    }

    let device = match session.device() {
        Some(device) => Some(device.clone()),
        None => backing_device(consumer_path, env)?,
    };

    let Some(device) = device else {
        log::warn!(
            "iscsi: {} is not backed by a shared iSCSI mount, unmounting only",
            consumer_path.display()
        );
        env.mounter.unmount(consumer_path)?;
        remove_dir_if_present(consumer_path);
        return Ok(());
    };

    let _guard = env.locks.lock(&device);

    if !env.mounter.is_mount_point(consumer_path)? {
        remove_dir_if_present(consumer_path);
        return Ok(());
    }
    env.mounter.unmount(consumer_path)?;
    remove_dir_if_present(consumer_path);
    log::debug!("iscsi: unmounted {}", consumer_path.display());

    // Must observe the table after our own unmount
    let shared = env.manager.canonical_shared_path(&device);
    let refs = env.mounter.list_mount_refs(&shared)?;
    if !refs.is_empty() {
        log::info!(
            "iscsi: {} still referenced by {} mount(s), keeping {} attached",
            shared.display(),
            refs.len(),
            device
        );
        return Ok(());
    }

    release_shared_mount(&device, &shared, env)
}

fn release_shared_mount(device: &DeviceIdentity, shared: &Path, env: Collaborators<'_>) -> VolumeResult<()> {
    let device_path = env.mounter.device_at(shared)?;
    if device_path.is_some() {
        env.mounter.unmount(shared)?;
        log::info!("iscsi: unmounted shared mount {}", shared.display());
    }

    // The directory outlives a failed detach so a retried teardown finds it
    env.manager.detach(device, device_path.as_deref())?;
    remove_dir_if_present(shared);
    log::info!("iscsi: detached {}", device);
    Ok(())
}

/// Finish a release an earlier teardown or setup left behind.
///
/// An unreferenced canonical directory means the last consumer is gone but
/// the device may still be attached, e.g. after a failed detach.
fn release_leftover(device: &DeviceIdentity, env: Collaborators<'_>) -> VolumeResult<()> {
    let _guard = env.locks.lock(device);

    let shared = env.manager.canonical_shared_path(device);
    if !shared.is_dir() || !env.mounter.list_mount_refs(&shared)?.is_empty() {
        return Ok(());
    }

    log::info!(
        "iscsi: finishing release of {} left at {}",
        device,
        shared.display()
    );
    release_shared_mount(device, &shared, env)
}

/// Identify the device whose canonical mount backs `consumer_path`.
fn backing_device(consumer_path: &Path, env: Collaborators<'_>) -> VolumeResult<Option<DeviceIdentity>> {
    for candidate in env.mounter.list_mount_refs(consumer_path)? {
        let Some(name) = candidate.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Ok(device) = DeviceIdentity::from_canonical_name(name) {
            if same_location(&env.manager.canonical_shared_path(&device), &candidate) {
                return Ok(Some(device));
            }
        }
    }
    Ok(None)
}

// Mount points come back with symlinks resolved
fn same_location(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn remove_dir_if_present(path: &Path) {
    match fs::remove_dir(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => log::warn!("iscsi: could not remove {}: {}", path.display(), e),
    }
}
