//! In-memory collaborators
//!
//! [`FakeMounter`] keeps its own mount table and [`FakeDiskManager`] tracks
//! attached devices. Both record every call so tests can assert on exactly
//! which operations a setup or teardown performed.

use crate::device::DeviceIdentity;
use crate::disk::{canonical_path_under, DiskManager};
use crate::error::{VolumeError, VolumeResult};
use crate::mount::{MountOption, MountProbe, Mounter};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// One row of the fake mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeMount {
    /// Device ultimately backing the mount; binds inherit it from their source
    pub device: PathBuf,
    pub target: PathBuf,
    pub fs_type: Option<String>,
    pub bind: bool,
    pub read_only: bool,
}

/// Call recorded by [`FakeMounter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountAction {
    Mount {
        source: PathBuf,
        target: PathBuf,
        fs_type: Option<String>,
        options: Vec<MountOption>,
    },
    Unmount {
        target: PathBuf,
    },
}

#[derive(Debug, Default)]
struct MountState {
    mounts: Vec<FakeMount>,
    log: Vec<MountAction>,
    fail_mount_at: Option<PathBuf>,
    fail_probe: bool,
}

impl MountState {
    fn top(&self, path: &Path) -> Option<&FakeMount> {
        self.mounts.iter().rev().find(|m| m.target == path)
    }

    fn top_mut(&mut self, path: &Path) -> Option<&mut FakeMount> {
        self.mounts.iter_mut().rev().find(|m| m.target == path)
    }
}

/// Mounter with an in-memory mount table
#[derive(Debug, Default)]
pub struct FakeMounter {
    state: Mutex<MountState>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a mount without recording an action, e.g. one left behind by
    /// a crashed process.
    pub fn add_mount(&self, device: &Path, target: &Path) {
        self.state.lock().mounts.push(FakeMount {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            fs_type: None,
            bind: false,
            read_only: false,
        });
    }

    /// Make every later mount call targeting `target` fail; `None` clears it.
    pub fn fail_mount_at(&self, target: Option<&Path>) {
        self.state.lock().fail_mount_at = target.map(Path::to_path_buf);
    }

    /// Make every later probe fail as if the mount table were unreadable.
    pub fn fail_probe(&self, fail: bool) {
        self.state.lock().fail_probe = fail;
    }

    pub fn mounts(&self) -> Vec<FakeMount> {
        self.state.lock().mounts.clone()
    }

    pub fn log(&self) -> Vec<MountAction> {
        self.state.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// Number of stacked mounts at `target`
    pub fn mount_count(&self, target: &Path) -> usize {
        self.state
            .lock()
            .mounts
            .iter()
            .filter(|m| m.target == target)
            .count()
    }

    /// Access mode of the topmost mount at `target`
    pub fn is_read_only(&self, target: &Path) -> Option<bool> {
        self.state.lock().top(target).map(|m| m.read_only)
    }

    fn check_probe(state: &MountState, path: &Path) -> VolumeResult<()> {
        if state.fail_probe {
            return Err(VolumeError::probe(path, "mount table unavailable"));
        }
        Ok(())
    }
}

impl MountProbe for FakeMounter {
    fn is_mount_point(&self, path: &Path) -> VolumeResult<bool> {
        let state = self.state.lock();
        Self::check_probe(&state, path)?;
        Ok(state.top(path).is_some())
    }

    fn list_mount_refs(&self, path: &Path) -> VolumeResult<Vec<PathBuf>> {
        let state = self.state.lock();
        Self::check_probe(&state, path)?;
        let Some(origin) = state.top(path) else {
            return Ok(Vec::new());
        };
        Ok(state
            .mounts
            .iter()
            .filter(|m| m.target != path && m.device == origin.device)
            .map(|m| m.target.clone())
            .collect())
    }

    fn device_at(&self, path: &Path) -> VolumeResult<Option<PathBuf>> {
        let state = self.state.lock();
        Self::check_probe(&state, path)?;
        Ok(state.top(path).map(|m| m.device.clone()))
    }
}

impl Mounter for FakeMounter {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: &[MountOption],
    ) -> VolumeResult<()> {
        let mut state = self.state.lock();
        state.log.push(MountAction::Mount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            fs_type: fs_type.map(str::to_string),
            options: options.to_vec(),
        });

        if state.fail_mount_at.as_deref() == Some(target) {
            return Err(VolumeError::mount("mount", target, "injected failure"));
        }

        let read_only = options.contains(&MountOption::ReadOnly);

        if options.contains(&MountOption::Remount) {
            let entry = state
                .top_mut(target)
                .ok_or_else(|| VolumeError::mount("remount", target, "not mounted"))?;
            entry.read_only = read_only;
            return Ok(());
        }

        let bind = options.contains(&MountOption::Bind);
        let device = if bind {
            state
                .top(source)
                .map(|m| m.device.clone())
                .ok_or_else(|| VolumeError::mount("bind", target, "bind source is not mounted"))?
        } else {
            source.to_path_buf()
        };

        state.mounts.push(FakeMount {
            device,
            target: target.to_path_buf(),
            fs_type: fs_type.map(str::to_string),
            bind,
            read_only,
        });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> VolumeResult<()> {
        let mut state = self.state.lock();
        state.log.push(MountAction::Unmount {
            target: target.to_path_buf(),
        });

        let index = state
            .mounts
            .iter()
            .rposition(|m| m.target == target)
            .ok_or_else(|| VolumeError::mount("unmount", target, "not mounted"))?;
        state.mounts.remove(index);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DiskState {
    attached: HashSet<DeviceIdentity>,
    attach_calls: Vec<DeviceIdentity>,
    detach_calls: Vec<(DeviceIdentity, Option<PathBuf>)>,
    fail_attach: Option<String>,
    fail_detach: Option<String>,
}

/// Disk manager tracking attachments in memory
#[derive(Debug)]
pub struct FakeDiskManager {
    shared_root: PathBuf,
    state: Mutex<DiskState>,
}

impl FakeDiskManager {
    /// Canonical shared paths are placed directly under `shared_root`.
    pub fn new(shared_root: impl Into<PathBuf>) -> Self {
        FakeDiskManager {
            shared_root: shared_root.into(),
            state: Mutex::new(DiskState::default()),
        }
    }

    /// Device node handed out for `device`
    pub fn node_for(device: &DeviceIdentity) -> PathBuf {
        Path::new("/dev/disk/by-path").join(device.by_path_name())
    }

    pub fn fail_attach(&self, reason: Option<&str>) {
        self.state.lock().fail_attach = reason.map(str::to_string);
    }

    pub fn fail_detach(&self, reason: Option<&str>) {
        self.state.lock().fail_detach = reason.map(str::to_string);
    }

    pub fn is_attached(&self, device: &DeviceIdentity) -> bool {
        self.state.lock().attached.contains(device)
    }

    pub fn attach_calls(&self) -> Vec<DeviceIdentity> {
        self.state.lock().attach_calls.clone()
    }

    pub fn detach_calls(&self) -> Vec<(DeviceIdentity, Option<PathBuf>)> {
        self.state.lock().detach_calls.clone()
    }
}

impl DiskManager for FakeDiskManager {
    fn attach(&self, device: &DeviceIdentity) -> VolumeResult<PathBuf> {
        let mut state = self.state.lock();
        state.attach_calls.push(device.clone());

        if let Some(reason) = state.fail_attach.clone() {
            return Err(VolumeError::Attach {
                portal: device.portal().to_string(),
                iqn: device.iqn().to_string(),
                reason,
            });
        }

        state.attached.insert(device.clone());
        Ok(Self::node_for(device))
    }

    fn detach(&self, device: &DeviceIdentity, device_path: Option<&Path>) -> VolumeResult<()> {
        let mut state = self.state.lock();
        state
            .detach_calls
            .push((device.clone(), device_path.map(Path::to_path_buf)));

        if let Some(reason) = state.fail_detach.clone() {
            return Err(VolumeError::Detach {
                portal: device.portal().to_string(),
                iqn: device.iqn().to_string(),
                reason,
            });
        }

        state.attached.remove(device);
        Ok(())
    }

    fn canonical_shared_path(&self, device: &DeviceIdentity) -> PathBuf {
        canonical_path_under(&self.shared_root, device)
    }
}
