//! Mount probe and mount primitives
//!
//! [`MountProbe`] reads the mount table, [`Mounter`] changes it. The
//! orchestrators only see these traits, so tests substitute the in-memory
//! fake from [`crate::fake`].

use crate::error::VolumeResult;
use std::fmt;
use std::path::{Path, PathBuf};

/// Read access to the mount table
pub trait MountProbe: Send + Sync {
    /// Whether `path` is currently a mount point.
    ///
    /// "Not a mount point" is `Ok(false)`; errors are reserved for failures
    /// reading the mount table.
    fn is_mount_point(&self, path: &Path) -> VolumeResult<bool>;

    /// Every other mount point sharing the filesystem mounted at `path`.
    fn list_mount_refs(&self, path: &Path) -> VolumeResult<Vec<PathBuf>>;

    /// Source device of the mount at `path`
    fn device_at(&self, path: &Path) -> VolumeResult<Option<PathBuf>>;
}

/// Mount options understood by [`Mounter::mount`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOption {
    Bind,
    Remount,
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for MountOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MountOption::Bind => "bind",
            MountOption::Remount => "remount",
            MountOption::ReadOnly => "ro",
            MountOption::ReadWrite => "rw",
        };
        f.write_str(name)
    }
}

/// Access-mode remount options for a consumer mount
pub fn access_mode_options(read_only: bool) -> [MountOption; 2] {
    if read_only {
        [MountOption::Remount, MountOption::ReadOnly]
    } else {
        [MountOption::Remount, MountOption::ReadWrite]
    }
}

/// Mount table mutation
pub trait Mounter: MountProbe {
    /// `mount(source, target, fs_type, options)`; remounts ignore `source`.
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: &[MountOption],
    ) -> VolumeResult<()>;

    fn unmount(&self, target: &Path) -> VolumeResult<()>;
}

#[cfg(target_os = "linux")]
pub use linux::SystemMounter;

#[cfg(target_os = "linux")]
mod linux {
    use super::{MountOption, MountProbe, Mounter};
    use crate::error::{VolumeError, VolumeResult};
    use crate::mountinfo::MountTable;
    use nix::mount::{mount, umount2, MntFlags, MsFlags};
    use std::path::{Path, PathBuf};

    /// Mounter backed by mount(2) and `/proc/self/mountinfo`.
    ///
    /// Requires CAP_SYS_ADMIN.
    #[derive(Debug, Default, Clone)]
    pub struct SystemMounter;

    impl SystemMounter {
        pub fn new() -> Self {
            SystemMounter
        }
    }

    fn operation_name(options: &[MountOption]) -> &'static str {
        if options.contains(&MountOption::Remount) {
            "remount"
        } else if options.contains(&MountOption::Bind) {
            "bind"
        } else {
            "mount"
        }
    }

    fn flags_for(options: &[MountOption]) -> MsFlags {
        let mut flags = MsFlags::empty();
        for option in options {
            match option {
                MountOption::Bind => flags |= MsFlags::MS_BIND,
                MountOption::Remount => flags |= MsFlags::MS_REMOUNT,
                MountOption::ReadOnly => flags |= MsFlags::MS_RDONLY,
                MountOption::ReadWrite => flags &= !MsFlags::MS_RDONLY,
            }
        }
        // Per-mount-point flags of a bind view only change with MS_BIND set
        if flags.contains(MsFlags::MS_REMOUNT) {
            flags |= MsFlags::MS_BIND;
        }
        flags
    }

    impl MountProbe for SystemMounter {
        fn is_mount_point(&self, path: &Path) -> VolumeResult<bool> {
            Ok(MountTable::load()?.is_mount_point(path))
        }

        fn list_mount_refs(&self, path: &Path) -> VolumeResult<Vec<PathBuf>> {
            Ok(MountTable::load()?.refs_of(path))
        }

        fn device_at(&self, path: &Path) -> VolumeResult<Option<PathBuf>> {
            Ok(MountTable::load()?
                .find(path)
                .map(|entry| PathBuf::from(&entry.source)))
        }
    }

    impl Mounter for SystemMounter {
        fn mount(
            &self,
            source: &Path,
            target: &Path,
            fs_type: Option<&str>,
            options: &[MountOption],
        ) -> VolumeResult<()> {
            let flags = flags_for(options);
            let source = if flags.contains(MsFlags::MS_REMOUNT) {
                None
            } else {
                Some(source)
            };

            log::debug!(
                "mount {:?} -> {} type={:?} options={:?}",
                source,
                target.display(),
                fs_type,
                options
            );

            mount(source, target, fs_type, flags, None::<&str>)
                .map_err(|e| VolumeError::mount(operation_name(options), target, e))
        }

        fn unmount(&self, target: &Path) -> VolumeResult<()> {
            log::debug!("umount {}", target.display());
            umount2(target, MntFlags::empty()).map_err(|e| VolumeError::mount("unmount", target, e))
        }
    }

}
