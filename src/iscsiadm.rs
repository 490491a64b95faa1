//! Disk manager driving open-iscsi's `iscsiadm`
//!
//! Attach performs SendTargets discovery and a node login, then waits for
//! udev to publish the stable link `/dev/disk/by-path/ip-<portal>-iscsi-<iqn>-lun-<lun>`.
//! Detach logs the node out unless another LUN of the same target session
//! is still mounted.

use crate::config::PluginConfig;
use crate::device::DeviceIdentity;
use crate::disk::{canonical_path_under, DiskManager};
use crate::error::{decode_iscsiadm_exit, exit_code, VolumeError, VolumeResult};
use crate::exec::{CommandOutput, CommandRunner};
use crate::mountinfo::{MountTable, PROC_MOUNTINFO};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// [`DiskManager`] backed by the iscsiadm command line tool
pub struct IscsiAdm {
    tool: String,
    shared_root: PathBuf,
    by_path_dir: PathBuf,
    mountinfo: PathBuf,
    wait_attempts: u32,
    wait_interval: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl IscsiAdm {
    /// Shared mounts are placed under `<plugin_dir>/iscsi`.
    pub fn new(config: &PluginConfig, plugin_dir: &Path, runner: Arc<dyn CommandRunner>) -> Self {
        IscsiAdm {
            tool: config.attach_tool().to_string(),
            shared_root: plugin_dir.join("iscsi"),
            by_path_dir: config.by_path_dir().to_path_buf(),
            mountinfo: PathBuf::from(PROC_MOUNTINFO),
            wait_attempts: config.device_wait_attempts(),
            wait_interval: config.device_wait_interval(),
            runner,
        }
    }

    /// Read mounts from another mountinfo file instead of the process's own.
    pub fn with_mountinfo(mut self, path: impl Into<PathBuf>) -> Self {
        self.mountinfo = path.into();
        self
    }

    /// Stable device link for `device`
    pub fn device_link(&self, device: &DeviceIdentity) -> PathBuf {
        self.by_path_dir.join(device.by_path_name())
    }

    fn iscsiadm(&self, args: &[&str]) -> std::io::Result<CommandOutput> {
        self.runner.run(&self.tool, args)
    }

    fn attach_error(device: &DeviceIdentity, reason: String) -> VolumeError {
        VolumeError::Attach {
            portal: device.portal().to_string(),
            iqn: device.iqn().to_string(),
            reason,
        }
    }

    fn detach_error(device: &DeviceIdentity, reason: String) -> VolumeError {
        VolumeError::Detach {
            portal: device.portal().to_string(),
            iqn: device.iqn().to_string(),
            reason,
        }
    }

    fn discover(&self, device: &DeviceIdentity) -> VolumeResult<()> {
        let output = self
            .iscsiadm(&["-m", "discovery", "-t", "sendtargets", "-p", device.portal()])
            .map_err(|e| Self::attach_error(device, format!("failed to run {}: {}", self.tool, e)))?;

        // The node record may already exist, so a failed discovery is not fatal
        if !output.success() {
            log::warn!(
                "iscsi: discovery at {} failed ({}): {}",
                device.portal(),
                describe_status(output.status),
                output.message()
            );
        }
        Ok(())
    }

    fn login(&self, device: &DeviceIdentity) -> VolumeResult<()> {
        let output = self
            .iscsiadm(&["-m", "node", "-p", device.portal(), "-T", device.iqn(), "--login"])
            .map_err(|e| Self::attach_error(device, format!("failed to run {}: {}", self.tool, e)))?;

        match output.status {
            Some(exit_code::SUCCESS) => {
                log::info!("iscsi: logged in to {} at {}", device.iqn(), device.portal());
                Ok(())
            }
            Some(exit_code::SESSION_EXISTS) => {
                log::debug!("iscsi: session to {} already exists", device.iqn());
                Ok(())
            }
            status => Err(Self::attach_error(
                device,
                format!("login failed ({}): {}", describe_status(status), output.message()),
            )),
        }
    }

    fn wait_for_device(&self, device: &DeviceIdentity) -> VolumeResult<PathBuf> {
        let link = self.device_link(device);
        for attempt in 1..=self.wait_attempts {
            if link.exists() {
                return Ok(link);
            }
            log::debug!(
                "iscsi: waiting for {} ({}/{})",
                link.display(),
                attempt,
                self.wait_attempts
            );
            if attempt < self.wait_attempts {
                thread::sleep(self.wait_interval);
            }
        }

        Err(Self::attach_error(
            device,
            format!("device node {} did not appear after login", link.display()),
        ))
    }

    /// Device links of the other LUNs reachable through the same session.
    fn sibling_nodes(&self, device: &DeviceIdentity) -> VolumeResult<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.by_path_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VolumeError::probe(&self.by_path_dir, e)),
        };

        let prefix = device.by_path_prefix();
        let mut nodes = Vec::new();

        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(suffix) = name.strip_prefix(&prefix) else {
                continue;
            };
            // Partition links (`-lun-1-part1`) count for their LUN
            let lun = suffix.split_once("-part").map_or(suffix, |(lun, _)| lun);
            match lun.parse::<u32>() {
                Ok(lun) if lun != device.lun() => nodes.push(entry.path()),
                _ => continue,
            }
        }
        Ok(nodes)
    }
}

fn describe_status(status: Option<i32>) -> String {
    match status {
        Some(code) => format!("exit {}: {}", code, decode_iscsiadm_exit(code)),
        None => "terminated by signal".to_string(),
    }
}

impl DiskManager for IscsiAdm {
    fn attach(&self, device: &DeviceIdentity) -> VolumeResult<PathBuf> {
        let link = self.device_link(device);
        if link.exists() {
            log::debug!("iscsi: {} already attached at {}", device, link.display());
            return Ok(link);
        }

        self.discover(device)?;
        self.login(device)?;
        let link = self.wait_for_device(device)?;
        log::info!("iscsi: attached {} at {}", device, link.display());
        Ok(link)
    }

    fn detach(&self, device: &DeviceIdentity, device_path: Option<&Path>) -> VolumeResult<()> {
        let table = MountTable::load_from(&self.mountinfo)?;

        let own_link = self.device_link(device);
        for path in device_path.into_iter().chain([own_link.as_path()]) {
            if table.has_source(path) {
                return Err(Self::detach_error(
                    device,
                    format!("{} is still mounted", path.display()),
                ));
            }
        }

        let busy: Vec<PathBuf> = self
            .sibling_nodes(device)?
            .into_iter()
            .filter(|node| table.has_source(node))
            .collect();
        if !busy.is_empty() {
            log::info!(
                "iscsi: keeping session to {} for {} other mounted LUN(s)",
                device.iqn(),
                busy.len()
            );
            return Ok(());
        }

        let output = self
            .iscsiadm(&["-m", "node", "-p", device.portal(), "-T", device.iqn(), "--logout"])
            .map_err(|e| Self::detach_error(device, format!("failed to run {}: {}", self.tool, e)))?;

        match output.status {
            Some(exit_code::SUCCESS) => {
                log::info!("iscsi: logged out of {} at {}", device.iqn(), device.portal());
                Ok(())
            }
            Some(exit_code::NO_OBJECTS_FOUND) | Some(exit_code::SESSION_NOT_FOUND) => {
                log::debug!("iscsi: {} was not logged in", device.iqn());
                Ok(())
            }
            status => Err(Self::detach_error(
                device,
                format!("logout failed ({}): {}", describe_status(status), output.message()),
            )),
        }
    }

    fn canonical_shared_path(&self, device: &DeviceIdentity) -> PathBuf {
        canonical_path_under(&self.shared_root, device)
    }
}
