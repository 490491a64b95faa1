//! Per-device serialisation
//!
//! Shared mount and release are check-then-act sequences against the mount
//! table. Two consumers of one device must not interleave them, so each
//! [`DeviceIdentity`] gets its own mutex. Consumers of different devices
//! never contend.

use crate::device::DeviceIdentity;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of one lock per device identity
#[derive(Debug, Default)]
pub struct DeviceLocks {
    locks: Mutex<HashMap<DeviceIdentity, Arc<Mutex<()>>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock for `device` is held.
    pub fn lock(&self, device: &DeviceIdentity) -> DeviceGuard<'_> {
        let slot = {
            let mut locks = self.locks.lock();
            locks
                .entry(device.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        DeviceGuard {
            registry: self,
            device: device.clone(),
            guard: Some(slot.lock_arc()),
        }
    }

    /// Number of identities with a live lock entry
    pub fn active(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Held lock for one device; the registry entry goes away with the last holder.
pub struct DeviceGuard<'a> {
    registry: &'a DeviceLocks,
    device: DeviceIdentity,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl DeviceGuard<'_> {
    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }
}

impl Drop for DeviceGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.registry.locks.lock();
        // Clones are only taken under the registry lock, so two references
        // (map + this guard) means no one else is waiting.
        let idle = locks
            .get(&self.device)
            .map(|slot| Arc::strong_count(slot) == 2)
            .unwrap_or(false);
        if idle {
            locks.remove(&self.device);
        }
        self.guard.take();
    }
}
