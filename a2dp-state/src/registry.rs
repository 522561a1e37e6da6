//! Per-device facts the admission policy reads
//!
//! Priority and bond state are owned by the host (settings storage, the
//! pairing service). The connection core only queries them through
//! [`DeviceRegistry`].

use std::collections::{HashMap, HashSet};

use a2dp_stack::{DeviceAddress, Priority};
use parking_lot::RwLock;

/// Read access to stored priorities and bond state
pub trait DeviceRegistry: Send + Sync {
    /// Stored connection priority; `Undefined` if never set
    fn priority(&self, device: &DeviceAddress) -> Priority;

    /// Whether the device is bonded (paired) with the local adapter
    fn is_bonded(&self, device: &DeviceAddress) -> bool;

    /// All bonded devices
    fn bonded_devices(&self) -> Vec<DeviceAddress>;

    /// Persist a new priority
    fn set_priority(&self, device: &DeviceAddress, priority: Priority);
}

/// Thread-safe in-memory registry
#[derive(Debug, Default)]
pub struct InMemoryDeviceRegistry {
    priorities: RwLock<HashMap<DeviceAddress, Priority>>,
    bonded: RwLock<HashSet<DeviceAddress>>,
}

impl InMemoryDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a device as bonded or unbonded
    pub fn set_bonded(&self, device: DeviceAddress, bonded: bool) {
        let mut set = self.bonded.write();
        if bonded {
            set.insert(device);
        } else {
            set.remove(&device);
        }
    }

    /// Builder-style helper: bond a device with the given priority
    pub fn with_device(self, device: DeviceAddress, priority: Priority) -> Self {
        self.set_bonded(device, true);
        self.priorities.write().insert(device, priority);
        self
    }
}

impl DeviceRegistry for InMemoryDeviceRegistry {
    fn priority(&self, device: &DeviceAddress) -> Priority {
        self.priorities
            .read()
            .get(device)
            .copied()
            .unwrap_or_default()
    }

    fn is_bonded(&self, device: &DeviceAddress) -> bool {
        self.bonded.read().contains(device)
    }

    fn bonded_devices(&self) -> Vec<DeviceAddress> {
        let mut devices: Vec<_> = self.bonded.read().iter().copied().collect();
        devices.sort();
        devices
    }

    fn set_priority(&self, device: &DeviceAddress, priority: Priority) {
        tracing::debug!("Priority of {} set to {:?}", device, priority);
        self.priorities.write().insert(*device, priority);
    }
}
