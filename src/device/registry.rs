//! `DeviceRegistry`: tracks all devices currently present, keyed by
//! (device handle, port) (spec §2, §3, §5 "written only from device-add /
//! device-remove callbacks").

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::RwLock;

use crate::device::{Device, DeviceAttr, DeviceKey, DmaMemoryRegion, FastReg};
use crate::error::{RdmaError, Result};

/// Registry of devices currently present on the system.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceKey, Arc<Device>>>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called from the device-add callback: registers a newly-arrived device.
    pub fn add(
        &self,
        key: DeviceKey,
        pd_handle: u32,
        mr: DmaMemoryRegion,
        attr: DeviceAttr,
        fastreg: Arc<dyn FastReg>,
    ) -> Arc<Device> {
        let device = Device::new(key, pd_handle, mr, attr, fastreg);
        self.devices.write().insert(key, Arc::clone(&device));
        device
    }

    /// Called from the device-remove callback: deregisters a device. Existing
    /// strong references (held by Connections/CQs) keep the `Device` alive
    /// until they drop (spec §3 lifecycle).
    pub fn remove(&self, key: DeviceKey) {
        if self.devices.write().remove(&key).is_some() {
            info!("device {key:?}: removed from registry");
        } else {
            warn!("device {key:?}: remove requested but not registered");
        }
    }

    /// Looks up a device by key, as done on `ROUTE_RESOLVED` (spec §4.1).
    pub fn lookup(&self, key: DeviceKey) -> Result<Arc<Device>> {
        self.devices
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| RdmaError::NoDevice(format!("{key:?}")))
    }

    /// Number of devices currently registered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MEM_MGMT_EXTENSIONS;
    use crate::test_support::CountingFastReg;

    fn attr() -> DeviceAttr {
        DeviceAttr {
            max_cqe: 4096,
            max_sge: 16,
            max_qp_rd_atom: 4,
            max_qp_init_rd_atom: 4,
            num_comp_vectors: 2,
            device_cap_flags: MEM_MGMT_EXTENSIONS,
        }
    }

    #[test]
    fn add_then_lookup_succeeds() {
        let registry = DeviceRegistry::new();
        let key = (1, 1);
        registry.add(
            key,
            0,
            DmaMemoryRegion { lkey: 1, rkey: 1 },
            attr(),
            Arc::new(CountingFastReg::default()),
        );
        assert!(registry.lookup(key).is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_missing_device_is_no_device() {
        let registry = DeviceRegistry::new();
        assert!(matches!(
            registry.lookup((9, 9)),
            Err(RdmaError::NoDevice(_))
        ));
    }

    #[test]
    fn remove_drops_registry_reference() {
        let registry = DeviceRegistry::new();
        let key = (2, 1);
        let device = registry.add(
            key,
            0,
            DmaMemoryRegion { lkey: 1, rkey: 1 },
            attr(),
            Arc::new(CountingFastReg::default()),
        );
        registry.remove(key);
        assert!(registry.is_empty());
        // Connection-held reference keeps the device alive.
        assert_eq!(device.key(), key);
    }
}
