//! `Device`: protection domain, DMA memory region, device attributes and the
//! list of `CompletionQueue`s living on it (spec §3 data model, §9 "back-references
//! via weak handles").

pub(crate) mod registry;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::info;
use parking_lot::RwLock;

use crate::cq::CompletionQueue;
use crate::error::{RdmaError, Result};

/// Key a `Device` is registered under: (device handle, port).
pub type DeviceKey = (u64, u8);

/// Capability bit tested by `NotSupported` guards (spec §7).
pub const MEM_MGMT_EXTENSIONS: u32 = 1 << 0;

/// Static device capabilities queried once at registration (spec §3).
#[derive(Debug, Clone, Copy)]
pub struct DeviceAttr {
    /// Maximum CQEs a single CQ on this device can hold.
    pub max_cqe: u32,
    /// Maximum scatter-gather entries per work request.
    pub max_sge: u32,
    /// Maximum outstanding RDMA-read/atomic operations this side can respond to.
    pub max_qp_rd_atom: u32,
    /// Maximum outstanding RDMA-read/atomic operations this side can initiate.
    pub max_qp_init_rd_atom: u32,
    /// Number of completion-event vectors this device exposes.
    pub num_comp_vectors: u32,
    /// Capability flags, see [`MEM_MGMT_EXTENSIONS`].
    pub device_cap_flags: u32,
}

impl DeviceAttr {
    /// Returns whether `MEM_MGMT_EXTENSIONS` (fast-registration support) is set.
    #[must_use]
    pub fn has_mem_mgmt_extensions(&self) -> bool {
        self.device_cap_flags & MEM_MGMT_EXTENSIONS != 0
    }
}

/// Local/remote access rights of the device's DMA memory region.
#[derive(Debug, Clone, Copy)]
pub struct DmaMemoryRegion {
    /// Local key used to authorize local DMA access.
    pub lkey: u32,
    /// Remote key handed to peers for RDMA read/write access.
    pub rkey: u32,
}

/// Out-of-scope collaborator contract (spec §1): on-the-fly memory-region
/// (re-)registration producing a new rkey per transfer. Only the interface
/// the core depends on is modeled here.
pub trait FastReg: Send + Sync {
    /// Registers `addr..addr+len` for the given access flags, returning a new rkey.
    fn register(&self, addr: u64, len: usize, access: u8) -> Result<u32>;
    /// Invalidates a previously-issued rkey.
    fn invalidate(&self, rkey: u32) -> Result<()>;
}

/// One RDMA-capable device/port, refcounted and owning the CQs bound to it.
pub struct Device {
    pub(crate) key: DeviceKey,
    pub(crate) pd_handle: u32,
    pub(crate) mr: DmaMemoryRegion,
    pub(crate) attr: DeviceAttr,
    pub(crate) fastreg: Arc<dyn FastReg>,
    /// Protects the CQ list; readers (CQ lookup) are the fast path (spec §5 `cq_lock`).
    pub(crate) cq_list: RwLock<Vec<Arc<CompletionQueue>>>,
    rkey_counter: AtomicU32,
}

impl Device {
    /// Registers a new device in the given registry slot.
    pub(crate) fn new(
        key: DeviceKey,
        pd_handle: u32,
        mr: DmaMemoryRegion,
        attr: DeviceAttr,
        fastreg: Arc<dyn FastReg>,
    ) -> Arc<Self> {
        info!("device {key:?}: registered, attr={attr:?}");
        Arc::new(Self {
            key,
            pd_handle,
            mr,
            attr,
            fastreg,
            cq_list: RwLock::new(Vec::new()),
            rkey_counter: AtomicU32::new(1),
        })
    }

    /// This device's key.
    #[must_use]
    pub fn key(&self) -> DeviceKey {
        self.key
    }

    /// This device's static attributes.
    #[must_use]
    pub fn attr(&self) -> DeviceAttr {
        self.attr
    }

    /// This device's DMA memory region (lkey/rkey pair).
    #[must_use]
    pub fn mr(&self) -> DmaMemoryRegion {
        self.mr
    }

    /// Number of comp-vector "slots" to round-robin CQs over (spec §4.2):
    /// `min(roundup_pow_2(online_cpus), device.num_comp_vectors)`.
    #[must_use]
    pub fn cqs_used(&self, online_cpus: u32) -> u32 {
        roundup_pow_2(online_cpus).min(self.attr.num_comp_vectors.max(1))
    }

    /// Re-registers a memory region against this device for `dup2` (spec §4.5).
    /// Returns the newly minted rkey.
    pub(crate) fn reregister(&self, addr: u64, len: usize, access: u8) -> Result<u32> {
        self.fastreg.register(addr, len, access)
    }

    pub(crate) fn attach_cq(&self, cq: Arc<CompletionQueue>) {
        self.cq_list.write().push(cq);
    }

    pub(crate) fn detach_cq(&self, key: crate::cq::CqKey) {
        self.cq_list.write().retain(|cq| cq.key() != key);
    }

    pub(crate) fn find_cq(&self, key: crate::cq::CqKey) -> Option<Arc<CompletionQueue>> {
        self.cq_list.read().iter().find(|cq| cq.key() == key).cloned()
    }

    /// Mints a fresh synthetic rkey; used by the in-memory test `FastReg`.
    pub(crate) fn next_rkey(&self) -> u32 {
        self.rkey_counter.fetch_add(1, Ordering::Relaxed)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        info!("device {:?}: all references dropped, releasing PD/MR", self.key);
    }
}

/// `roundup_pow_2(0) == 1` to keep `cqs_used` well-defined for a single-CPU box.
fn roundup_pow_2(x: u32) -> u32 {
    if x <= 1 {
        1
    } else {
        1u32 << (32 - (x - 1).leading_zeros())
    }
}

/// Guard used by `NotSupported` checks (spec §7).
pub(crate) fn require_mem_mgmt_extensions(attr: &DeviceAttr, feature: &str) -> Result<()> {
    if attr.has_mem_mgmt_extensions() {
        Ok(())
    } else {
        Err(RdmaError::NotSupported(format!(
            "{feature} requires MEM_MGMT_EXTENSIONS"
        )))
    }
}
