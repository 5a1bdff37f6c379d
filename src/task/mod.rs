//! The Task model shared by all three pool kinds (spec §3 `Task`, §4.3).

pub mod pool;

use crate::device::Device;
use crate::rkey::RkeyTbl;
use crate::connection::ConnectionHandle;
use crate::error::Result;
use std::sync::Arc;

/// What a task is currently doing, also the list it belongs to on its
/// Connection (spec §3 "every Task is in exactly one of the seven lists").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRole {
    /// Posted as a receive buffer.
    Recv,
    /// Holding data to be sent.
    Send,
    /// Carrying an RDMA read work request.
    RdmaRead,
    /// Carrying an RDMA write work request.
    RdmaWrite,
    /// No backing buffer; carries only an RDMA SGE array (spec glossary).
    Phantom,
}

/// Direction a descriptor's DMA mapping was established in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapDirection {
    /// Mapped for the device to write into (rx, rdma-read target).
    FromDevice,
    /// Mapped for the device to read from (tx, rdma-write source).
    ToDevice,
}

/// One local scatter-gather entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sge {
    /// Local DMA address.
    pub addr: u64,
    /// Length in bytes.
    pub length: u32,
    /// Local key authorizing the transfer.
    pub lkey: u32,
}

/// A peer-granted remote-side SGE, as recorded from an incoming message header.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteSge {
    /// Remote DMA address.
    pub addr: u64,
    /// Length in bytes.
    pub length: u32,
    /// Remote key authorizing the transfer.
    pub rkey: u32,
}

/// A slot carved out of the out-of-scope `Mempool` collaborator (spec §1).
#[derive(Debug, Clone, Copy)]
pub struct PoolSlot {
    /// Address of the backing memory.
    pub addr: u64,
    /// Length of the slot.
    pub len: usize,
}

/// A work-request descriptor: `rxd`, `txd`, or `rdmad` (spec §3).
#[derive(Debug, Default)]
pub struct Descriptor {
    /// Local SGEs, sized to `max_sge`.
    pub sge: Vec<Sge>,
    /// Whether this descriptor's DMA mapping is currently held (spec §3 invariant).
    pub mapped: bool,
    /// The direction it was mapped in, if mapped.
    pub direction: Option<MapDirection>,
}

impl Descriptor {
    fn new(max_sge: usize) -> Self {
        Self {
            sge: vec![Sge::default(); max_sge],
            mapped: false,
            direction: None,
        }
    }

    /// Maps this descriptor in `direction`, exactly once (spec §4.3 DMA discipline).
    pub fn map(&mut self, direction: MapDirection) -> Result<()> {
        if self.mapped {
            return Err(crate::error::RdmaError::MapError(
                "descriptor already mapped".into(),
            ));
        }
        self.mapped = true;
        self.direction = Some(direction);
        Ok(())
    }

    /// Unmaps this descriptor, in the direction it was mapped. A best-effort
    /// no-op (logged, not erroring) if it was never mapped (spec §7: teardown
    /// double-free/missing-mapping must never crash).
    pub fn unmap(&mut self) {
        if !self.mapped {
            log::warn!("unmap called on a descriptor that was never mapped");
            return;
        }
        self.mapped = false;
        self.direction = None;
    }
}

/// Read-side or write-side scatter state: SGEs, pool slots, and the
/// peer-provided remote addressing (spec §4.3).
#[derive(Debug)]
pub struct ScatterSide {
    /// Local SGEs, sized to `max_iovsz`.
    pub sge: Vec<Sge>,
    /// Mempool slots backing each SGE, same length.
    pub pool_slots: Vec<Option<PoolSlot>>,
    /// Peer-provided remote addressing, same length.
    pub remote_sge: Vec<RemoteSge>,
    /// Rkey used for fast-registration, if any (tracked for `dup2`).
    pub fastreg_rkey: Option<u32>,
}

impl ScatterSide {
    fn new(max_iovsz: usize) -> Self {
        Self {
            sge: vec![Sge::default(); max_iovsz],
            pool_slots: vec![None; max_iovsz],
            remote_sge: vec![RemoteSge::default(); max_iovsz],
            fastreg_rkey: None,
        }
    }

    /// Releases every mempool slot back to its pool (spec §4.3 `pre_put`).
    fn release_slots(&mut self, mempool: &dyn Mempool) {
        for slot in self.pool_slots.iter_mut() {
            if let Some(slot) = slot.take() {
                mempool.free(slot);
            }
        }
    }
}

/// Out-of-scope collaborator (spec §1): the NUMA-aware buffer mempool.
pub trait Mempool: Send + Sync {
    /// Allocates a slot of at least `len` bytes.
    fn alloc(&self, len: usize) -> Result<PoolSlot>;
    /// Returns a slot to the pool.
    fn free(&self, slot: PoolSlot);
}

/// One task: a recv/send/RDMA-read/RDMA-write/phantom unit of work
/// (spec §3 `Task`).
#[derive(Debug)]
pub struct Task {
    /// What this task is currently doing.
    pub role: TaskRole,
    /// The Connection that owns this task.
    pub owner: ConnectionHandle,
    /// Inline send/recv buffer; absent for phantom tasks.
    pub inline_buf: Option<Vec<u8>>,
    /// Receive work-request descriptor.
    pub rxd: Descriptor,
    /// Send work-request descriptor.
    pub txd: Descriptor,
    /// RDMA read/write work-request descriptor.
    pub rdmad: Descriptor,
    /// RDMA-read-side scatter state.
    pub read_side: ScatterSide,
    /// RDMA-write-side scatter state.
    pub write_side: ScatterSide,
}

impl Task {
    fn new(role: TaskRole, buf_size: usize, max_sge: usize, max_iovsz: usize) -> Self {
        Self {
            role,
            owner: ConnectionHandle(0),
            inline_buf: (buf_size > 0).then(|| vec![0u8; buf_size]),
            rxd: Descriptor::new(max_sge),
            txd: Descriptor::new(max_sge),
            rdmad: Descriptor::new(max_sge),
            read_side: ScatterSide::new(max_iovsz),
            write_side: ScatterSide::new(max_iovsz),
        }
    }

    /// Whether any descriptor on this task is currently mapped (used by
    /// `dup2` to decide whether a task needs re-homing, spec §4.5).
    #[must_use]
    pub fn has_mapped_descriptor(&self) -> bool {
        self.rxd.mapped || self.txd.mapped || self.rdmad.mapped
    }

    /// Replaces every local SGE's lkey with the new device's (spec §4.5 step 3).
    pub fn retarget_lkeys(&mut self, new_lkey: u32) {
        for sge in self
            .rxd
            .sge
            .iter_mut()
            .chain(self.txd.sge.iter_mut())
            .chain(self.rdmad.sge.iter_mut())
            .chain(self.read_side.sge.iter_mut())
            .chain(self.write_side.sge.iter_mut())
        {
            sge.lkey = new_lkey;
        }
    }
}

/// Static sizing parameters a pool is built with.
#[derive(Debug, Clone, Copy)]
pub struct PoolParams {
    /// Inline buffer size per task; 0 for phantom tasks.
    pub buf_size: usize,
    /// Local SGEs per descriptor.
    pub max_sge: usize,
    /// `max(max_in_iovsz, max_out_iovsz) + 1` (spec §4.3).
    pub max_iovsz: usize,
    /// Fixed capacity, or `None` for a lazily-growing pool (phantom).
    pub capacity: Option<usize>,
}

/// The common capability set shared by all three pool kinds (spec §9
/// "polymorphism over the task-pool-ops interface").
pub trait TaskPoolOps {
    /// This pool's sizing parameters.
    fn get_params(&self) -> PoolParams;

    /// One-time setup run before any task is created (e.g. reserving CQ slots).
    fn slab_pre_create(&mut self) -> Result<()> {
        Ok(())
    }

    /// One-time setup run after the pool's tasks exist (e.g. posting the
    /// initial recv and setting `peer_credits`, spec §4.3).
    fn slab_post_create(&mut self) -> Result<()> {
        Ok(())
    }

    /// Prepares a freshly allocated task for use.
    fn slab_init_task(&self, task: &mut Task) -> Result<()> {
        let _ = task;
        Ok(())
    }

    /// Reverses `slab_init_task` before a task is returned to the free list.
    fn slab_uninit_task(&self, task: &mut Task) {
        let _ = task;
    }

    /// Allocates a task from this pool, growing it if capacity and policy allow.
    fn alloc_task(&self) -> Result<Task>;

    /// Returns a task to this pool's free list (spec §4.3 `pre_put`: frees
    /// mempool slots, leaves mapped descriptors mapped).
    fn task_pre_put(&self, task: Task);

    /// Destroys the pool: unmaps every still-mapped descriptor exactly once
    /// in its original direction and releases the backing slab (spec §4.3).
    fn slab_destroy(&mut self);

    /// Re-homes one task onto `new_device` during a `dup2` (spec §4.5). Only
    /// the primary pool implements this; others refuse.
    fn slab_remap_task(
        &self,
        task: &mut Task,
        new_device: &Arc<Device>,
        rkey_tbl: &mut RkeyTbl,
    ) -> Result<()> {
        let _ = (task, new_device, rkey_tbl);
        Err(crate::error::RdmaError::NotSupported(
            "slab_remap_task not implemented by this pool kind".into(),
        ))
    }
}
