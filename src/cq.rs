//! `CompletionQueue`: one RDMA CQ, bound to (Device, Context) and shared
//! between every Connection on that pair (spec §2, §3, §4.2).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::connection::ConnectionHandle;
use crate::constants::CQE_ALLOC_SIZE;
use crate::context::Context;
use crate::device::Device;
use crate::error::{RdmaError, Result};
use crate::observer::{Observer, ObserverEvent};

/// Key identifying a CQ: (device key, owning context's id).
pub type CqKey = (crate::device::DeviceKey, u64);

/// A minimal work-completion record (the wire-level `poll` path is out of
/// scope per spec §1; this is the shape the core's bookkeeping needs).
#[derive(Debug, Clone, Copy)]
pub struct WorkCompletion {
    /// Work-request id echoed back from the poster.
    pub wr_id: u64,
    /// Non-zero on completion error.
    pub status: u32,
}

/// Anything a CQ can forcibly flush when its last reference drops while
/// Connections are still attached (spec §4.2 `release()`, a protocol
/// violation the core must never let leak).
pub trait CqAttachable: Send + Sync {
    /// This attachment's connection handle, used for `trans_list` bookkeeping.
    fn handle(&self) -> ConnectionHandle;
    /// Forcibly flushes this connection's task lists (spec §4.1 `TIMEWAIT_EXIT` path).
    fn force_flush(&self);
}

struct CqState {
    depth: u32,
    cqe_avail: u32,
    wc_buffer: Vec<WorkCompletion>,
}

/// A shared completion queue.
pub struct CompletionQueue {
    key: CqKey,
    device: Weak<Device>,
    max_cqe: u32,
    alloc_chunk: u32,
    state: Mutex<CqState>,
    trans_list: Mutex<Vec<Weak<dyn CqAttachable>>>,
    refcount: AtomicUsize,
}

impl CompletionQueue {
    fn new(key: CqKey, device: &Arc<Device>) -> Arc<Self> {
        let attr = device.attr();
        let alloc_chunk = attr.max_cqe.min(CQE_ALLOC_SIZE);
        info!("cq {key:?}: created, alloc_chunk={alloc_chunk}, max_cqe={}", attr.max_cqe);
        Arc::new(Self {
            key,
            device: Arc::downgrade(device),
            max_cqe: attr.max_cqe,
            alloc_chunk,
            state: Mutex::new(CqState {
                depth: alloc_chunk,
                cqe_avail: alloc_chunk,
                wc_buffer: Vec::with_capacity(alloc_chunk as usize),
            }),
            trans_list: Mutex::new(Vec::new()),
            // Starts at 2: one for the Context, one for the first Connection (spec §3).
            refcount: AtomicUsize::new(2),
        })
    }

    /// This CQ's key.
    #[must_use]
    pub fn key(&self) -> CqKey {
        self.key
    }

    /// Current depth (capacity) of the underlying CQ.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.state.lock().depth
    }

    /// Slots currently available to reserve.
    #[must_use]
    pub fn cqe_avail(&self) -> u32 {
        self.state.lock().cqe_avail
    }

    /// Current refcount, for tests (spec §8 property 1).
    #[must_use]
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    /// Reserves `n` CQE slots, growing the CQ by one chunk at a time if needed
    /// (spec §4.2).
    pub fn alloc_slots(&self, n: u32) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.cqe_avail >= n {
                state.cqe_avail -= n;
                debug!("cq {:?}: reserved {n} slots, {} left", self.key, state.cqe_avail);
                return Ok(());
            }
            if state.depth + self.alloc_chunk <= self.max_cqe {
                state.depth += self.alloc_chunk;
                state.cqe_avail += self.alloc_chunk;
                state
                    .wc_buffer
                    .reserve((self.alloc_chunk as usize).saturating_sub(state.wc_buffer.capacity()));
                info!("cq {:?}: grown to depth={}", self.key, state.depth);
                continue;
            }
            warn!("cq {:?}: overflow, requested={n}, avail={}", self.key, state.cqe_avail);
            return Err(RdmaError::CqOverflow);
        }
    }

    /// Returns `n` slots to `cqe_avail` (spec §4.2).
    pub fn free_slots(&self, n: u32) {
        let mut state = self.state.lock();
        state.cqe_avail += n;
        assert!(state.cqe_avail <= state.depth, "cqe_avail exceeded depth");
        debug!("cq {:?}: freed {n} slots, {} avail", self.key, state.cqe_avail);
    }

    /// Attaches a Connection to this CQ's transport list (spec §4.4, §9: a
    /// membership registration, not an ownership link).
    pub fn attach(&self, conn: Weak<dyn CqAttachable>) {
        self.trans_list.lock().push(conn);
    }

    /// Removes a Connection from this CQ's transport list; the Connection's
    /// own responsibility at teardown (spec §9).
    pub fn detach(&self, handle: ConnectionHandle) {
        self.trans_list
            .lock()
            .retain(|c| c.upgrade().is_some_and(|c| c.handle() != handle));
    }

    /// Increments the refcount, e.g. when a second Connection joins (spec §3).
    pub(crate) fn acquire_ref(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the refcount; on reaching zero, destroys the CQ, force-flushes
    /// every still-attached Connection, and detaches from the device (spec §4.2).
    pub fn release(self: &Arc<Self>) {
        let prev = self.refcount.fetch_sub(1, Ordering::SeqCst);
        if prev != 1 {
            debug!("cq {:?}: refcount now {}", self.key, prev - 1);
            return;
        }
        warn_if_trans_list_nonempty(self);
        for weak in self.trans_list.lock().drain(..) {
            if let Some(conn) = weak.upgrade() {
                warn!("cq {:?}: force-flushing connection {:?} on destroy", self.key, conn.handle());
                conn.force_flush();
            }
        }
        if let Some(device) = self.device.upgrade() {
            device.detach_cq(self.key);
        }
        info!("cq {:?}: destroyed", self.key);
    }
}

fn warn_if_trans_list_nonempty(cq: &CompletionQueue) {
    if !cq.trans_list.lock().is_empty() {
        warn!(
            "cq {:?}: destroyed with connections still attached (protocol violation)",
            cq.key
        );
    }
}

/// `CompletionQueue::acquire` registers itself against the Context's `CLOSE`
/// event so it self-releases the Context's held reference (spec §4.2).
struct CloseReleaser {
    cq: Weak<CompletionQueue>,
}

impl Observer for CloseReleaser {
    fn notify(&mut self, _handle: ConnectionHandle, event: ObserverEvent) {
        if matches!(event, ObserverEvent::Closed) {
            if let Some(cq) = self.cq.upgrade() {
                cq.release();
            }
        }
    }
}

/// Acquires the shared CQ for (device, context), creating it on first use
/// (spec §4.2).
pub fn acquire(device: &Arc<Device>, ctx: &Context, online_cpus: u32) -> Arc<CompletionQueue> {
    let key: CqKey = (device.key(), ctx.ctx_id());
    if let Some(cq) = device.find_cq(key) {
        cq.acquire_ref();
        debug!("cq {key:?}: reused, refcount={}", cq.refcount());
        return cq;
    }
    let _chosen_vector = ctx.cpuid as u32 % device.cqs_used(online_cpus).max(1);
    let cq = CompletionQueue::new(key, device);
    device.attach_cq(Arc::clone(&cq));
    ctx.on_close(Box::new(CloseReleaser {
        cq: Arc::downgrade(&cq),
    }));
    cq
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceAttr, DmaMemoryRegion, MEM_MGMT_EXTENSIONS};
    use crate::test_support::CountingFastReg;
    use std::sync::Arc;

    fn device() -> Arc<Device> {
        let attr = DeviceAttr {
            max_cqe: 2048,
            max_sge: 16,
            max_qp_rd_atom: 4,
            max_qp_init_rd_atom: 4,
            num_comp_vectors: 2,
            device_cap_flags: MEM_MGMT_EXTENSIONS,
        };
        Device::new(
            (1, 1),
            0,
            DmaMemoryRegion { lkey: 1, rkey: 1 },
            attr,
            Arc::new(CountingFastReg::default()),
        )
    }

    #[test]
    fn acquire_shares_across_connections_on_same_context() {
        let device = device();
        let ctx = Context::new(0);
        let cq1 = acquire(&device, &ctx, 4);
        assert_eq!(cq1.refcount(), 2);
        let cq2 = acquire(&device, &ctx, 4);
        assert!(Arc::ptr_eq(&cq1, &cq2));
        cq2.acquire_ref();
        assert_eq!(cq1.refcount(), 3);
    }

    #[test]
    fn release_destroys_exactly_once_at_zero() {
        let device = device();
        let ctx = Context::new(0);
        let cq = acquire(&device, &ctx, 4);
        cq.acquire_ref(); // second connection
        assert_eq!(cq.refcount(), 3);
        cq.release();
        assert_eq!(cq.refcount(), 2);
        cq.release();
        assert_eq!(cq.refcount(), 1);
        cq.release();
        assert_eq!(cq.refcount(), 0);
        assert!(device.find_cq(cq.key()).is_none());
    }

    #[test]
    fn grow_path_then_overflow() {
        let device = device();
        let ctx = Context::new(1);
        let cq = acquire(&device, &ctx, 4);
        // alloc_chunk = min(2048, 1024) = 1024; depth starts at 1024.
        assert_eq!(cq.depth(), 1024);
        cq.alloc_slots(2048).expect("grow to 2048");
        assert_eq!(cq.depth(), 2048);
        // A further grow to 3072 would exceed max_cqe=2048.
        assert!(matches!(cq.alloc_slots(2048), Err(RdmaError::CqOverflow)));
    }

    #[test]
    fn slot_counts_never_go_negative() {
        let device = device();
        let ctx = Context::new(2);
        let cq = acquire(&device, &ctx, 4);
        cq.alloc_slots(1024).unwrap();
        assert_eq!(cq.cqe_avail(), 0);
        cq.free_slots(1024);
        assert_eq!(cq.cqe_avail(), 1024);
    }
}
