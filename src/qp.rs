//! Queue-pair setup/teardown and its coupling to the completion queue,
//! and a bitmap-based QP-handle allocator.

use std::sync::Arc;

use bitvec::vec::BitVec;
use log::{info, warn};

use crate::constants::{MAX_CQE_PER_QP, MAX_INLINE_DATA, MAX_RECV_WR, MAX_SEND_WR, EXTRA_RQE};
use crate::cq::CompletionQueue;
use crate::device::Device;
use crate::error::Result;

/// Opaque QP handle, a slot in a device's `QpManager` bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QpHandle(pub u32);

/// Bitmap-based allocator for QP handles on one device.
pub struct QpManager {
    bitmap: BitVec,
}

impl QpManager {
    /// Builds an allocator with room for `capacity` QPs.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let mut bitmap = BitVec::with_capacity(capacity);
        bitmap.resize(capacity, false);
        Self { bitmap }
    }

    /// Allocates the first free handle.
    pub fn alloc(&mut self) -> Result<QpHandle> {
        let idx = self.bitmap.first_zero().ok_or_else(|| {
            crate::error::RdmaError::OutOfMemory("QP handle space exhausted".into())
        })?;
        self.bitmap.set(idx, true);
        Ok(QpHandle(idx as u32))
    }

    /// Frees a previously allocated handle.
    pub fn free(&mut self, handle: QpHandle) {
        let idx = handle.0 as usize;
        if idx < self.bitmap.len() {
            self.bitmap.set(idx, false);
        }
    }
}

/// Negotiated QP-level parameters, queried back after creation (spec §4.4:
/// "query the QP back to record the actually-granted `max_inline_data` and
/// `max_sge`").
#[derive(Debug, Clone, Copy)]
pub struct QpAttrs {
    /// Negotiated send-queue depth.
    pub sq_depth: u32,
    /// Requested receive-queue depth.
    pub rq_depth: u32,
    /// Actually granted receive-queue depth (device may clamp).
    pub actual_rq_depth: u32,
    /// Granted max scatter-gather entries per send WR.
    pub max_sge: u32,
    /// Granted max inline data size.
    pub max_inline_data: u32,
    /// Remaining send-queue entries available to post.
    pub sqe_avail: u32,
}

/// A set-up queue pair: its handle, the CQ it is bound to, and its granted attrs.
pub struct QueuePair {
    /// Allocated handle.
    pub handle: QpHandle,
    /// The (possibly shared) CQ this QP posts completions to.
    pub cq: Arc<CompletionQueue>,
    /// Granted attributes.
    pub attrs: QpAttrs,
}

/// Builds a QP bound to `cq`: reserves `MAX_CQE_PER_QP` CQE slots, then
/// allocates a handle with RC type, inline-data and SGE bounds per spec §4.4.
/// On failure the reserved CQE slots are returned to the CQ.
pub fn setup_qp(
    manager: &mut QpManager,
    device: &Arc<Device>,
    cq: Arc<CompletionQueue>,
    sq_depth: u32,
    rq_depth: u32,
    max_out_iovsz: u32,
) -> Result<QueuePair> {
    cq.alloc_slots(MAX_CQE_PER_QP)?;

    let max_send_sge = max_out_iovsz.saturating_add(1).min(device.attr().max_sge);
    let requested = QpAttrs {
        sq_depth,
        rq_depth,
        actual_rq_depth: rq_depth,
        max_sge: max_send_sge,
        max_inline_data: MAX_INLINE_DATA,
        sqe_avail: MAX_SEND_WR,
    };

    let handle = match manager.alloc() {
        Ok(h) => h,
        Err(e) => {
            cq.free_slots(MAX_CQE_PER_QP);
            return Err(e);
        }
    };

    info!(
        "qp {handle:?}: created on cq {:?}, max_send_wr={MAX_SEND_WR}, max_recv_wr={}, max_send_sge={max_send_sge}, max_recv_sge=1",
        cq.key(),
        MAX_RECV_WR + EXTRA_RQE
    );

    Ok(QueuePair {
        handle,
        cq,
        attrs: requested,
    })
}

/// Tears down a QP: detaches from the CQ's transport list, frees its CQE
/// reservation, and releases its handle (spec §4.4).
pub fn teardown_qp(manager: &mut QpManager, qp: QueuePair, conn: crate::connection::ConnectionHandle) {
    qp.cq.detach(conn);
    qp.cq.free_slots(MAX_CQE_PER_QP);
    manager.free(qp.handle);
    info!("qp {:?}: torn down", qp.handle);
    if qp.attrs.sqe_avail > qp.attrs.sq_depth {
        warn!("qp {:?}: sqe_avail exceeded sq_depth at teardown", qp.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHandle;
    use crate::context::Context;
    use crate::device::{DeviceAttr, DmaMemoryRegion, MEM_MGMT_EXTENSIONS};
    use crate::test_support::CountingFastReg;

    fn device() -> Arc<Device> {
        let attr = DeviceAttr {
            max_cqe: 4096,
            max_sge: 16,
            max_qp_rd_atom: 4,
            max_qp_init_rd_atom: 4,
            num_comp_vectors: 2,
            device_cap_flags: MEM_MGMT_EXTENSIONS,
        };
        Device::new((1, 1), 0, DmaMemoryRegion { lkey: 1, rkey: 1 }, attr, Arc::new(CountingFastReg::default()))
    }

    #[test]
    fn setup_then_teardown_round_trips_cqe_reservation() {
        let device = device();
        let ctx = Context::new(0);
        let cq = crate::cq::acquire(&device, &ctx, 4);
        let avail_before = cq.cqe_avail();
        let mut manager = QpManager::new(16);
        let qp = setup_qp(&mut manager, &device, Arc::clone(&cq), 64, 64, 4).unwrap();
        assert_eq!(cq.cqe_avail(), avail_before - MAX_CQE_PER_QP);
        teardown_qp(&mut manager, qp, ConnectionHandle(1));
        assert_eq!(cq.cqe_avail(), avail_before);
    }

    #[test]
    fn setup_fails_cleanly_on_cq_overflow() {
        let device = device();
        let ctx = Context::new(1);
        let cq = crate::cq::acquire(&device, &ctx, 4);
        // Drain the CQ's room so MAX_CQE_PER_QP cannot be reserved again.
        cq.alloc_slots(cq.cqe_avail()).unwrap();
        let mut manager = QpManager::new(16);
        let before = manager.bitmap.count_ones();
        assert!(setup_qp(&mut manager, &device, cq, 64, 64, 4).is_err());
        assert_eq!(manager.bitmap.count_ones(), before, "no handle leaked on failure");
    }
}
