//! The three pool kinds: initial (handshake), primary (data-path), and
//! phantom (RDMA-only, on-demand) (spec §4.3).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::{info, warn};
use parking_lot::Mutex;

use crate::constants::{CONN_SETUP_BUF_SIZE, NUM_CONN_SETUP_TASKS, PRIMARY_POOL_MULTIPLIER};
use crate::device::Device;
use crate::error::{RdmaError, Result};
use crate::rkey::RkeyTbl;

use super::{MapDirection, PoolParams, Task, TaskPoolOps, TaskRole};

/// `num_tasks = 6 × (sq_depth + actual_rq_depth)` (spec §4.3, §4.6, §8 property 6).
#[must_use]
pub fn primary_pool_size(sq_depth: usize, actual_rq_depth: usize) -> usize {
    PRIMARY_POOL_MULTIPLIER * (sq_depth + actual_rq_depth)
}

/// `alloc_sz = num_tasks × membuf_sz` (spec §4.6).
#[must_use]
pub fn primary_alloc_bytes(num_tasks: usize, membuf_sz: usize) -> usize {
    num_tasks * membuf_sz
}

struct PoolCore {
    device: Weak<Device>,
    params: PoolParams,
    free: Mutex<Vec<Task>>,
    created: AtomicUsize,
    slab_bytes: usize,
}

impl PoolCore {
    fn new(device: &Arc<Device>, params: PoolParams) -> Self {
        let slab_bytes = params.capacity.unwrap_or(0) * params.buf_size;
        Self {
            device: Arc::downgrade(device),
            params,
            free: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
            slab_bytes,
        }
    }

    fn make_task(&self, role: TaskRole) -> Task {
        Task::new(role, self.params.buf_size, self.params.max_sge, self.params.max_iovsz)
    }

    fn alloc_task(&self, role: TaskRole) -> Result<Task> {
        if let Some(task) = self.free.lock().pop() {
            return Ok(task);
        }
        if let Some(cap) = self.params.capacity {
            if self.created.load(Ordering::SeqCst) >= cap {
                return Err(RdmaError::OutOfMemory(format!(
                    "task pool exhausted (capacity={cap})"
                )));
            }
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.make_task(role))
    }

    fn task_pre_put(&self, mut task: Task) {
        task.read_side.fastreg_rkey = None;
        task.write_side.fastreg_rkey = None;
        for slot in task.read_side.pool_slots.iter_mut().chain(task.write_side.pool_slots.iter_mut()) {
            *slot = None;
        }
        self.free.lock().push(task);
    }

    fn destroy(&mut self) {
        let mut leftover = 0usize;
        for mut task in self.free.lock().drain(..) {
            for d in [&mut task.rxd, &mut task.txd, &mut task.rdmad] {
                if d.mapped {
                    d.unmap();
                    leftover += 1;
                }
            }
        }
        if leftover > 0 {
            warn!("task pool destroy: {leftover} descriptors were still mapped");
        }
        info!(
            "task pool destroy: slab_bytes={}, created={}",
            self.slab_bytes,
            self.created.load(Ordering::SeqCst)
        );
    }
}

/// Fixed-size handshake pool: `NUM_CONN_SETUP_TASKS` tasks of
/// `CONN_SETUP_BUF_SIZE` bytes (spec §4.3).
pub struct InitialPool {
    core: PoolCore,
}

impl InitialPool {
    /// Builds the pool and eagerly creates all `NUM_CONN_SETUP_TASKS` tasks.
    pub fn new(device: &Arc<Device>, max_sge: usize, max_iovsz: usize) -> Self {
        let params = PoolParams {
            buf_size: CONN_SETUP_BUF_SIZE,
            max_sge,
            max_iovsz,
            capacity: Some(NUM_CONN_SETUP_TASKS),
        };
        let core = PoolCore::new(device, params);
        for _ in 0..NUM_CONN_SETUP_TASKS {
            core.created.fetch_add(1, Ordering::SeqCst);
            core.free.lock().push(core.make_task(TaskRole::Recv));
        }
        Self { core }
    }
}

impl TaskPoolOps for InitialPool {
    fn get_params(&self) -> PoolParams {
        self.core.params
    }

    fn alloc_task(&self) -> Result<Task> {
        self.core.alloc_task(TaskRole::Recv)
    }

    fn task_pre_put(&self, task: Task) {
        self.core.task_pre_put(task);
    }

    fn slab_destroy(&mut self) {
        self.core.destroy();
    }
}

/// Data-path pool sized from negotiated queue depths (spec §4.3, §4.6).
pub struct PrimaryPool {
    core: PoolCore,
    /// `sq_depth`: also `max_tx_ready_tasks_num` (spec §4.6).
    pub max_tx_ready_tasks_num: usize,
}

impl PrimaryPool {
    /// Builds the pool with `num_tasks = 6 × (sq_depth + actual_rq_depth)`.
    pub fn new(
        device: &Arc<Device>,
        sq_depth: usize,
        actual_rq_depth: usize,
        membuf_sz: usize,
        max_sge: usize,
        max_iovsz: usize,
    ) -> Self {
        let capacity = primary_pool_size(sq_depth, actual_rq_depth);
        let params = PoolParams {
            buf_size: membuf_sz,
            max_sge,
            max_iovsz,
            capacity: Some(capacity),
        };
        Self {
            core: PoolCore::new(device, params),
            max_tx_ready_tasks_num: sq_depth,
        }
    }
}

impl TaskPoolOps for PrimaryPool {
    fn get_params(&self) -> PoolParams {
        self.core.params
    }

    fn alloc_task(&self) -> Result<Task> {
        self.core.alloc_task(TaskRole::Send)
    }

    fn task_pre_put(&self, task: Task) {
        self.core.task_pre_put(task);
    }

    fn slab_destroy(&mut self) {
        self.core.destroy();
    }

    fn slab_remap_task(
        &self,
        task: &mut Task,
        new_device: &Arc<Device>,
        rkey_tbl: &mut RkeyTbl,
    ) -> Result<()> {
        if task.rxd.mapped {
            task.rxd.unmap();
            task.rxd.map(MapDirection::FromDevice)?;
        }
        if task.txd.mapped {
            task.txd.unmap();
            task.txd.map(MapDirection::ToDevice)?;
        }
        if task.rdmad.mapped {
            let direction = match task.role {
                TaskRole::RdmaRead => MapDirection::FromDevice,
                _ => MapDirection::ToDevice,
            };
            task.rdmad.unmap();
            task.rdmad.map(direction)?;
        }
        if let Some(old_rkey) = task.read_side.fastreg_rkey {
            let new_rkey = new_device.reregister(0, 0, 0)?;
            rkey_tbl.record(old_rkey, new_rkey);
            task.read_side.fastreg_rkey = Some(new_rkey);
        }
        if let Some(old_rkey) = task.write_side.fastreg_rkey {
            let new_rkey = new_device.reregister(0, 0, 0)?;
            rkey_tbl.record(old_rkey, new_rkey);
            task.write_side.fastreg_rkey = Some(new_rkey);
        }
        task.retarget_lkeys(new_device.mr().lkey);
        Ok(())
    }
}

/// Lazily-grown pool of buffer-less tasks carrying only an RDMA SGE array
/// (spec §4.3, glossary "phantom task").
pub struct PhantomPool {
    core: PoolCore,
}

impl PhantomPool {
    /// Builds an empty phantom pool; tasks are created on first RDMA read/write.
    pub fn new(device: &Arc<Device>, max_sge: usize) -> Self {
        let params = PoolParams {
            buf_size: 0,
            max_sge,
            max_iovsz: 0,
            capacity: None,
        };
        Self {
            core: PoolCore::new(device, params),
        }
    }
}

impl TaskPoolOps for PhantomPool {
    fn get_params(&self) -> PoolParams {
        self.core.params
    }

    fn alloc_task(&self) -> Result<Task> {
        self.core.alloc_task(TaskRole::Phantom)
    }

    fn task_pre_put(&self, task: Task) {
        self.core.task_pre_put(task);
    }

    fn slab_destroy(&mut self) {
        self.core.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    fn primary_pool_size_matches_formula() {
        assert_eq!(primary_pool_size(64, 32), 6 * (64 + 32));
    }

    #[test]
    fn initial_pool_exhausts_at_capacity() {
        let device = device();
        let pool = InitialPool::new(&device, 4, 4);
        let mut held = Vec::new();
        for _ in 0..NUM_CONN_SETUP_TASKS {
            held.push(pool.alloc_task().expect("within capacity"));
        }
        assert!(matches!(pool.alloc_task(), Err(RdmaError::OutOfMemory(_))));
        pool.task_pre_put(held.pop().unwrap());
        assert!(pool.alloc_task().is_ok());
    }

    #[test]
    fn phantom_pool_grows_unbounded() {
        let device = device();
        let pool = PhantomPool::new(&device, 4);
        for _ in 0..10_000 {
            pool.alloc_task().expect("phantom pool never refuses");
        }
    }

    #[test]
    fn pre_put_frees_pool_slots_but_keeps_mapping() {
        let device = device();
        let pool = PrimaryPool::new(&device, 4, 4, 256, 4, 5);
        let mut task = pool.alloc_task().unwrap();
        task.rdmad.map(MapDirection::ToDevice).unwrap();
        task.read_side.fastreg_rkey = Some(7);
        pool.task_pre_put(task);
        let task = pool.alloc_task().unwrap();
        assert!(task.rdmad.mapped, "mapped descriptors stay mapped across pre_put");
        assert!(task.read_side.fastreg_rkey.is_none());
    }

    #[test]
    fn remap_task_onto_new_device_updates_lkeys_and_rkey_tbl() {
        let old_device = device();
        let new_device = device();
        let pool = PrimaryPool::new(&old_device, 4, 4, 256, 4, 5);
        let mut task = pool.alloc_task().unwrap();
        task.rdmad.map(MapDirection::FromDevice).unwrap();
        task.role = TaskRole::RdmaRead;
        task.read_side.fastreg_rkey = Some(0xAAAA);
        let mut rkey_tbl = RkeyTbl::new();
        pool.slab_remap_task(&mut task, &new_device, &mut rkey_tbl).unwrap();
        assert!(task.rdmad.mapped);
        assert_eq!(rkey_tbl.len(), 1);
        assert_eq!(task.rxd.sge[0].lkey, new_device.mr().lkey);
    }
}
