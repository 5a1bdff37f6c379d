//! Test-only mock collaborators and end-to-end scenario tests: an in-memory
//! stand-in for hardware good enough to drive the core's state machine
//! without a real HCA.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::device::{Device, DeviceAttr, FastReg, MEM_MGMT_EXTENSIONS};
use crate::error::Result;
use crate::task::{Mempool, PoolSlot};

/// An in-memory `FastReg` that counts register/invalidate calls and mints
/// sequential rkeys, standing in for real fast-registration hardware.
#[derive(Default)]
pub struct CountingFastReg {
    registers: AtomicU32,
    invalidates: AtomicU32,
    next_rkey: AtomicU32,
}

impl CountingFastReg {
    /// Number of `register` calls observed.
    #[must_use]
    pub fn registers(&self) -> u32 {
        self.registers.load(Ordering::SeqCst)
    }

    /// Number of `invalidate` calls observed.
    #[must_use]
    pub fn invalidates(&self) -> u32 {
        self.invalidates.load(Ordering::SeqCst)
    }
}

impl FastReg for CountingFastReg {
    fn register(&self, _addr: u64, _len: usize, _access: u8) -> Result<u32> {
        self.registers.fetch_add(1, Ordering::SeqCst);
        Ok(self.next_rkey.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn invalidate(&self, _rkey: u32) -> Result<()> {
        self.invalidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A trivial bump-allocating `Mempool`, never actually reclaiming memory;
/// good enough to exercise the pool-slot bookkeeping in tests.
#[derive(Default)]
pub struct BumpMempool {
    next_addr: AtomicU32,
}

impl Mempool for BumpMempool {
    fn alloc(&self, len: usize) -> Result<PoolSlot> {
        let addr = u64::from(self.next_addr.fetch_add(len as u32, Ordering::SeqCst));
        Ok(PoolSlot { addr, len })
    }

    fn free(&self, _slot: PoolSlot) {}
}

fn scenario_attr(max_qp_rd_atom: u32) -> DeviceAttr {
    DeviceAttr {
        max_cqe: 2048,
        max_sge: 16,
        max_qp_rd_atom,
        max_qp_init_rd_atom: max_qp_rd_atom,
        num_comp_vectors: 2,
        device_cap_flags: MEM_MGMT_EXTENSIONS,
    }
}

/// Builds a standalone device (not registered anywhere), for tests that only
/// need a `Device` to hand to a `CompletionQueue`/`TaskPool`.
pub fn scenario_device(max_qp_rd_atom: u32) -> Arc<Device> {
    Device::new(
        (1, 1),
        0,
        crate::device::DmaMemoryRegion { lkey: 1, rkey: 1 },
        scenario_attr(max_qp_rd_atom),
        Arc::new(CountingFastReg::default()),
    )
}

/// Registers a fresh device in `registry` and returns the registry's own
/// handle to it, so later `registry.lookup` calls see the same instance.
pub fn register_scenario_device(registry: &crate::device::registry::DeviceRegistry, key: (u64, u8), max_qp_rd_atom: u32) -> Arc<Device> {
    registry.add(
        key,
        0,
        crate::device::DmaMemoryRegion { lkey: 1, rkey: 1 },
        scenario_attr(max_qp_rd_atom),
        Arc::new(CountingFastReg::default()),
    )
}

#[cfg(test)]
mod scenarios {
    use super::*;
    use crate::connection::dispatcher::{clamp_accept, dispatch, CmEvent};
    use crate::connection::{ConnState, Connection, ConnectionHandle};
    use crate::context::Context;
    use crate::device::registry::DeviceRegistry;
    use crate::error::RdmaError;
    use crate::observer::{Observer, ObserverEvent};
    use crate::qp::QpManager;
    use parking_lot::Mutex;

    struct Recorder(Arc<Mutex<Vec<ObserverEvent>>>);
    impl Observer for Recorder {
        fn notify(&mut self, _h: ConnectionHandle, event: ObserverEvent) {
            self.0.lock().push(event);
        }
    }

    fn recorder() -> (Box<dyn Observer>, Arc<Mutex<Vec<ObserverEvent>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (Box::new(Recorder(Arc::clone(&log))), log)
    }

    fn events_contain(log: &Arc<Mutex<Vec<ObserverEvent>>>, pred: impl Fn(&ObserverEvent) -> bool) -> bool {
        log.lock().iter().any(pred)
    }

    /// S1: client connect success.
    #[test]
    fn s1_client_connect_success() {
        let registry = DeviceRegistry::new();
        let device = register_scenario_device(&registry, (1, 1), 4);
        let ctx = Context::new(0);
        let mut qp_manager = QpManager::new(64);

        let client = Connection::new(ConnectionHandle(1), Arc::clone(&device), &ctx, 4);
        let (obs, log) = recorder();
        client.register_observer(obs);
        client.begin_connect().unwrap();

        dispatch(&client, CmEvent::AddrResolved, &ctx, &registry, &mut qp_manager, 256, 4, || ConnectionHandle(0)).unwrap();
        dispatch(
            &client,
            CmEvent::RouteResolved { device_key: device.key() },
            &ctx,
            &registry,
            &mut qp_manager,
            256,
            4,
            || ConnectionHandle(0),
        )
        .unwrap();
        assert_eq!(client.depths().sq_depth, 128);

        dispatch(&client, CmEvent::Established, &ctx, &registry, &mut qp_manager, 256, 4, || ConnectionHandle(0)).unwrap();
        assert_eq!(client.state(), ConnState::Connected);
        assert!(events_contain(&log, |e| matches!(e, ObserverEvent::Established)));
    }

    /// S2: client connect refused; no CQ created beyond the one shared with the Context.
    #[test]
    fn s2_client_connect_refused() {
        let registry = DeviceRegistry::new();
        let device = register_scenario_device(&registry, (1, 1), 4);
        let ctx = Context::new(0);
        let mut qp_manager = QpManager::new(64);

        let client = Connection::new(ConnectionHandle(1), Arc::clone(&device), &ctx, 4);
        let (obs, log) = recorder();
        client.register_observer(obs);
        client.begin_connect().unwrap();
        dispatch(&client, CmEvent::AddrResolved, &ctx, &registry, &mut qp_manager, 256, 4, || ConnectionHandle(0)).unwrap();
        dispatch(
            &client,
            CmEvent::RouteResolved { device_key: device.key() },
            &ctx,
            &registry,
            &mut qp_manager,
            256,
            4,
            || ConnectionHandle(0),
        )
        .unwrap();
        dispatch(
            &client,
            CmEvent::Rejected { reason: 28 }, // CM consumer-reject code
            &ctx,
            &registry,
            &mut qp_manager,
            256,
            4,
            || ConnectionHandle(0),
        )
        .unwrap();

        assert_eq!(client.state(), ConnState::Disconnected);
        assert!(events_contain(&log, |e| matches!(e, ObserverEvent::Refused { reason: 28 })));
    }

    /// S3: route resolution timeout surfaces as an error and ends DISCONNECTED.
    #[test]
    fn s3_route_resolution_timeout() {
        let registry = DeviceRegistry::new();
        let device = register_scenario_device(&registry, (1, 1), 4);
        let ctx = Context::new(0);
        let mut qp_manager = QpManager::new(64);

        let client = Connection::new(ConnectionHandle(1), Arc::clone(&device), &ctx, 4);
        let (obs, log) = recorder();
        client.register_observer(obs);
        client.begin_connect().unwrap();
        dispatch(&client, CmEvent::AddrResolved, &ctx, &registry, &mut qp_manager, 256, 4, || ConnectionHandle(0)).unwrap();
        dispatch(
            &client,
            CmEvent::RouteError("timed out".into()),
            &ctx,
            &registry,
            &mut qp_manager,
            256,
            4,
            || ConnectionHandle(0),
        )
        .unwrap();

        assert_eq!(client.state(), ConnState::Disconnected);
        assert!(events_contain(&log, |e| matches!(e, ObserverEvent::Error { kind: "RouteError", .. })));
    }

    /// S4: shared CQ reuse and refcount accounting across two Connections and a Context close.
    #[test]
    fn s4_shared_cq_reuse() {
        let device = scenario_device(4);
        let ctx = Context::new(0);
        let cq_a = crate::cq::acquire(&device, &ctx, 4);
        assert_eq!(cq_a.refcount(), 2);
        let cq_b = crate::cq::acquire(&device, &ctx, 4);
        assert!(Arc::ptr_eq(&cq_a, &cq_b));
        cq_b.acquire_ref();
        assert_eq!(cq_a.refcount(), 3);

        cq_a.release();
        assert_eq!(cq_a.refcount(), 2);
        cq_a.release();
        assert_eq!(cq_a.refcount(), 1);
        ctx.close();
        assert_eq!(cq_a.refcount(), 0);
    }

    /// S5: CQ grow path then overflow at `max_cqe`.
    #[test]
    fn s5_cq_grow_then_overflow() {
        let device = scenario_device(4);
        let ctx = Context::new(0);
        let cq = crate::cq::acquire(&device, &ctx, 4);
        assert_eq!(cq.depth(), 1024);
        cq.alloc_slots(2048).unwrap();
        assert_eq!(cq.depth(), 2048);
        assert!(matches!(cq.alloc_slots(2048), Err(RdmaError::CqOverflow)));
    }

    /// S6: device migration remaps a fast-registered read task and records its rkey pair.
    #[test]
    fn s6_device_migration_translates_rkey() {
        use crate::qp::{self};
        use crate::task::{MapDirection, TaskPoolOps, TaskRole};

        let device_a = scenario_device(4);
        let device_b = scenario_device(4);
        let ctx = Context::new(0);
        let mut qp_manager = QpManager::new(64);

        let conn = Connection::new(ConnectionHandle(9), Arc::clone(&device_b), &ctx, 4);
        let cq = conn.cq();
        let built = qp::setup_qp(&mut qp_manager, &device_b, cq, 64, 64, 4).unwrap();
        conn.install_qp(built, 256);

        {
            let primary = conn.primary_pool_for_test();
            let mut task = primary.as_ref().unwrap().alloc_task().unwrap();
            task.role = TaskRole::RdmaRead;
            task.rdmad.map(MapDirection::FromDevice).unwrap();
            task.read_side.fastreg_rkey = Some(0x5555);
            conn.move_task_into(crate::connection::TaskList::RdmaInFlight, task);
        }

        conn.dup2(Arc::clone(&device_a)).unwrap();

        let task = conn
            .take_task_from(crate::connection::TaskList::RdmaInFlight, |_| true)
            .expect("task still present after migration");
        assert_eq!(task.rxd.sge[0].lkey, device_a.mr().lkey);
        assert!(task.rdmad.mapped);
        assert_eq!(conn.rkey_tbl_len_for_test(), 1);

        let _ = clamp_accept(&device_a, 8, 8); // exercised separately from CONNECT_REQUEST flow
    }
}
