//! `Connection`: one RDMA endpoint, its CM-id/QP, its Device and CQ
//! references, and its seven task lists (spec §3, §4.1).

pub mod dispatcher;

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::context::Context;
use crate::cq::{CompletionQueue, CqAttachable};
use crate::device::Device;
use crate::error::{RdmaError, Result};
use crate::observer::{Observable, Observer, ObserverEvent};
use crate::qp::QueuePair;
use crate::rkey::{PeerRkeyTbl, RkeyTbl};
use crate::task::pool::{InitialPool, PhantomPool, PrimaryPool};
use crate::task::{Task, TaskPoolOps};

/// Opaque identity of a Connection, stable for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

/// Connection lifecycle states (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Freshly created, no CM action taken yet.
    Init,
    /// A passive endpoint waiting for inbound connect requests.
    Listen,
    /// An active endpoint mid-handshake.
    Connecting,
    /// Handshake complete, data may flow.
    Connected,
    /// `rdma_disconnect` issued, awaiting peer teardown.
    Disconnecting,
    /// Peer or local side tore down; CM-id not yet destroyed.
    Disconnected,
    /// Locally closed; awaiting `TIMEWAIT_EXIT` before destruction.
    Closed,
    /// Fully torn down; the Connection record may be dropped.
    Destroyed,
}

/// One of the seven lists a Task belongs to while owned by a Connection
/// (spec §3 invariant; §4.3 names four explicitly, the remainder chosen to
/// complete the partition for initial/phantom tasks in use).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskList {
    /// Tasks queued to send, not yet posted.
    TxReady,
    /// Posted sends awaiting a send-completion.
    InFlightSend,
    /// Posted recvs awaiting a receive-completion.
    InFlightRecv,
    /// Posted RDMA read/write work requests awaiting completion.
    RdmaInFlight,
    /// Decoded requests not yet turned into I/O.
    IoSubmit,
    /// Phantom tasks currently carrying an in-flight RDMA SGE array.
    PhantomInUse,
    /// Initial-pool tasks in use during the handshake.
    InitialInUse,
}

#[derive(Default)]
struct TaskLists {
    tx_ready: Vec<Task>,
    in_flight_send: Vec<Task>,
    in_flight_recv: Vec<Task>,
    rdma_in_flight: Vec<Task>,
    io_submit: Vec<Task>,
    phantom_in_use: Vec<Task>,
    initial_in_use: Vec<Task>,
}

impl TaskLists {
    fn list_mut(&mut self, which: TaskList) -> &mut Vec<Task> {
        match which {
            TaskList::TxReady => &mut self.tx_ready,
            TaskList::InFlightSend => &mut self.in_flight_send,
            TaskList::InFlightRecv => &mut self.in_flight_recv,
            TaskList::RdmaInFlight => &mut self.rdma_in_flight,
            TaskList::IoSubmit => &mut self.io_submit,
            TaskList::PhantomInUse => &mut self.phantom_in_use,
            TaskList::InitialInUse => &mut self.initial_in_use,
        }
    }

    fn drain_all(&mut self) -> Vec<Task> {
        self.tx_ready
            .drain(..)
            .chain(self.in_flight_send.drain(..))
            .chain(self.in_flight_recv.drain(..))
            .chain(self.rdma_in_flight.drain(..))
            .chain(self.io_submit.drain(..))
            .chain(self.phantom_in_use.drain(..))
            .chain(self.initial_in_use.drain(..))
            .collect()
    }

    fn total_len(&self) -> usize {
        self.tx_ready.len()
            + self.in_flight_send.len()
            + self.in_flight_recv.len()
            + self.rdma_in_flight.len()
            + self.io_submit.len()
            + self.phantom_in_use.len()
            + self.initial_in_use.len()
    }
}

/// Negotiated per-connection depths, recorded once the QP is set up.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnDepths {
    /// Negotiated send-queue depth.
    pub sq_depth: u32,
    /// Requested receive-queue depth.
    pub rq_depth: u32,
    /// Actually granted receive-queue depth.
    pub actual_rq_depth: u32,
    /// Granted max SGEs per descriptor.
    pub max_sge: u32,
    /// Granted max inline data.
    pub max_inline_data: u32,
}

/// One RDMA endpoint (spec §3 `Connection`).
pub struct Connection {
    /// Stable identity.
    pub handle: ConnectionHandle,
    state: Mutex<ConnState>,
    device: Mutex<Arc<Device>>,
    cq: Mutex<Arc<CompletionQueue>>,
    qp: Mutex<Option<QueuePair>>,
    depths: Mutex<ConnDepths>,
    handler_nesting: AtomicU32,
    refcount: AtomicUsize,
    disconnect_issued: std::sync::atomic::AtomicBool,
    observers: Mutex<Observable>,
    lists: Mutex<TaskLists>,
    initial_pool: Mutex<InitialPool>,
    primary_pool: Mutex<Option<PrimaryPool>>,
    phantom_pool: Mutex<PhantomPool>,
    rkey_tbl: Mutex<RkeyTbl>,
    peer_rkey_tbl: Mutex<PeerRkeyTbl>,
    peer_credits: AtomicI64,
    sim_peer_credits: AtomicI64,
}

impl Connection {
    /// Creates a Connection bound to `device`'s CQ on `ctx` (spec §3).
    pub fn new(handle: ConnectionHandle, device: Arc<Device>, ctx: &Context, online_cpus: u32) -> Arc<Self> {
        let cq = crate::cq::acquire(&device, ctx, online_cpus);
        let initial_pool = InitialPool::new(&device, 4, 5);
        let phantom_pool = PhantomPool::new(&device, 4);
        info!("connection {handle:?}: created on device {:?}", device.key());
        Arc::new(Self {
            handle,
            state: Mutex::new(ConnState::Init),
            device: Mutex::new(device),
            cq: Mutex::new(cq),
            qp: Mutex::new(None),
            depths: Mutex::new(ConnDepths::default()),
            handler_nesting: AtomicU32::new(0),
            refcount: AtomicUsize::new(1),
            disconnect_issued: std::sync::atomic::AtomicBool::new(false),
            observers: Mutex::new(Observable::new()),
            lists: Mutex::new(TaskLists::default()),
            initial_pool: Mutex::new(initial_pool),
            primary_pool: Mutex::new(None),
            phantom_pool: Mutex::new(phantom_pool),
            rkey_tbl: Mutex::new(RkeyTbl::new()),
            peer_rkey_tbl: Mutex::new(PeerRkeyTbl::new()),
            peer_credits: AtomicI64::new(0),
            sim_peer_credits: AtomicI64::new(0),
        })
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    fn set_state(&self, next: ConnState) {
        let mut state = self.state.lock();
        debug!("connection {:?}: {:?} -> {:?}", self.handle, *state, next);
        *state = next;
    }

    /// Registers an observer for this Connection's lifecycle events.
    pub fn register_observer(&self, observer: Box<dyn Observer>) {
        self.observers.lock().register(observer);
    }

    fn notify(&self, event: ObserverEvent) {
        self.observers.lock().notify_all(self.handle, event);
    }

    /// Entered at CM dispatch entry; destruction is forbidden while nonzero
    /// (spec §4.1 handler-nesting rule, §9).
    pub fn enter_handler(&self) {
        self.handler_nesting.fetch_add(1, Ordering::SeqCst);
    }

    /// Exited at CM dispatch return.
    pub fn exit_handler(&self) {
        self.handler_nesting.fetch_sub(1, Ordering::SeqCst);
    }

    /// Whether the CM dispatcher is currently on the stack for this Connection.
    #[must_use]
    pub fn handler_nesting(&self) -> u32 {
        self.handler_nesting.load(Ordering::SeqCst)
    }

    /// Increments the refcount.
    pub fn acquire_ref(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the refcount; a no-op at zero (spec §5: "an already-zero
    /// refcount close call is a no-op").
    pub fn release_ref(&self) -> usize {
        let prev = self.refcount.load(Ordering::SeqCst);
        if prev == 0 {
            return 0;
        }
        self.refcount.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Current refcount.
    #[must_use]
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    /// The Device this Connection currently runs on.
    #[must_use]
    pub fn device(&self) -> Arc<Device> {
        Arc::clone(&self.device.lock())
    }

    /// The CQ this Connection currently posts to.
    #[must_use]
    pub fn cq(&self) -> Arc<CompletionQueue> {
        Arc::clone(&self.cq.lock())
    }

    /// Records the granted QP once `setup_qp` succeeds, initializing the
    /// primary pool from the negotiated depths (spec §4.3, §4.6).
    pub fn install_qp(&self, qp: QueuePair, membuf_sz: usize) {
        let attrs = qp.attrs;
        *self.depths.lock() = ConnDepths {
            sq_depth: attrs.sq_depth,
            rq_depth: attrs.rq_depth,
            actual_rq_depth: attrs.actual_rq_depth,
            max_sge: attrs.max_sge,
            max_inline_data: attrs.max_inline_data,
        };
        let device = self.device();
        let primary = PrimaryPool::new(
            &device,
            attrs.sq_depth as usize,
            attrs.actual_rq_depth as usize,
            membuf_sz,
            attrs.max_sge as usize,
            5,
        );
        *self.primary_pool.lock() = Some(primary);
        *self.qp.lock() = Some(qp);
    }

    /// Negotiated depths, valid once `install_qp` has run.
    #[must_use]
    pub fn depths(&self) -> ConnDepths {
        *self.depths.lock()
    }

    /// Posts the initial recv and sets `peer_credits = sim_peer_credits = 1`
    /// (spec §4.3).
    pub fn post_initial_handshake(&self) -> Result<()> {
        let pool = self.initial_pool.lock();
        let mut task = pool.alloc_task()?;
        task.owner = self.handle;
        self.lists.lock().list_mut(TaskList::InitialInUse).push(task);
        self.peer_credits.store(1, Ordering::SeqCst);
        self.sim_peer_credits.store(1, Ordering::SeqCst);
        Ok(())
    }

    /// Current `peer_credits`, asserted non-negative (spec §8 property 3).
    #[must_use]
    pub fn peer_credits(&self) -> i64 {
        self.peer_credits.load(Ordering::SeqCst)
    }

    /// Current `sim_peer_credits` (spec §6/§11: distinct from `peer_credits`).
    #[must_use]
    pub fn sim_peer_credits(&self) -> i64 {
        self.sim_peer_credits.load(Ordering::SeqCst)
    }

    /// Decrements `peer_credits` by one send; refuses at zero.
    pub fn consume_peer_credit(&self) -> Result<()> {
        let mut current = self.peer_credits.load(Ordering::SeqCst);
        loop {
            if current <= 0 {
                return Err(RdmaError::Fatal("peer_credits exhausted".into()));
            }
            match self.peer_credits.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Replenishes `peer_credits` by `n`, via an ack from the peer.
    pub fn replenish_peer_credits(&self, n: i64) {
        self.peer_credits.fetch_add(n, Ordering::SeqCst);
    }

    /// Moves a task into `which` list (e.g. after posting a send).
    pub fn move_task_into(&self, which: TaskList, task: Task) {
        self.lists.lock().list_mut(which).push(task);
    }

    /// Removes and returns the first task in `which` list matching `pred`.
    pub fn take_task_from(&self, which: TaskList, pred: impl Fn(&Task) -> bool) -> Option<Task> {
        let mut lists = self.lists.lock();
        let list = lists.list_mut(which);
        let idx = list.iter().position(pred)?;
        Some(list.remove(idx))
    }

    /// Total number of tasks currently held across all seven lists.
    #[must_use]
    pub fn tasks_in_flight(&self) -> usize {
        self.lists.lock().total_len()
    }

    /// Flushes all seven task lists, returning every task to its owning pool
    /// (spec §4.1 `TIMEWAIT_EXIT` handling).
    pub fn flush_all_tasks(&self) {
        let tasks = self.lists.lock().drain_all();
        let count = tasks.len();
        let initial_pool = self.initial_pool.lock();
        let primary_pool = self.primary_pool.lock();
        let phantom_pool = self.phantom_pool.lock();
        for task in tasks {
            match task.role {
                crate::task::TaskRole::Phantom => phantom_pool.task_pre_put(task),
                _ if primary_pool.is_some() => primary_pool.as_ref().unwrap().task_pre_put(task),
                _ => initial_pool.task_pre_put(task),
            }
        }
        info!("connection {:?}: flushed {count} tasks", self.handle);
    }

    /// Re-homes this Connection onto `new_device`: remaps every task with a
    /// mapped descriptor, records rkey translations, and swaps the stored
    /// device/lkey (spec §4.5).
    pub fn dup2(self: &Arc<Self>, new_device: Arc<Device>) -> Result<()> {
        let mut rkey_tbl = self.rkey_tbl.lock();
        let primary_pool = self.primary_pool.lock();
        let Some(primary_pool) = primary_pool.as_ref() else {
            *self.device.lock() = new_device;
            return Ok(());
        };
        let mut lists = self.lists.lock();
        for task in lists
            .tx_ready
            .iter_mut()
            .chain(lists.in_flight_send.iter_mut())
            .chain(lists.in_flight_recv.iter_mut())
            .chain(lists.rdma_in_flight.iter_mut())
            .chain(lists.io_submit.iter_mut())
        {
            if task.has_mapped_descriptor() {
                primary_pool.slab_remap_task(task, &new_device, &mut rkey_tbl)?;
            }
        }
        drop(lists);
        *self.device.lock() = new_device;
        info!("connection {:?}: migrated, rkey_tbl now has {} entries", self.handle, rkey_tbl.len());
        Ok(())
    }

    /// Translates an incoming message's peer-granted rkey (spec §4.5).
    pub fn translate_peer_rkey(&self, old_rkey: u32) -> Result<u32> {
        self.peer_rkey_tbl.lock().translate(old_rkey)
    }

    /// Records a peer rkey re-homed onto the current device.
    pub fn record_peer_rkey(&self, old_rkey: u32, new_rkey: u32) {
        self.peer_rkey_tbl.lock().record(old_rkey, new_rkey);
    }

    /// Whether `rdma_disconnect` has already been issued.
    #[must_use]
    pub fn disconnect_issued(&self) -> bool {
        self.disconnect_issued.load(Ordering::SeqCst)
    }

    fn mark_disconnect_issued(&self) {
        self.disconnect_issued.store(true, Ordering::SeqCst);
    }

    /// `connect()`: INIT -> CONNECTING (spec §4.1).
    pub fn begin_connect(&self) -> Result<()> {
        if self.state() != ConnState::Init {
            return Err(RdmaError::ConnectError("connect() called outside INIT".into()));
        }
        self.set_state(ConnState::Connecting);
        Ok(())
    }

    /// `listen()`: INIT -> LISTEN (spec §4.1).
    pub fn begin_listen(&self) -> Result<()> {
        if self.state() != ConnState::Init {
            return Err(RdmaError::ConnectError("listen() called outside INIT".into()));
        }
        self.set_state(ConnState::Listen);
        Ok(())
    }

    /// Local `close()` (spec §4.1): issues disconnect if CONNECTED, direct
    /// teardown if LISTEN.
    pub fn close(&self) {
        match self.state() {
            ConnState::Connected => {
                if !self.disconnect_issued() {
                    self.mark_disconnect_issued();
                    self.set_state(ConnState::Disconnecting);
                }
            }
            ConnState::Listen => {
                self.set_state(ConnState::Closed);
            }
            ConnState::Disconnected => {
                self.set_state(ConnState::Closed);
            }
            _ => {
                warn!("connection {:?}: close() called in state {:?}", self.handle, self.state());
            }
        }
    }
}

#[cfg(test)]
impl Connection {
    pub(crate) fn primary_pool_for_test(&self) -> parking_lot::MutexGuard<'_, Option<PrimaryPool>> {
        self.primary_pool.lock()
    }

    pub(crate) fn rkey_tbl_len_for_test(&self) -> usize {
        self.rkey_tbl.lock().len()
    }
}

impl CqAttachable for Connection {
    fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    fn force_flush(&self) {
        warn!("connection {:?}: force-flushed by CQ destruction", self.handle);
        self.flush_all_tasks();
    }
}
