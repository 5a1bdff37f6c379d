//! `Context`: the execution-context/event-loop collaborator referenced
//! throughout spec §4–§5 (out of scope per spec §1, its internals are not
//! specified). This is a minimal stand-in sufficient to drive the core: one
//! thread draining an event channel (spec §5, "a Context corresponds to
//! exactly one execution thread"), used for two things the core depends on:
//!
//! - Posting deferred CM-id destruction (`post_close`, spec §4.1/§9) so it
//!   never runs from inside a CM handler.
//! - A `CLOSE` event that `CompletionQueue` registers against to self-release
//!   (spec §4.2).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::observer::{Observable, ObserverEvent};
use crate::spawner::{AbortSignal, SingleThreadTaskWorker, TaskTx};

static NEXT_CTX_ID: AtomicU64 = AtomicU64::new(1);

/// A task deferred onto a `Context`'s event channel.
pub(crate) enum ContextTask {
    /// Run this closure on the context's own thread (used for `post_close`).
    Run(Box<dyn FnOnce() + Send>),
}

struct ContextWorker;

impl SingleThreadTaskWorker for ContextWorker {
    type Task = ContextTask;

    fn process(&mut self, task: Self::Task) {
        match task {
            ContextTask::Run(f) => f(),
        }
    }
}

/// One execution context: a single thread, an identity used for CQ
/// comp-vector selection (spec §4.2), and a `CLOSE` observer fan-out.
pub struct Context {
    /// Used by `CompletionQueue::acquire` for `cpuid % cqs_used` vector selection.
    pub cpuid: usize,
    id: u64,
    tx: TaskTx<ContextTask>,
    abort: AbortSignal,
    close_observers: Arc<Mutex<Observable>>,
}

impl Context {
    /// Spawns a new context bound to `cpuid`.
    pub fn new(cpuid: usize) -> Self {
        let abort = AbortSignal::new();
        let tx = ContextWorker.spawn(&format!("rdma-ctx-{cpuid}"), abort.clone());
        Self {
            cpuid,
            id: NEXT_CTX_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            abort,
            close_observers: Arc::new(Mutex::new(Observable::new())),
        }
    }

    /// This context's identity, used to key shared CQs by (device, context)
    /// (spec §4.2).
    #[must_use]
    pub fn ctx_id(&self) -> u64 {
        self.id
    }

    /// Schedules `f` to run on this context's own thread, never from inside a
    /// CM handler (spec §4.1 handler-nesting rule, §9).
    pub fn post_close(&self, f: impl FnOnce() + Send + 'static) {
        debug!("context {}: scheduling deferred close", self.cpuid);
        self.tx.send(ContextTask::Run(Box::new(f)));
    }

    /// Registers an observer of this context's `CLOSE` event (e.g. a
    /// `CompletionQueue` releasing its Context-held refcount, spec §4.2).
    pub fn on_close(&self, observer: Box<dyn crate::observer::Observer>) {
        self.close_observers.lock().register(observer);
    }

    /// Fires the `CLOSE` event and stops the context's worker thread.
    pub fn close(&self) {
        self.close_observers.lock().notify_all(
            crate::connection::ConnectionHandle(0),
            ObserverEvent::Closed,
        );
        self.abort.abort();
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn post_close_runs_on_context_thread() {
        let ctx = Context::new(0);
        let done = Arc::new(AtomicBool::new(false));
        let done_c = Arc::clone(&done);
        ctx.post_close(move || done_c.store(true, Ordering::SeqCst));
        std::thread::sleep(Duration::from_millis(100));
        assert!(done.load(Ordering::SeqCst));
    }
}
