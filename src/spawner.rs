//! Single-thread task workers: a `Context` is modeled as exactly one
//! execution thread draining a channel (cooperative per-Context concurrency).

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use log::{error, info};

/// A worker that drains one task type on a dedicated thread.
pub(crate) trait SingleThreadTaskWorker {
    /// Task type processed by this worker.
    type Task;

    /// Handles one task.
    fn process(&mut self, task: Self::Task);

    /// Spawns the worker thread, returning a handle to send it tasks.
    fn spawn(mut self, name: &str, abort: AbortSignal) -> TaskTx<Self::Task>
    where
        Self: Sized + Send + 'static,
        Self::Task: Send + 'static,
    {
        let name = name.to_owned();
        let (tx, rx) = flume::unbounded::<Self::Task>();
        let _handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                info!("worker {name} running");
                loop {
                    match rx.recv_timeout(std::time::Duration::from_millis(50)) {
                        Ok(task) => self.process(task),
                        Err(flume::RecvTimeoutError::Timeout) => {
                            if abort.should_abort() {
                                break;
                            }
                        }
                        Err(flume::RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("worker {name} exited");
            })
            .expect("failed to spawn worker");

        TaskTx { inner: tx }
    }
}

/// Sending half of a worker's task channel.
pub(crate) struct TaskTx<T> {
    inner: flume::Sender<T>,
}

impl<T> TaskTx<T> {
    /// Enqueues a task. Panics if the worker thread has died: a dead worker
    /// thread is a programming error, not a recoverable condition.
    pub(crate) fn send(&self, task: T) {
        self.inner
            .send(task)
            .expect("failed to send task to channel");
    }
}

impl<T> Clone for TaskTx<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Cooperative abort flag shared between a worker thread and its owner.
#[derive(Debug, Clone)]
pub(crate) struct AbortSignal {
    inner: Arc<AtomicBool>,
}

impl AbortSignal {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(AtomicBool::new(false)),
        }
    }

    fn should_abort(&self) -> bool {
        self.inner.load(Ordering::Relaxed)
    }

    pub(crate) fn abort(&self) {
        self.inner.store(true, Ordering::Relaxed);
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}
