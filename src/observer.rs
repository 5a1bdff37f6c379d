//! Observer events emitted to higher layers (spec §6).
//!
//! `Context`/`Observable` plumbing is an out-of-scope collaborator; this
//! module only defines the event vocabulary and a minimal fan-out registry in
//! the shape of `xio_observable`: a short list of registered observers per
//! event, not a single callback slot.

use std::fmt;

use crate::connection::ConnectionHandle;

/// Events a `Connection` notifies its observers of.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    /// A passive `Connection` accepted a new inbound request; `child` is its handle.
    NewConnection {
        /// Handle of the newly created child connection.
        child: ConnectionHandle,
    },
    /// The connection reached `CONNECTED`.
    Established,
    /// The peer rejected the connection.
    Refused {
        /// CM rejection reason code.
        reason: u32,
    },
    /// The connection reached `DISCONNECTED` (the peer tore down, or a local error did).
    Disconnected,
    /// The connection reached `CLOSED`.
    Closed,
    /// A failure occurred; `kind` names an `RdmaError` variant (see `RdmaError::kind_name`).
    Error {
        /// Error kind name.
        kind: &'static str,
        /// Human-readable detail.
        detail: String,
    },
}

impl fmt::Display for ObserverEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObserverEvent::NewConnection { child } => write!(f, "NEW_CONNECTION({child:?})"),
            ObserverEvent::Established => write!(f, "ESTABLISHED"),
            ObserverEvent::Refused { reason } => write!(f, "REFUSED(reason={reason})"),
            ObserverEvent::Disconnected => write!(f, "DISCONNECTED"),
            ObserverEvent::Closed => write!(f, "CLOSED"),
            ObserverEvent::Error { kind, detail } => write!(f, "ERROR({kind}: {detail})"),
        }
    }
}

/// A sink for `ObserverEvent`s raised by a `Connection`.
pub trait Observer: Send {
    /// Called synchronously from the CM dispatcher (or from `post_close`) when an
    /// event fires. Must not block or re-enter the dispatcher.
    fn notify(&mut self, handle: ConnectionHandle, event: ObserverEvent);
}

/// Fan-out registry of observers: a per-event observer list rather than a
/// single callback.
#[derive(Default)]
pub struct Observable {
    observers: Vec<Box<dyn Observer>>,
}

impl Observable {
    /// Creates an empty observer list.
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    /// Registers an observer.
    pub fn register(&mut self, observer: Box<dyn Observer>) {
        self.observers.push(observer);
    }

    /// Notifies every registered observer.
    pub fn notify_all(&mut self, handle: ConnectionHandle, event: ObserverEvent) {
        for observer in &mut self.observers {
            observer.notify(handle, event.clone());
        }
    }
}

impl fmt::Debug for Observable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHandle;

    struct Counter(usize);
    impl Observer for Counter {
        fn notify(&mut self, _handle: ConnectionHandle, _event: ObserverEvent) {
            self.0 += 1;
        }
    }

    #[test]
    fn fans_out_to_all_observers() {
        let mut observable = Observable::new();
        let calls = std::sync::Arc::new(parking_lot::Mutex::new(0usize));
        struct Recorder(std::sync::Arc<parking_lot::Mutex<usize>>);
        impl Observer for Recorder {
            fn notify(&mut self, _h: ConnectionHandle, _e: ObserverEvent) {
                *self.0.lock() += 1;
            }
        }
        observable.register(Box::new(Recorder(calls.clone())));
        observable.register(Box::new(Recorder(calls.clone())));
        observable.notify_all(ConnectionHandle(1), ObserverEvent::Established);
        assert_eq!(*calls.lock(), 2);
    }
}
