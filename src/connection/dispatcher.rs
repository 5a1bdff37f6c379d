//! `CMEventDispatcher`: the single entry point for CM events, implementing
//! the per-state transition table (spec §4.1).

use std::sync::Arc;

use log::{error, info, warn};

use crate::context::Context;
use crate::cq::CqAttachable;
use crate::device::registry::DeviceRegistry;
use crate::device::{Device, DeviceKey};
use crate::error::{RdmaError, Result};
use crate::observer::ObserverEvent;
use crate::qp::{self, QpManager};

use super::{ConnState, Connection, ConnectionHandle};

/// CM events driving a Connection's state machine (spec §4.1).
#[derive(Debug, Clone)]
pub enum CmEvent {
    /// `rdma_resolve_addr` completed.
    AddrResolved,
    /// `rdma_resolve_route` completed.
    RouteResolved { device_key: DeviceKey },
    /// The handshake completed; the connection is usable.
    Established,
    /// The peer rejected the connection.
    Rejected {
        /// CM rejection reason code.
        reason: u32,
    },
    /// Address resolution failed or timed out.
    AddrError(String),
    /// Route resolution failed or timed out.
    RouteError(String),
    /// A generic connect failure during the CM handshake.
    ConnectError(String),
    /// The peer is unreachable.
    Unreachable,
    /// An inbound connect request arrived on a LISTEN connection.
    ConnectRequest {
        /// Device/port the request arrived on.
        device_key: DeviceKey,
        /// Peer's proposed responder-resources value.
        peer_responder_resources: u32,
        /// Peer's proposed initiator-depth value.
        peer_initiator_depth: u32,
    },
    /// The peer disconnected, or the local address changed.
    Disconnected,
    /// The local address changed underneath an established connection.
    AddrChange,
    /// The CM framework's TIME_WAIT period elapsed; CM-id may now be destroyed.
    TimewaitExit,
    /// The underlying device is being removed from the system.
    DeviceRemoval,
}

/// What the dispatcher did with one event: the CM-framework return code
/// (spec §4.1: 1 only for `TIMEWAIT_EXIT`, else 0) and, for `CONNECT_REQUEST`,
/// the newly created child Connection.
pub struct DispatchOutcome {
    /// Value to return to the CM framework (0, or 1 meaning "may destroy id").
    pub return_code: u8,
    /// The child Connection created by an inbound `CONNECT_REQUEST`.
    pub child: Option<Arc<Connection>>,
}

impl DispatchOutcome {
    fn plain() -> Self {
        Self {
            return_code: 0,
            child: None,
        }
    }
}

/// Dispatches one CM event to `conn`, serialized by `conn`'s own
/// `handler_nesting` counter (spec §4.1, §5, §9).
#[allow(clippy::too_many_arguments)]
pub fn dispatch(
    conn: &Arc<Connection>,
    event: CmEvent,
    ctx: &Context,
    registry: &DeviceRegistry,
    qp_manager: &mut QpManager,
    membuf_sz: usize,
    online_cpus: u32,
    next_child_handle: impl FnOnce() -> ConnectionHandle,
) -> Result<DispatchOutcome> {
    conn.enter_handler();
    let outcome = dispatch_inner(conn, event, ctx, registry, qp_manager, membuf_sz, online_cpus, next_child_handle);
    conn.exit_handler();
    outcome
}

#[allow(clippy::too_many_arguments, clippy::too_many_lines)]
fn dispatch_inner(
    conn: &Arc<Connection>,
    event: CmEvent,
    ctx: &Context,
    registry: &DeviceRegistry,
    qp_manager: &mut QpManager,
    membuf_sz: usize,
    online_cpus: u32,
    next_child_handle: impl FnOnce() -> ConnectionHandle,
) -> Result<DispatchOutcome> {
    use CmEvent as E;
    use ConnState as S;

    let state = conn.state();
    match (state, event) {
        (S::Connecting, E::AddrResolved) => {
            // resolve_route(timeout=ROUTE_TO) is issued by the CM-framework
            // binding (out of scope); state remains CONNECTING.
            Ok(DispatchOutcome::plain())
        }

        (S::Connecting, E::RouteResolved { device_key }) => {
            let device = registry.lookup(device_key)?;
            setup_connection_qp(conn, &device, qp_manager, membuf_sz)?;
            info!("connection {:?}: QP built, issuing rdma_connect", conn.handle);
            Ok(DispatchOutcome::plain())
        }

        (S::Connecting, E::Established) => {
            conn.post_initial_handshake()?;
            conn.set_state(S::Connected);
            conn.notify(ObserverEvent::Established);
            Ok(DispatchOutcome::plain())
        }

        (S::Connecting, E::Rejected { reason }) => {
            conn.set_state(S::Disconnected);
            conn.notify(ObserverEvent::Refused { reason });
            Ok(DispatchOutcome::plain())
        }

        (S::Connecting | S::Connected, E::AddrError(detail)) => {
            notify_error(conn, RdmaError::AddrError(detail));
            Ok(DispatchOutcome::plain())
        }
        (S::Connecting | S::Connected, E::RouteError(detail)) => {
            notify_error(conn, RdmaError::RouteError(detail));
            Ok(DispatchOutcome::plain())
        }
        (S::Connecting | S::Connected, E::ConnectError(detail)) => {
            notify_error(conn, RdmaError::ConnectError(detail));
            Ok(DispatchOutcome::plain())
        }
        (S::Connecting | S::Connected, E::Unreachable) => {
            notify_error(conn, RdmaError::Unreachable);
            Ok(DispatchOutcome::plain())
        }

        (S::Listen, E::ConnectRequest { device_key, peer_responder_resources, peer_initiator_depth }) => {
            let device = registry.lookup(device_key)?;
            let child = Connection::new(next_child_handle(), Arc::clone(&device), ctx, online_cpus);
            let _ = clamp_accept(&device, peer_responder_resources, peer_initiator_depth);
            setup_connection_qp(&child, &device, qp_manager, membuf_sz)?;
            child.set_state(S::Connecting);
            conn.notify(ObserverEvent::NewConnection { child: child.handle });
            Ok(DispatchOutcome {
                return_code: 0,
                child: Some(child),
            })
        }

        (S::Connected | S::Listen, E::Disconnected | E::AddrChange) => {
            if !conn.disconnect_issued() {
                conn.mark_disconnect_issued();
            }
            conn.set_state(S::Disconnecting);
            Ok(DispatchOutcome::plain())
        }

        (_, E::TimewaitExit) => {
            conn.flush_all_tasks();
            let next = match state {
                S::Disconnected => {
                    conn.notify(ObserverEvent::Disconnected);
                    S::Disconnected
                }
                S::Closed => {
                    conn.notify(ObserverEvent::Closed);
                    S::Destroyed
                }
                other => other,
            };
            conn.set_state(next);
            if next == S::Destroyed {
                let conn_for_close = Arc::clone(conn);
                ctx.post_close(move || {
                    info!("connection {:?}: CM-id destroyed on context thread", conn_for_close.handle);
                });
                return Ok(DispatchOutcome {
                    return_code: 1,
                    child: None,
                });
            }
            Ok(DispatchOutcome::plain())
        }

        (_, E::DeviceRemoval) => {
            registry.remove(conn.device().key());
            warn!("connection {:?}: device removed, CQ left to lazily flush", conn.handle);
            Ok(DispatchOutcome::plain())
        }

        (other_state, other_event) => {
            error!("connection {:?}: event {other_event:?} not valid in state {other_state:?}");
            Err(RdmaError::Fatal(format!(
                "invalid CM event {other_event:?} in state {other_state:?}"
            )))
        }
    }
}

fn setup_connection_qp(
    conn: &Arc<Connection>,
    device: &Arc<Device>,
    qp_manager: &mut QpManager,
    membuf_sz: usize,
) -> Result<()> {
    let cq = conn.cq();
    let sq_depth = 128;
    let rq_depth = 128;
    let max_out_iovsz = 5;
    let built = qp::setup_qp(qp_manager, device, Arc::clone(&cq), sq_depth, rq_depth, max_out_iovsz)?;
    let weak: std::sync::Weak<dyn CqAttachable> = Arc::downgrade(conn);
    cq.attach(weak);
    conn.install_qp(built, membuf_sz);
    Ok(())
}

fn notify_error(conn: &Arc<Connection>, err: RdmaError) {
    conn.set_state(ConnState::Disconnected);
    conn.notify(ObserverEvent::Error {
        kind: err.kind_name(),
        detail: err.to_string(),
    });
}

/// `accept()` policy: clamp the peer's proposed depths to this device's
/// capabilities (spec §4.1 `accept() policy`).
#[must_use]
pub fn clamp_accept(device: &Arc<Device>, peer_responder_resources: u32, peer_initiator_depth: u32) -> (u32, u32) {
    let attr = device.attr();
    (
        peer_responder_resources.min(attr.max_qp_rd_atom),
        peer_initiator_depth.min(attr.max_qp_init_rd_atom),
    )
}

