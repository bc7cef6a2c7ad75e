//! Connection-manager base contract.
//!
//! A connection manager owns the native handshake session and the hardware
//! queue pair for one connection, and shares its lifetime with the connected
//! socket. The capability set is closed: the CM-protocol-backed manager in
//! [`crate::cm`] is the only variant today, but the seam anticipates other
//! establishment backends.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use rdmsg_net::{ConnectionState, NetError};
use tracing::{debug, trace};

use crate::dispatcher::Counter;
use crate::reactor::Reactor;
use crate::socket::SocketCore;
use crate::stack::RdmaEnv;
use crate::verbs::QueuePair;

/// The two events that must both occur before the manager's hardware
/// resources may be torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseEvent {
    /// The socket has disowned the manager (`set_orphan`).
    SocketDisowned,
    /// The native teardown handshake completed (timewait exit).
    QueuePairRetired,
}

/// Release gate for the manager's owned resources.
///
/// Starts at two. Each of the [`ReleaseEvent`]s releases exactly once; the
/// queue pair is destroyed when the count reaches zero, and only then. The
/// manager's memory itself is `Arc`-owned; this gate orders resource
/// teardown, not deallocation.
pub(crate) struct ReleaseCount(AtomicUsize);

impl ReleaseCount {
    pub(crate) fn new() -> Self {
        Self(AtomicUsize::new(2))
    }

    /// Release one reference; returns the remaining count.
    pub(crate) fn release(&self) -> usize {
        let prev = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release past zero");
        prev.saturating_sub(1)
    }

    pub(crate) fn remaining(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Capability set of a connection manager.
pub trait ConnMgr: Send + Sync + 'static {
    /// Start an outbound handshake toward `peer`. The result arrives
    /// asynchronously through the socket's readiness notification.
    fn try_connect(&self, peer: SocketAddr, timeout_ms: u32) -> Result<(), NetError>;

    /// Mark the manager non-active and move the queue pair to the error
    /// state so in-flight work drains. Never fabricates new traffic.
    fn shutdown(&self);

    /// Release the queue pair and signal the socket's close path. Safe to
    /// call multiple times.
    fn close(&self);

    /// Deregister event interest. Runs on the owning reactor.
    fn cleanup(&self);

    /// Clear the back-reference to the socket and release the socket's
    /// hold on the manager. Called when the socket side is destroyed first.
    fn set_orphan(&self);

    fn connection_state(&self) -> ConnectionState;

    /// Whether the queue pair is usable for posting work.
    fn is_active(&self) -> bool;

    /// Locally assigned queue-pair number, zero before allocation.
    fn local_qpn(&self) -> u32;

    /// Post one send work request on the active queue pair.
    fn post_send(&self, data: Bytes) -> Result<(), NetError>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// State shared by every connection-manager variant.
pub(crate) struct MgrCore {
    pub(crate) env: Arc<RdmaEnv>,
    pub(crate) reactor: Arc<Reactor>,
    /// Non-owning back-reference to the socket; cleared on orphaning.
    socket: Mutex<Weak<SocketCore>>,
    orphaned: AtomicBool,
    releases: ReleaseCount,
    qp: Mutex<Option<Box<dyn QueuePair>>>,
    pub(crate) is_server: bool,
    active: AtomicBool,
    /// Tri-state: 0 = not yet connected, 1 = connected, negative errno on
    /// failure.
    connected: AtomicI32,
}

impl MgrCore {
    pub(crate) fn new(
        env: Arc<RdmaEnv>,
        reactor: Arc<Reactor>,
        socket: Weak<SocketCore>,
        is_server: bool,
    ) -> Self {
        Self {
            env,
            reactor,
            socket: Mutex::new(socket),
            orphaned: AtomicBool::new(false),
            releases: ReleaseCount::new(),
            qp: Mutex::new(None),
            is_server,
            active: AtomicBool::new(false),
            connected: AtomicI32::new(0),
        }
    }

    /// Resolve the back-reference, unless the socket has been disowned.
    pub(crate) fn socket(&self) -> Option<Arc<SocketCore>> {
        if self.orphaned.load(Ordering::Acquire) {
            return None;
        }
        self.socket.lock().upgrade()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn connection_state(&self) -> ConnectionState {
        match self.connected.load(Ordering::Acquire) {
            0 => ConnectionState::NotConnected,
            1 => ConnectionState::Connected,
            n => ConnectionState::Failed(-n),
        }
    }

    pub(crate) fn set_failed(&self, errno: i32) {
        self.connected.store(-errno.abs(), Ordering::Release);
    }

    pub(crate) fn set_disconnected(&self) {
        self.connected.store(0, Ordering::Release);
    }

    pub(crate) fn install_qp(&self, qp: Box<dyn QueuePair>) {
        *self.qp.lock() = Some(qp);
    }

    pub(crate) fn local_qpn(&self) -> u32 {
        self.qp.lock().as_ref().map_or(0, |qp| qp.qp_number())
    }

    /// Transition the queue pair to its operational state and mark the
    /// connection established. Idempotent against duplicate activation.
    pub(crate) fn activate(&self, remote_qpn: u32) -> Result<(), NetError> {
        if self.connected.load(Ordering::Acquire) == 1 {
            trace!("duplicate activation ignored");
            return Ok(());
        }
        {
            let qp = self.qp.lock();
            let qp = qp.as_ref().ok_or(NetError::NotConnected)?;
            qp.to_ready(remote_qpn)?;
        }
        self.active.store(true, Ordering::Release);
        self.connected.store(1, Ordering::Release);
        Ok(())
    }

    /// Stop posting: clear `active` and move the queue pair to the error
    /// state so in-flight work drains.
    pub(crate) fn shutdown(&self) {
        self.active.store(false, Ordering::Release);
        if let Some(qp) = self.qp.lock().as_ref() {
            qp.to_error();
        }
    }

    pub(crate) fn post_send(&self, data: Bytes) -> Result<(), NetError> {
        if !self.is_active() {
            return Err(NetError::NotConnected);
        }
        let qp = self.qp.lock();
        let qp = qp.as_ref().ok_or(NetError::NotConnected)?;
        qp.post_send(data)
    }

    /// Record one of the two release events; destroys the queue pair when
    /// both have occurred.
    pub(crate) fn release(&self, event: ReleaseEvent) {
        let remaining = self.releases.release();
        debug!(?event, remaining, "connection manager release");
        if remaining == 0 {
            self.destroy_qp();
        }
    }

    pub(crate) fn releases_remaining(&self) -> usize {
        self.releases.remaining()
    }

    /// Clear the back-reference and release the socket's hold. Returns
    /// whether this call was the one that orphaned the manager.
    pub(crate) fn orphan(&self) -> bool {
        if self.orphaned.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.socket.lock() = Weak::new();
        self.release(ReleaseEvent::SocketDisowned);
        true
    }

    fn destroy_qp(&self) {
        let qp = self.qp.lock().take();
        if let Some(qp) = qp {
            let qpn = qp.qp_number();
            self.env.dispatcher.deregister_qp(qpn);
            self.env.dispatcher.counter_dec(Counter::QpActive);
            self.env.dispatcher.counter_inc(Counter::QpDestroyed);
            debug!(qpn, "queue pair destroyed");
            drop(qp);
        }
    }
}
