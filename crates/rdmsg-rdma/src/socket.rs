//! RDMA connected socket.
//!
//! [`RdmaConnectedSocket`] is the data-path endpoint handed to the
//! messenger. It pairs with a connection manager ([`crate::conn_mgr`]) that
//! drives establishment and teardown; the socket itself only stages sends,
//! drains receive completions, and reports state. The two halves can die in
//! either order: the socket disowns the manager on drop (`set_orphan`), and
//! the manager reaches the socket only through a weak back-reference.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rdmsg_net::{ConnectedSocket, ConnectionState, NetError};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::cm::CmConnMgr;
use crate::cm_event::PendingConnectionInfo;
use crate::conn_mgr::ConnMgr;
use crate::dispatcher::CompletionSink;
use crate::reactor::Reactor;
use crate::stack::RdmaEnv;
use crate::verbs::{WcStatus, WorkCompletion};

/// Receive-side state: queued completions, carried-over bytes from a
/// partially consumed chunk, and the graceful-close marker.
struct RxState {
    wc: VecDeque<WorkCompletion>,
    pending: BytesMut,
    peer_closed: bool,
}

/// State shared between the socket handle and its connection manager.
pub(crate) struct SocketCore {
    env: Arc<RdmaEnv>,
    mgr: OnceLock<Arc<dyn ConnMgr>>,
    local_qpn: AtomicU32,
    remote_qpn: AtomicU32,
    /// Sticky error; first fault wins and every later read reports it.
    error: Mutex<Option<NetError>>,
    closed: AtomicBool,
    close_notify: Notify,
    ready_notify: Notify,
    /// The readiness waiter is notified at most once per handshake
    /// outcome (success or terminal failure).
    waiter_notified: AtomicBool,
    rx: Mutex<RxState>,
    /// Bytes staged by `send(.., more = true)` awaiting a flush.
    staged: Mutex<BytesMut>,
}

impl SocketCore {
    pub(crate) fn new(env: Arc<RdmaEnv>) -> Arc<Self> {
        Arc::new(Self {
            env,
            mgr: OnceLock::new(),
            local_qpn: AtomicU32::new(0),
            remote_qpn: AtomicU32::new(0),
            error: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            ready_notify: Notify::new(),
            waiter_notified: AtomicBool::new(false),
            rx: Mutex::new(RxState {
                wc: VecDeque::new(),
                pending: BytesMut::new(),
                peer_closed: false,
            }),
            staged: Mutex::new(BytesMut::new()),
        })
    }

    pub(crate) fn set_mgr(&self, mgr: Arc<dyn ConnMgr>) {
        if self.mgr.set(mgr).is_err() {
            unreachable!("connection manager installed twice");
        }
    }

    fn mgr(&self) -> Option<&Arc<dyn ConnMgr>> {
        self.mgr.get()
    }

    pub(crate) fn set_local_qpn(&self, qpn: u32) {
        self.local_qpn.store(qpn, Ordering::Release);
    }

    pub(crate) fn local_qpn(&self) -> u32 {
        self.local_qpn.load(Ordering::Acquire)
    }

    pub(crate) fn set_remote_qpn(&self, qpn: u32) {
        self.remote_qpn.store(qpn, Ordering::Release);
    }

    pub(crate) fn remote_qpn(&self) -> u32 {
        self.remote_qpn.load(Ordering::Acquire)
    }

    /// Record a terminal fault. The first fault wins; later ones are
    /// logged and dropped. Wakes anyone waiting on readiness.
    pub(crate) fn fail(&self, err: NetError) {
        debug_assert!(err.is_fault());
        {
            let mut error = self.error.lock();
            if let Some(existing) = error.as_ref() {
                trace!(%err, sticky = %existing, "fault after fault ignored");
            } else {
                debug!(%err, "socket fault");
                *error = Some(err);
            }
        }
        self.notify_ready();
    }

    pub(crate) fn has_error(&self) -> bool {
        self.error.lock().is_some()
    }

    fn sticky_error(&self) -> Option<NetError> {
        self.error.lock().clone()
    }

    /// Peer-initiated teardown: record the reset unless a more specific
    /// fault already stuck, and run the local close signaling.
    pub(crate) fn abort_connection(&self) {
        if !self.has_error() {
            self.fail(NetError::UnexpectedDisconnect);
        }
        self.mark_closed();
    }

    /// Flag the socket closed and wake both close and readiness waiters.
    /// Returns whether this call did the transition.
    pub(crate) fn mark_closed(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.close_notify.notify_waiters();
        self.notify_ready();
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wake a task waiting in `ready()`. Fires at most once; the outcome
    /// itself is published through the connection state and sticky error
    /// before this is called.
    pub(crate) fn notify_ready(&self) {
        if !self.waiter_notified.swap(true, Ordering::AcqRel) {
            self.ready_notify.notify_waiters();
        }
    }

    async fn wait_closed(&self) {
        loop {
            let notified = self.close_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Wait until the handshake resolves one way or the other.
    async fn ready(&self) -> Result<(), NetError> {
        loop {
            let notified = self.ready_notify.notified();
            match self.connection_state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed(errno) => {
                    return Err(self
                        .sticky_error()
                        .unwrap_or(NetError::ConnectFailure(format!("errno {errno}"))));
                }
                ConnectionState::NotConnected if self.is_closed() => {
                    return Err(NetError::Closed);
                }
                ConnectionState::NotConnected => {}
            }
            notified.await;
        }
    }

    fn connection_state(&self) -> ConnectionState {
        self.mgr()
            .map_or(ConnectionState::NotConnected, |m| m.connection_state())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, NetError> {
        let mut rx = self.rx.lock();

        // Pull anything the dispatcher has not pushed yet.
        let polled = self
            .env
            .device
            .poll_recv(self.local_qpn(), self.env.config.poll_batch);
        rx.wc.extend(polled);

        let mut read = 0;

        // Carried-over bytes from a previously half-consumed chunk first.
        if !rx.pending.is_empty() {
            let n = rx.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&rx.pending.split_to(n));
            read += n;
        }

        while read < buf.len() {
            let Some(wc) = rx.wc.pop_front() else {
                break;
            };
            match wc.status {
                WcStatus::Error => {
                    drop(rx);
                    self.fail(NetError::UnexpectedDisconnect);
                    rx = self.rx.lock();
                }
                WcStatus::Success if wc.byte_len == 0 => {
                    // Zero-length completion: graceful close from the peer.
                    rx.peer_closed = true;
                }
                WcStatus::Success => {
                    let Some(chunk) = self.env.device.take_recv_chunk(wc.wr_id) else {
                        continue;
                    };
                    let data = &chunk.data[..wc.byte_len as usize];
                    let n = data.len().min(buf.len() - read);
                    buf[read..read + n].copy_from_slice(&data[..n]);
                    read += n;
                    if n < data.len() {
                        rx.pending.extend_from_slice(&data[n..]);
                    }
                    self.env.device.release_recv_chunk(chunk);
                }
            }
        }

        if read > 0 {
            return Ok(read);
        }
        if let Some(err) = self.sticky_error() {
            return Err(err);
        }
        if rx.peer_closed {
            return Ok(0);
        }
        drop(rx);
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        Err(NetError::WouldBlock)
    }

    fn send(&self, data: Bytes, more: bool) -> Result<usize, NetError> {
        let mgr = self.mgr().ok_or(NetError::NotConnected)?;
        if !mgr.is_active() {
            // Nothing is staged or transmitted before the connection is up.
            return Err(NetError::NotConnected);
        }
        if let Some(err) = self.sticky_error() {
            return Err(err);
        }

        let accepted = data.len();
        let mut staged = self.staged.lock();
        staged.extend_from_slice(&data);
        if more {
            return Ok(accepted);
        }

        let mut out = staged.split();
        drop(staged);
        let limit = self.env.config.send_buf_size as usize;
        while !out.is_empty() {
            let n = out.len().min(limit);
            mgr.post_send(out.split_to(n).freeze())?;
        }
        Ok(accepted)
    }

    fn release_queued_chunks(&self) {
        let mut rx = self.rx.lock();
        while let Some(wc) = rx.wc.pop_front() {
            if wc.status == WcStatus::Success && wc.byte_len > 0 {
                if let Some(chunk) = self.env.device.take_recv_chunk(wc.wr_id) {
                    self.env.device.release_recv_chunk(chunk);
                }
            }
        }
    }
}

impl CompletionSink for SocketCore {
    fn qp_number(&self) -> u32 {
        self.local_qpn()
    }

    fn pass_wc(&self, wc: Vec<WorkCompletion>) {
        if self.is_closed() {
            // Hand the buffers straight back; nobody will read them.
            for c in wc {
                if c.status == WcStatus::Success && c.byte_len > 0 {
                    if let Some(chunk) = self.env.device.take_recv_chunk(c.wr_id) {
                        self.env.device.release_recv_chunk(chunk);
                    }
                }
            }
            return;
        }
        self.rx.lock().wc.extend(wc);
    }
}

impl Drop for SocketCore {
    fn drop(&mut self) {
        self.release_queued_chunks();
    }
}

/// The public connected-socket handle.
pub struct RdmaConnectedSocket {
    core: Arc<SocketCore>,
}

impl RdmaConnectedSocket {
    /// Start an outbound connection toward `peer`.
    ///
    /// Returns immediately after the handshake is initiated; await
    /// [`ready`](Self::ready) for the outcome.
    pub fn connect(
        env: Arc<RdmaEnv>,
        reactor: Arc<Reactor>,
        peer: SocketAddr,
    ) -> Result<Self, NetError> {
        let core = SocketCore::new(Arc::clone(&env));
        let mgr = CmConnMgr::new_client(env.clone(), reactor, Arc::downgrade(&core))?;
        core.set_mgr(mgr.clone());
        let timeout = env.config.addr_resolve_timeout_ms;
        if let Err(err) = mgr.try_connect(peer, timeout) {
            mgr.set_orphan();
            mgr.cleanup();
            return Err(err);
        }
        Ok(Self { core })
    }

    /// Wrap an inbound connection handed over by the listener.
    pub(crate) fn accepted(
        env: Arc<RdmaEnv>,
        reactor: Arc<Reactor>,
        info: PendingConnectionInfo,
    ) -> Result<Self, NetError> {
        let core = SocketCore::new(Arc::clone(&env));
        let mgr = CmConnMgr::new_server(env, reactor, Arc::downgrade(&core), info)?;
        core.set_mgr(mgr);
        Ok(Self { core })
    }

    /// Wait until the connection is established or has failed.
    pub async fn ready(&self) -> Result<(), NetError> {
        self.core.ready().await
    }

    /// Fire-and-forget close, for abandoning a connection whose setup
    /// failed partway. The manager's own retirement event completes the
    /// cleanup.
    pub(crate) fn teardown(&self) {
        if let Some(mgr) = self.core.mgr() {
            mgr.close();
        }
    }

    pub fn local_qpn(&self) -> u32 {
        self.core.local_qpn()
    }

    pub fn remote_qpn(&self) -> u32 {
        self.core.remote_qpn()
    }
}

#[async_trait]
impl ConnectedSocket for RdmaConnectedSocket {
    fn read(&self, buf: &mut [u8]) -> Result<usize, NetError> {
        self.core.read(buf)
    }

    fn send(&self, data: Bytes, more: bool) -> Result<usize, NetError> {
        self.core.send(data, more)
    }

    fn connection_state(&self) -> ConnectionState {
        self.core.connection_state()
    }

    fn shutdown(&self) {
        if let Some(mgr) = self.core.mgr() {
            mgr.shutdown();
        }
    }

    async fn close(&self) {
        let Some(mgr) = self.core.mgr() else {
            self.core.mark_closed();
            return;
        };
        mgr.close();
        self.core.wait_closed().await;
    }
}

impl Drop for RdmaConnectedSocket {
    fn drop(&mut self) {
        if let Some(mgr) = self.core.mgr() {
            mgr.set_orphan();
        }
    }
}

impl fmt::Display for RdmaConnectedSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RdmaConnectedSocket(qpn {} -> {})",
            self.local_qpn(),
            self.remote_qpn()
        )
    }
}
