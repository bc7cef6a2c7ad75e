//! In-memory fabric.
//!
//! [`SimFabric`] implements all three collaborator seams (provider,
//! device, and dispatcher) over channels and maps, with no hardware
//! involved. It models the parts of the native stack the connection layer
//! depends on: the event-driven handshake including both teardown events,
//! queue-pair numbering, receive-buffer ownership, and completion routing.
//! Fault injection hooks let tests drive every failure leg of the
//! handshake.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use rdmsg_net::NetError;
use tokio::sync::mpsc;
use tracing::trace;

use crate::cm_event::{
    CmEvent, CmEventKind, CmEventStream, CmId, CmProvider, ConnParam, IncomingId,
};
use crate::config::RdmaCmConfig;
use crate::dispatcher::{CompletionSink, Counter, Dispatcher};
use crate::stack::RdmaEnv;
use crate::verbs::{QueuePair, RdmaDevice, RecvChunk, WcStatus, WorkCompletion};

const QPN_BASE: u32 = 0x100;
const EPHEMERAL_BASE: u16 = 49152;

fn counter_idx(counter: Counter) -> usize {
    match counter {
        Counter::QpCreated => 0,
        Counter::QpActive => 1,
        Counter::QpDestroyed => 2,
        Counter::HandshakeErrors => 3,
    }
}

pub struct SimFabric {
    weak: Weak<SimFabric>,
    listeners: DashMap<SocketAddr, mpsc::UnboundedSender<CmEvent>>,
    next_qpn: AtomicU32,
    next_wr: AtomicU64,
    next_port: AtomicU16,
    /// Delivered receive buffers, keyed by work-request id, until the
    /// reader takes them.
    chunks: DashMap<u64, Bytes>,
    outstanding: AtomicI64,
    /// Completions for queue pairs with no registered sink yet.
    rx_queues: DashMap<u32, Mutex<VecDeque<WorkCompletion>>>,
    sinks: DashMap<u32, Arc<dyn CompletionSink>>,
    /// local qpn -> remote qpn, recorded at queue-pair activation.
    links: DashMap<u32, u32>,
    counters: [AtomicI64; 4],
    // Fault injection.
    unreachable: DashSet<SocketAddr>,
    route_fail: AtomicBool,
    reject_all: AtomicBool,
    fail_qp_alloc: AtomicBool,
    fail_accept: AtomicBool,
}

impl SimFabric {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            listeners: DashMap::new(),
            next_qpn: AtomicU32::new(QPN_BASE),
            next_wr: AtomicU64::new(1),
            next_port: AtomicU16::new(EPHEMERAL_BASE),
            chunks: DashMap::new(),
            outstanding: AtomicI64::new(0),
            rx_queues: DashMap::new(),
            sinks: DashMap::new(),
            links: DashMap::new(),
            counters: Default::default(),
            unreachable: DashSet::new(),
            route_fail: AtomicBool::new(false),
            reject_all: AtomicBool::new(false),
            fail_qp_alloc: AtomicBool::new(false),
            fail_accept: AtomicBool::new(false),
        })
    }

    /// Bundle this fabric into an environment for sockets and listeners.
    pub fn env(self: &Arc<Self>, config: RdmaCmConfig) -> Arc<RdmaEnv> {
        RdmaEnv::new(
            Arc::clone(self) as Arc<dyn CmProvider>,
            Arc::clone(self) as Arc<dyn RdmaDevice>,
            Arc::clone(self) as Arc<dyn Dispatcher>,
            config,
        )
    }

    /// Make address resolution toward `addr` fail.
    pub fn set_unreachable(&self, addr: SocketAddr) {
        self.unreachable.insert(addr);
    }

    /// Make route resolution fail for every connection.
    pub fn fail_routes(&self, fail: bool) {
        self.route_fail.store(fail, Ordering::Release);
    }

    /// Reject every connect request before it reaches a listener.
    pub fn reject_connects(&self, reject: bool) {
        self.reject_all.store(reject, Ordering::Release);
    }

    /// Make queue-pair allocation fail.
    pub fn fail_qp_alloc(&self, fail: bool) {
        self.fail_qp_alloc.store(fail, Ordering::Release);
    }

    /// Make the accept reply fail.
    pub fn fail_accepts(&self, fail: bool) {
        self.fail_accept.store(fail, Ordering::Release);
    }

    pub fn counter_value(&self, counter: Counter) -> i64 {
        self.counters[counter_idx(counter)].load(Ordering::Acquire)
    }

    /// Receive buffers delivered to readers and not yet handed back.
    pub fn outstanding_chunks(&self) -> i64 {
        self.outstanding.load(Ordering::Acquire)
    }

    fn new_id(&self) -> (Arc<SimCmId>, CmEventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Arc::new(SimCmId {
            fabric: self.weak.clone(),
            tx,
            inner: Mutex::new(IdInner::default()),
        });
        (id, rx)
    }

    /// Deliver one completion to `qpn`: straight to its sink when one is
    /// registered, queued for polling otherwise.
    fn deliver_wc(&self, qpn: u32, wc: WorkCompletion) {
        if let Some(sink) = self.sinks.get(&qpn) {
            sink.pass_wc(vec![wc]);
            return;
        }
        self.rx_queues
            .entry(qpn)
            .or_insert_with(|| Mutex::new(VecDeque::new()))
            .lock()
            .push_back(wc);
    }

    fn deliver_data(&self, qpn: u32, data: Bytes) {
        let wr_id = self.next_wr.fetch_add(1, Ordering::AcqRel);
        let byte_len = data.len() as u32;
        self.chunks.insert(wr_id, data);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.deliver_wc(
            qpn,
            WorkCompletion {
                wr_id,
                byte_len,
                status: WcStatus::Success,
            },
        );
    }
}

impl CmProvider for SimFabric {
    fn create_id(&self) -> Result<(Arc<dyn CmId>, CmEventStream), NetError> {
        let (id, rx) = self.new_id();
        Ok((id as Arc<dyn CmId>, rx))
    }
}

impl RdmaDevice for SimFabric {
    fn create_queue_pair(&self, _id: &dyn CmId) -> Result<Box<dyn QueuePair>, NetError> {
        if self.fail_qp_alloc.load(Ordering::Acquire) {
            return Err(NetError::ResourceAllocationFailure(
                "simulated queue-pair exhaustion".into(),
            ));
        }
        Ok(Box::new(SimQueuePair {
            fabric: self.weak.clone(),
            qpn: self.next_qpn.fetch_add(1, Ordering::AcqRel),
            errored: AtomicBool::new(false),
        }))
    }

    fn take_recv_chunk(&self, wr_id: u64) -> Option<RecvChunk> {
        self.chunks.remove(&wr_id).map(|(_, data)| RecvChunk { wr_id, data })
    }

    fn release_recv_chunk(&self, chunk: RecvChunk) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        drop(chunk);
    }

    fn poll_recv(&self, qpn: u32, max: usize) -> Vec<WorkCompletion> {
        let Some(queue) = self.rx_queues.get(&qpn) else {
            return Vec::new();
        };
        let mut queue = queue.lock();
        let n = queue.len().min(max);
        queue.drain(..n).collect()
    }
}

impl Dispatcher for SimFabric {
    fn register_qp(&self, qpn: u32, sink: Arc<dyn CompletionSink>) {
        self.sinks.insert(qpn, sink);
    }

    fn deregister_qp(&self, qpn: u32) {
        self.sinks.remove(&qpn);
        self.rx_queues.remove(&qpn);
        self.links.remove(&qpn);
    }

    fn counter_inc(&self, counter: Counter) {
        self.counters[counter_idx(counter)].fetch_add(1, Ordering::AcqRel);
    }

    fn counter_dec(&self, counter: Counter) {
        self.counters[counter_idx(counter)].fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
struct IdInner {
    bound: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    /// The other endpoint's event channel, once a connect request has
    /// paired the two identifiers.
    peer_tx: Option<mpsc::UnboundedSender<CmEvent>>,
    qpn: u32,
    disconnected: bool,
    listening: bool,
}

struct SimCmId {
    fabric: Weak<SimFabric>,
    tx: mpsc::UnboundedSender<CmEvent>,
    inner: Mutex<IdInner>,
}

impl SimCmId {
    fn fabric(&self) -> Result<Arc<SimFabric>, NetError> {
        self.fabric
            .upgrade()
            .ok_or(NetError::NotConnected)
    }

    fn emit(&self, ev: CmEvent) {
        // A dropped receiver means the endpoint is gone; nothing to tell.
        let _ = self.tx.send(ev);
    }
}

impl CmId for SimCmId {
    fn bind(&self, mut addr: SocketAddr) -> Result<SocketAddr, NetError> {
        let fabric = self.fabric()?;
        if addr.port() == 0 {
            addr.set_port(fabric.next_port.fetch_add(1, Ordering::AcqRel));
        }
        self.inner.lock().bound = Some(addr);
        Ok(addr)
    }

    fn listen(&self, _backlog: u32) -> Result<(), NetError> {
        let fabric = self.fabric()?;
        let Some(addr) = self.inner.lock().bound else {
            return Err(NetError::Listen("listen before bind".into()));
        };
        let registered = match fabric.listeners.entry(addr) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(self.tx.clone());
                true
            }
        };
        if !registered {
            return Err(NetError::Listen(format!("{addr} already in use")));
        }
        self.inner.lock().listening = true;
        Ok(())
    }

    fn resolve_addr(&self, dst: SocketAddr, _timeout_ms: u32) -> Result<(), NetError> {
        let fabric = self.fabric()?;
        self.inner.lock().peer = Some(dst);
        if fabric.unreachable.contains(&dst) {
            self.emit(CmEvent::with_status(CmEventKind::AddrError, 113));
        } else {
            self.emit(CmEvent::new(CmEventKind::AddrResolved));
        }
        Ok(())
    }

    fn resolve_route(&self, _timeout_ms: u32) -> Result<(), NetError> {
        let fabric = self.fabric()?;
        if fabric.route_fail.load(Ordering::Acquire) {
            self.emit(CmEvent::with_status(CmEventKind::RouteError, 113));
        } else {
            self.emit(CmEvent::new(CmEventKind::RouteResolved));
        }
        Ok(())
    }

    fn connect(&self, param: ConnParam) -> Result<(), NetError> {
        let fabric = self.fabric()?;
        let peer = self
            .inner
            .lock()
            .peer
            .ok_or(NetError::NotConnected)?;

        if fabric.reject_all.load(Ordering::Acquire) {
            self.emit(CmEvent::with_status(CmEventKind::Rejected, 111));
            return Ok(());
        }
        let Some(listener) = fabric.listeners.get(&peer) else {
            self.emit(CmEvent::with_status(CmEventKind::Unreachable, 111));
            return Ok(());
        };

        // Unbound connectors get an ephemeral source address.
        let src = {
            let mut inner = self.inner.lock();
            *inner.bound.get_or_insert_with(|| {
                SocketAddr::new(peer.ip(), fabric.next_port.fetch_add(1, Ordering::AcqRel))
            })
        };

        // Pair a fresh server-side identifier with this one.
        let (server_id, server_rx) = fabric.new_id();
        {
            let mut server = server_id.inner.lock();
            server.bound = Some(peer);
            server.peer = Some(src);
            server.peer_tx = Some(self.tx.clone());
        }
        self.inner.lock().peer_tx = Some(server_id.tx.clone());

        let mut ev = CmEvent::with_param(CmEventKind::ConnectRequest, param);
        ev.incoming = Some(IncomingId {
            id: server_id as Arc<dyn CmId>,
            stream: server_rx,
        });
        if listener.send(ev).is_err() {
            self.emit(CmEvent::with_status(CmEventKind::Unreachable, 111));
        }
        Ok(())
    }

    fn accept(&self, param: ConnParam) -> Result<(), NetError> {
        let fabric = self.fabric()?;
        if fabric.fail_accept.load(Ordering::Acquire) {
            return Err(NetError::ConnectFailure(
                "simulated accept failure".into(),
            ));
        }
        let peer_tx = self
            .inner
            .lock()
            .peer_tx
            .clone()
            .ok_or(NetError::NotConnected)?;
        let _ = peer_tx.send(CmEvent::with_param(CmEventKind::Established, param));
        self.emit(CmEvent::new(CmEventKind::Established));
        Ok(())
    }

    fn disconnect(&self) -> Result<(), NetError> {
        let (peer_tx, qpn) = {
            let mut inner = self.inner.lock();
            if inner.disconnected {
                return Ok(());
            }
            inner.disconnected = true;
            (inner.peer_tx.clone(), inner.qpn)
        };
        if let Some(peer_tx) = peer_tx {
            let _ = peer_tx.send(CmEvent::new(CmEventKind::Disconnected));
        }
        if let Some(fabric) = self.fabric.upgrade() {
            // Graceful-close marker for the peer's data path.
            if let Some(remote) = fabric.links.get(&qpn).map(|r| *r) {
                fabric.deliver_wc(
                    remote,
                    WorkCompletion {
                        wr_id: 0,
                        byte_len: 0,
                        status: WcStatus::Success,
                    },
                );
            }
        }
        // Local teardown handshake completes immediately in the sim.
        self.emit(CmEvent::new(CmEventKind::TimewaitExit));
        trace!(qpn, "sim disconnect");
        Ok(())
    }

    fn bind_queue_pair(&self, qpn: u32) {
        self.inner.lock().qpn = qpn;
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().peer
    }
}

impl Drop for SimCmId {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.listening {
            if let (Some(addr), Some(fabric)) = (inner.bound, self.fabric.upgrade()) {
                fabric
                    .listeners
                    .remove_if(&addr, |_, tx| tx.same_channel(&self.tx));
            }
        }
    }
}

struct SimQueuePair {
    fabric: Weak<SimFabric>,
    qpn: u32,
    errored: AtomicBool,
}

impl QueuePair for SimQueuePair {
    fn qp_number(&self) -> u32 {
        self.qpn
    }

    fn to_ready(&self, remote_qpn: u32) -> Result<(), NetError> {
        let fabric = self.fabric.upgrade().ok_or(NetError::NotConnected)?;
        fabric.links.insert(self.qpn, remote_qpn);
        Ok(())
    }

    fn to_error(&self) {
        self.errored.store(true, Ordering::Release);
    }

    fn post_send(&self, data: Bytes) -> Result<(), NetError> {
        if self.errored.load(Ordering::Acquire) {
            return Err(NetError::NotConnected);
        }
        let fabric = self.fabric.upgrade().ok_or(NetError::NotConnected)?;
        let remote = fabric
            .links
            .get(&self.qpn)
            .map(|r| *r)
            .ok_or(NetError::NotConnected)?;
        fabric.deliver_data(remote, data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("192.168.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_duplicate_listen_rejected() {
        let fabric = SimFabric::new();
        let (a, _rx_a) = fabric.new_id();
        let (b, _rx_b) = fabric.new_id();
        a.bind(addr(9000)).unwrap();
        a.listen(128).unwrap();
        b.bind(addr(9000)).unwrap();
        assert!(matches!(b.listen(128), Err(NetError::Listen(_))));
    }

    #[test]
    fn test_bind_assigns_ephemeral_port() {
        let fabric = SimFabric::new();
        let (id, _rx) = fabric.new_id();
        let bound = id.bind(addr(0)).unwrap();
        assert!(bound.port() >= EPHEMERAL_BASE);
    }

    #[test]
    fn test_qp_alloc_failure_injection() {
        let fabric = SimFabric::new();
        let (id, _rx) = fabric.new_id();
        fabric.fail_qp_alloc(true);
        assert!(matches!(
            fabric.create_queue_pair(id.as_ref() as &dyn CmId),
            Err(NetError::ResourceAllocationFailure(_))
        ));
        fabric.fail_qp_alloc(false);
        assert!(fabric.create_queue_pair(id.as_ref() as &dyn CmId).is_ok());
    }

    #[test]
    fn test_unlinked_send_fails_without_delivery() {
        let fabric = SimFabric::new();
        let (id, _rx) = fabric.new_id();
        let qp = fabric.create_queue_pair(id.as_ref() as &dyn CmId).unwrap();
        assert!(qp.post_send(Bytes::from_static(b"x")).is_err());
        assert_eq!(fabric.outstanding_chunks(), 0);
    }

    #[test]
    fn test_linked_send_queues_completion_for_polling() {
        let fabric = SimFabric::new();
        let (id, _rx) = fabric.new_id();
        let qp = fabric.create_queue_pair(id.as_ref() as &dyn CmId).unwrap();
        qp.to_ready(0x777).unwrap();
        qp.post_send(Bytes::from_static(b"ping")).unwrap();

        let wc = fabric.poll_recv(0x777, 16);
        assert_eq!(wc.len(), 1);
        assert_eq!(wc[0].byte_len, 4);
        let chunk = fabric.take_recv_chunk(wc[0].wr_id).unwrap();
        assert_eq!(&chunk.data[..], b"ping");
        assert_eq!(fabric.outstanding_chunks(), 1);
        fabric.release_recv_chunk(chunk);
        assert_eq!(fabric.outstanding_chunks(), 0);
    }

    #[test]
    fn test_errored_qp_refuses_sends() {
        let fabric = SimFabric::new();
        let (id, _rx) = fabric.new_id();
        let qp = fabric.create_queue_pair(id.as_ref() as &dyn CmId).unwrap();
        qp.to_ready(0x778).unwrap();
        qp.to_error();
        assert!(qp.post_send(Bytes::from_static(b"late")).is_err());
    }
}
