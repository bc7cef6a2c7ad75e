//! CM-protocol connection manager.
//!
//! [`CmConnMgr`] drives one connection's native handshake as a state
//! machine over the events on its identifier's channel. All event handling
//! runs on the owning reactor, so state transitions never race; the
//! `state` mutex exists only because other threads read it through the
//! [`ConnMgr`] surface.
//!
//! Lifetime: the manager is held by the socket (until orphaned) and by the
//! registered event handler (until `cleanup` deregisters it after the
//! timewait-exit event). The queue pair is released only after both the
//! socket disown and the timewait exit have happened, in either order.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use rdmsg_net::{ConnectionState, NetError};
use tracing::{debug, error, trace};

use crate::cm_event::{CmEvent, CmEventKind, CmId, ConnParam, PendingConnectionInfo};
use crate::conn_mgr::{ConnMgr, MgrCore, ReleaseEvent};
use crate::dispatcher::Counter;
use crate::reactor::{EventToken, Reactor};
use crate::socket::SocketCore;
use crate::stack::RdmaEnv;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmState {
    Init,
    ResolvingAddr,
    ResolvingRoute,
    Connecting,
    Established,
    Disconnecting,
    Error,
    /// Timewait exit seen; no further hardware activity for this
    /// connection.
    Retired,
}

pub struct CmConnMgr {
    core: MgrCore,
    id: Arc<dyn CmId>,
    state: Mutex<CmState>,
    token: EventToken,
    weak_self: Weak<CmConnMgr>,
    cleaned_up: AtomicBool,
    closed: AtomicBool,
}

impl CmConnMgr {
    /// Create the manager for an outbound connection. The handshake starts
    /// when the socket calls `try_connect`.
    pub(crate) fn new_client(
        env: Arc<RdmaEnv>,
        reactor: Arc<Reactor>,
        socket: Weak<SocketCore>,
    ) -> Result<Arc<Self>, NetError> {
        let (id, stream) = env.provider.create_id()?;
        let token = reactor.allocate_token();
        let mgr = Arc::new_cyclic(|weak| Self {
            core: MgrCore::new(env, Arc::clone(&reactor), socket, false),
            id,
            state: Mutex::new(CmState::Init),
            token,
            weak_self: weak.clone(),
            cleaned_up: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let handler = Arc::clone(&mgr);
        reactor.register_channel(token, stream, move |ev| handler.handle_cm_event(ev));
        Ok(mgr)
    }

    /// Create the manager for an inbound connection handed over by the
    /// listener. Allocates resources and activates the queue pair
    /// immediately; the accept reply is issued by the listener afterwards
    /// with this manager's queue-pair number.
    pub(crate) fn new_server(
        env: Arc<RdmaEnv>,
        reactor: Arc<Reactor>,
        socket: Weak<SocketCore>,
        info: PendingConnectionInfo,
    ) -> Result<Arc<Self>, NetError> {
        let PendingConnectionInfo {
            id,
            stream,
            remote_qpn,
        } = info;
        let token = reactor.allocate_token();
        let mgr = Arc::new_cyclic(|weak| Self {
            core: MgrCore::new(env, Arc::clone(&reactor), socket, true),
            id,
            state: Mutex::new(CmState::Init),
            token,
            weak_self: weak.clone(),
            cleaned_up: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        if let Err(err) = mgr.alloc_resources() {
            error!(%err, "queue pair allocation for inbound connection failed");
            std::process::abort();
        }
        mgr.core.activate(remote_qpn)?;
        *mgr.state.lock() = CmState::Established;
        if let Some(sock) = mgr.core.socket() {
            sock.set_remote_qpn(remote_qpn);
            sock.notify_ready();
        }

        let handler = Arc::clone(&mgr);
        reactor.register_channel(token, stream, move |ev| handler.handle_cm_event(ev));
        Ok(mgr)
    }

    /// Create the queue pair, hand its completion sink to the dispatcher,
    /// and associate it with the handshake identifier.
    fn alloc_resources(&self) -> Result<(), NetError> {
        let qp = self.core.env.device.create_queue_pair(self.id.as_ref())?;
        let qpn = qp.qp_number();
        self.id.bind_queue_pair(qpn);
        self.core.install_qp(qp);
        self.core.env.dispatcher.counter_inc(Counter::QpCreated);
        self.core.env.dispatcher.counter_inc(Counter::QpActive);
        if let Some(sock) = self.core.socket() {
            sock.set_local_qpn(qpn);
            self.core.env.dispatcher.register_qp(qpn, sock);
        }
        debug!(qpn, "queue pair allocated");
        Ok(())
    }

    fn handle_cm_event(&self, ev: CmEvent) {
        trace!(conn = %self.describe(), event = ?ev, "cm event");
        if self.closed.load(Ordering::Acquire) && ev.kind != CmEventKind::TimewaitExit {
            trace!(event = ?ev, "event after close dropped");
            return;
        }
        match ev.kind {
            CmEventKind::AddrResolved => self.on_addr_resolved(),
            CmEventKind::RouteResolved => self.on_route_resolved(),
            CmEventKind::Established => self.on_established(ev.param),
            CmEventKind::Disconnected => self.on_disconnected(),
            CmEventKind::TimewaitExit => self.on_timewait_exit(),
            CmEventKind::AddrError => self.fail_handshake(NetError::AddrResolutionFailure(
                format!("status {}", ev.status),
            )),
            CmEventKind::RouteError => self.fail_handshake(NetError::RouteResolutionFailure(
                format!("status {}", ev.status),
            )),
            CmEventKind::ConnectError => self.fail_handshake(NetError::ConnectFailure(format!(
                "handshake error, status {}",
                ev.status
            ))),
            CmEventKind::Unreachable => {
                self.fail_handshake(NetError::ConnectFailure("peer unreachable".into()))
            }
            CmEventKind::Rejected => {
                self.fail_handshake(NetError::ConnectFailure("rejected by peer".into()))
            }
            CmEventKind::ConnectRequest | CmEventKind::DeviceRemoval => {
                self.fatal(&format!("unexpected event {:?}", ev.kind));
            }
        }
    }

    fn on_addr_resolved(&self) {
        {
            let mut state = self.state.lock();
            if *state != CmState::ResolvingAddr {
                let seen = *state;
                drop(state);
                self.fatal(&format!("address resolved in state {seen:?}"));
            }
            *state = CmState::ResolvingRoute;
        }
        if let Err(err) = self.alloc_resources() {
            error!(%err, "queue pair allocation failed");
            std::process::abort();
        }
        let timeout = self.core.env.config.route_resolve_timeout_ms;
        if let Err(err) = self.id.resolve_route(timeout) {
            self.fail_handshake(NetError::RouteResolutionFailure(err.to_string()));
        }
    }

    fn on_route_resolved(&self) {
        {
            let mut state = self.state.lock();
            if *state != CmState::ResolvingRoute {
                let seen = *state;
                drop(state);
                self.fatal(&format!("route resolved in state {seen:?}"));
            }
            *state = CmState::Connecting;
        }
        let param = ConnParam::new(self.core.local_qpn(), self.core.env.config.retry_count);
        if let Err(err) = self.id.connect(param) {
            self.fail_handshake(NetError::ConnectFailure(err.to_string()));
        }
    }

    fn on_established(&self, param: Option<ConnParam>) {
        if self.core.is_server {
            // The accept reply completed; the queue pair is already active.
            trace!(conn = %self.describe(), "inbound connection established");
            return;
        }
        {
            let state = self.state.lock();
            if *state != CmState::Connecting {
                let seen = *state;
                drop(state);
                self.fatal(&format!("established in state {seen:?}"));
            }
        }
        let Some(param) = param else {
            self.fatal("established without private data");
        };
        if let Err(err) = self.core.activate(param.qp_num) {
            self.fail_handshake(err);
            return;
        }
        *self.state.lock() = CmState::Established;
        debug!(conn = %self.describe(), remote_qpn = param.qp_num, "connection established");
        if let Some(sock) = self.core.socket() {
            sock.set_remote_qpn(param.qp_num);
            sock.notify_ready();
        }
    }

    /// Peer-initiated teardown: fault the socket, reciprocate the
    /// disconnect, and let the timewait exit retire the queue pair. The
    /// connection never re-enters resolution.
    fn on_disconnected(&self) {
        {
            let mut state = self.state.lock();
            if *state != CmState::Retired {
                *state = CmState::Disconnecting;
            }
        }
        self.core.shutdown();
        let sock = self.core.socket();
        if !sock.as_ref().is_some_and(|s| s.has_error()) {
            // No fault recorded yet: plain remote close, back to
            // not-connected. The socket still reads a reset.
            self.core.set_disconnected();
        }
        if let Err(err) = self.id.disconnect() {
            debug!(%err, "disconnect reply failed");
        }
        if let Some(sock) = sock {
            sock.abort_connection();
        }
    }

    fn on_timewait_exit(&self) {
        *self.state.lock() = CmState::Retired;
        self.cleanup();
        self.core.release(ReleaseEvent::QueuePairRetired);
    }

    /// Terminal handshake failure: counts, sticks the error on the socket,
    /// and stops the queue pair.
    fn fail_handshake(&self, err: NetError) {
        self.core.env.dispatcher.counter_inc(Counter::HandshakeErrors);
        *self.state.lock() = CmState::Error;
        self.core.set_failed(err.errno());
        self.core.shutdown();
        // Initiate the teardown handshake; its timewait-exit event is what
        // retires the queue pair and deregisters this manager.
        if let Err(dc_err) = self.id.disconnect() {
            debug!(%dc_err, "disconnect after handshake failure");
        }
        match self.core.socket() {
            Some(sock) => sock.fail(err),
            None => debug!(%err, "handshake failure on orphaned connection"),
        }
    }

    fn close_on_reactor(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            if let Some(sock) = self.core.socket() {
                sock.mark_closed();
            }
            return;
        }
        debug!(conn = %self.describe(), "closing connection");
        {
            let mut state = self.state.lock();
            if *state != CmState::Retired {
                *state = CmState::Disconnecting;
            }
        }
        self.core.shutdown();
        let sock = self.core.socket();
        if !sock.as_ref().is_some_and(|s| s.has_error()) {
            self.core.set_disconnected();
        }
        if let Err(err) = self.id.disconnect() {
            debug!(%err, "disconnect on close failed");
        }
        if let Some(sock) = sock {
            sock.mark_closed();
        }
    }

    /// An event arrived that violates the protocol contract, or a resource
    /// the transport cannot run without failed to allocate. Both mean the
    /// environment is broken; continuing would corrupt connection state.
    fn fatal(&self, msg: &str) -> ! {
        error!(conn = %self.describe(), "{msg}");
        std::process::abort();
    }

    #[cfg(test)]
    fn releases_remaining(&self) -> usize {
        self.core.releases_remaining()
    }
}

impl ConnMgr for CmConnMgr {
    fn try_connect(&self, peer: SocketAddr, timeout_ms: u32) -> Result<(), NetError> {
        let timeout = if timeout_ms == 0 {
            self.core.env.config.cm_resolve_timeout_ms
        } else {
            timeout_ms
        };
        {
            let mut state = self.state.lock();
            if *state != CmState::Init {
                return Err(NetError::ProtocolViolation(format!(
                    "connect in state {:?}",
                    *state
                )));
            }
            *state = CmState::ResolvingAddr;
        }
        debug!(%peer, timeout, "resolving peer address");
        self.id
            .resolve_addr(peer, timeout)
            .map_err(|err| NetError::AddrResolutionFailure(err.to_string()))
    }

    fn shutdown(&self) {
        self.core.shutdown();
    }

    fn close(&self) {
        let Some(me) = self.weak_self.upgrade() else {
            return;
        };
        self.core.reactor.submit(move || me.close_on_reactor());
    }

    fn cleanup(&self) {
        if !self.cleaned_up.swap(true, Ordering::AcqRel) {
            self.core.reactor.deregister(self.token);
        }
    }

    fn set_orphan(&self) {
        if self.core.orphan() {
            trace!(conn = %self.describe(), "socket disowned connection manager");
        }
    }

    fn connection_state(&self) -> ConnectionState {
        self.core.connection_state()
    }

    fn is_active(&self) -> bool {
        self.core.is_active()
    }

    fn local_qpn(&self) -> u32 {
        self.core.local_qpn()
    }

    fn post_send(&self, data: Bytes) -> Result<(), NetError> {
        self.core.post_send(data)
    }

    fn describe(&self) -> String {
        format!(
            "cm(qpn={}, {})",
            self.core.local_qpn(),
            if self.core.is_server { "server" } else { "client" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cm_event::{CmEventStream, CmProvider};
    use crate::config::RdmaCmConfig;
    use crate::dispatcher::{CompletionSink, Dispatcher};
    use crate::verbs::{QueuePair, RdmaDevice, RecvChunk, WorkCompletion};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached in time");
    }

    #[derive(Default)]
    struct MockId {
        calls: Mutex<Vec<String>>,
    }

    impl MockId {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }
    }

    impl CmId for MockId {
        fn bind(&self, addr: SocketAddr) -> Result<SocketAddr, NetError> {
            self.record("bind");
            Ok(addr)
        }
        fn listen(&self, _backlog: u32) -> Result<(), NetError> {
            self.record("listen");
            Ok(())
        }
        fn resolve_addr(&self, _dst: SocketAddr, timeout_ms: u32) -> Result<(), NetError> {
            self.record(format!("resolve_addr({timeout_ms})"));
            Ok(())
        }
        fn resolve_route(&self, timeout_ms: u32) -> Result<(), NetError> {
            self.record(format!("resolve_route({timeout_ms})"));
            Ok(())
        }
        fn connect(&self, param: ConnParam) -> Result<(), NetError> {
            self.record(format!("connect({})", param.qp_num));
            Ok(())
        }
        fn accept(&self, param: ConnParam) -> Result<(), NetError> {
            self.record(format!("accept({})", param.qp_num));
            Ok(())
        }
        fn disconnect(&self) -> Result<(), NetError> {
            self.record("disconnect");
            Ok(())
        }
        fn bind_queue_pair(&self, qpn: u32) {
            self.record(format!("bind_qp({qpn})"));
        }
        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    struct MockProvider {
        id: Arc<MockId>,
        tx: Mutex<Option<mpsc::UnboundedSender<CmEvent>>>,
    }

    impl MockProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: Arc::new(MockId::default()),
                tx: Mutex::new(None),
            })
        }
        fn event_tx(&self) -> mpsc::UnboundedSender<CmEvent> {
            self.tx.lock().clone().expect("create_id not called")
        }
    }

    impl CmProvider for MockProvider {
        fn create_id(&self) -> Result<(Arc<dyn CmId>, CmEventStream), NetError> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.tx.lock() = Some(tx);
            Ok((Arc::clone(&self.id) as Arc<dyn CmId>, rx))
        }
    }

    struct QpRecord {
        qpn: u32,
        remote: Mutex<Option<u32>>,
        errored: AtomicBool,
    }

    struct MockQp(Arc<QpRecord>);

    impl QueuePair for MockQp {
        fn qp_number(&self) -> u32 {
            self.0.qpn
        }
        fn to_ready(&self, remote_qpn: u32) -> Result<(), NetError> {
            *self.0.remote.lock() = Some(remote_qpn);
            Ok(())
        }
        fn to_error(&self) {
            self.0.errored.store(true, Ordering::Release);
        }
        fn post_send(&self, _data: Bytes) -> Result<(), NetError> {
            Ok(())
        }
    }

    struct MockDevice {
        next_qpn: AtomicU32,
        qps: Mutex<Vec<Arc<QpRecord>>>,
    }

    impl MockDevice {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                next_qpn: AtomicU32::new(11),
                qps: Mutex::new(Vec::new()),
            })
        }
    }

    impl RdmaDevice for MockDevice {
        fn create_queue_pair(&self, _id: &dyn CmId) -> Result<Box<dyn QueuePair>, NetError> {
            let record = Arc::new(QpRecord {
                qpn: self.next_qpn.fetch_add(1, Ordering::AcqRel),
                remote: Mutex::new(None),
                errored: AtomicBool::new(false),
            });
            self.qps.lock().push(Arc::clone(&record));
            Ok(Box::new(MockQp(record)))
        }
        fn take_recv_chunk(&self, _wr_id: u64) -> Option<RecvChunk> {
            None
        }
        fn release_recv_chunk(&self, _chunk: RecvChunk) {}
        fn poll_recv(&self, _qpn: u32, _max: usize) -> Vec<WorkCompletion> {
            Vec::new()
        }
    }

    #[derive(Default)]
    struct MockDispatcher {
        registered: Mutex<Vec<u32>>,
        deregistered: Mutex<Vec<u32>>,
        counters: Mutex<Vec<Counter>>,
    }

    impl Dispatcher for MockDispatcher {
        fn register_qp(&self, qpn: u32, _sink: Arc<dyn CompletionSink>) {
            self.registered.lock().push(qpn);
        }
        fn deregister_qp(&self, qpn: u32) {
            self.deregistered.lock().push(qpn);
        }
        fn counter_inc(&self, counter: Counter) {
            self.counters.lock().push(counter);
        }
        fn counter_dec(&self, _counter: Counter) {}
    }

    struct Fixture {
        env: Arc<RdmaEnv>,
        reactor: Arc<Reactor>,
        provider: Arc<MockProvider>,
        device: Arc<MockDevice>,
        dispatcher: Arc<MockDispatcher>,
    }

    fn fixture() -> Fixture {
        let provider = MockProvider::new();
        let device = MockDevice::new();
        let dispatcher = Arc::new(MockDispatcher::default());
        let env = RdmaEnv::new(
            Arc::clone(&provider) as Arc<dyn CmProvider>,
            Arc::clone(&device) as Arc<dyn RdmaDevice>,
            Arc::clone(&dispatcher) as Arc<dyn Dispatcher>,
            RdmaCmConfig::default(),
        );
        Fixture {
            env,
            reactor: Reactor::spawn(0),
            provider,
            device,
            dispatcher,
        }
    }

    fn peer() -> SocketAddr {
        "10.0.0.1:7100".parse().unwrap()
    }

    async fn establish(fx: &Fixture) -> (Arc<SocketCore>, Arc<CmConnMgr>) {
        let core = SocketCore::new(Arc::clone(&fx.env));
        let mgr = CmConnMgr::new_client(
            Arc::clone(&fx.env),
            Arc::clone(&fx.reactor),
            Arc::downgrade(&core),
        )
        .unwrap();
        core.set_mgr(Arc::clone(&mgr) as Arc<dyn ConnMgr>);
        mgr.try_connect(peer(), 0).unwrap();

        let tx = fx.provider.event_tx();
        tx.send(CmEvent::new(CmEventKind::AddrResolved)).unwrap();
        tx.send(CmEvent::new(CmEventKind::RouteResolved)).unwrap();
        tx.send(CmEvent::with_param(
            CmEventKind::Established,
            ConnParam::new(99, 0),
        ))
        .unwrap();
        wait_until(|| mgr.connection_state().is_connected()).await;
        (core, mgr)
    }

    #[tokio::test]
    async fn test_client_handshake_sequence() {
        let fx = fixture();
        let (core, mgr) = establish(&fx).await;

        let calls = fx.provider.id.calls();
        // Default manager-path resolve timeout, then route, then connect
        // carrying the freshly allocated queue-pair number.
        assert_eq!(calls[0], "resolve_addr(2000)");
        assert!(calls.contains(&"resolve_route(2000)".to_string()));
        let qpn = mgr.local_qpn();
        assert!(qpn >= 11);
        assert!(calls.contains(&format!("connect({qpn})")));
        assert!(calls.contains(&format!("bind_qp({qpn})")));

        assert_eq!(*fx.dispatcher.registered.lock(), vec![qpn]);
        assert_eq!(core.local_qpn(), qpn);
        assert_eq!(core.remote_qpn(), 99);
        let qp = fx.device.qps.lock()[0].clone();
        assert_eq!(*qp.remote.lock(), Some(99));
        assert!(mgr.is_active());
    }

    #[tokio::test]
    async fn test_explicit_timeout_overrides_default() {
        let fx = fixture();
        let core = SocketCore::new(Arc::clone(&fx.env));
        let mgr = CmConnMgr::new_client(
            Arc::clone(&fx.env),
            Arc::clone(&fx.reactor),
            Arc::downgrade(&core),
        )
        .unwrap();
        core.set_mgr(Arc::clone(&mgr) as Arc<dyn ConnMgr>);
        mgr.try_connect(peer(), 5000).unwrap();
        assert_eq!(fx.provider.id.calls()[0], "resolve_addr(5000)");
    }

    #[tokio::test]
    async fn test_handshake_error_faults_socket() {
        let fx = fixture();
        let core = SocketCore::new(Arc::clone(&fx.env));
        let mgr = CmConnMgr::new_client(
            Arc::clone(&fx.env),
            Arc::clone(&fx.reactor),
            Arc::downgrade(&core),
        )
        .unwrap();
        core.set_mgr(Arc::clone(&mgr) as Arc<dyn ConnMgr>);
        mgr.try_connect(peer(), 0).unwrap();

        fx.provider
            .event_tx()
            .send(CmEvent::with_status(CmEventKind::AddrError, 113))
            .unwrap();

        wait_until(|| mgr.connection_state() == ConnectionState::Failed(113)).await;
        assert!(core.has_error());
        assert!(fx
            .dispatcher
            .counters
            .lock()
            .contains(&Counter::HandshakeErrors));
        // No queue pair was ever allocated on this path.
        assert!(fx.device.qps.lock().is_empty());
        // The fault initiated teardown so retirement can still arrive.
        assert!(fx.provider.id.calls().contains(&"disconnect".to_string()));
    }

    #[tokio::test]
    async fn test_peer_disconnect_goes_straight_to_close() {
        let fx = fixture();
        let (core, mgr) = establish(&fx).await;

        fx.provider
            .event_tx()
            .send(CmEvent::new(CmEventKind::Disconnected))
            .unwrap();

        wait_until(|| core.is_closed()).await;
        assert!(core.has_error());
        assert!(!mgr.is_active());
        assert_eq!(mgr.connection_state(), ConnectionState::NotConnected);
        // Teardown is reciprocated, never re-resolved.
        let calls = fx.provider.id.calls();
        assert!(calls.contains(&"disconnect".to_string()));
        assert_eq!(
            calls.iter().filter(|c| c.starts_with("resolve_addr")).count(),
            1
        );
        let qp = fx.device.qps.lock()[0].clone();
        assert!(qp.errored.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_release_requires_orphan_and_timewait() {
        let fx = fixture();
        let (_core, mgr) = establish(&fx).await;
        let qpn = mgr.local_qpn();

        fx.provider
            .event_tx()
            .send(CmEvent::new(CmEventKind::TimewaitExit))
            .unwrap();
        wait_until(|| mgr.releases_remaining() == 1).await;
        assert!(fx.dispatcher.deregistered.lock().is_empty());

        mgr.set_orphan();
        wait_until(|| !fx.dispatcher.deregistered.lock().is_empty()).await;
        assert_eq!(*fx.dispatcher.deregistered.lock(), vec![qpn]);
        // Queue pair is gone from the manager.
        assert_eq!(mgr.local_qpn(), 0);
    }

    #[tokio::test]
    async fn test_orphan_then_timewait_also_releases() {
        let fx = fixture();
        let (_core, mgr) = establish(&fx).await;
        let qpn = mgr.local_qpn();

        mgr.set_orphan();
        mgr.set_orphan(); // second disown is a no-op
        assert_eq!(mgr.releases_remaining(), 1);
        assert!(fx.dispatcher.deregistered.lock().is_empty());

        fx.provider
            .event_tx()
            .send(CmEvent::new(CmEventKind::TimewaitExit))
            .unwrap();
        wait_until(|| !fx.dispatcher.deregistered.lock().is_empty()).await;
        assert_eq!(*fx.dispatcher.deregistered.lock(), vec![qpn]);
    }

    #[tokio::test]
    async fn test_events_after_close_are_dropped() {
        let fx = fixture();
        let core = SocketCore::new(Arc::clone(&fx.env));
        let mgr = CmConnMgr::new_client(
            Arc::clone(&fx.env),
            Arc::clone(&fx.reactor),
            Arc::downgrade(&core),
        )
        .unwrap();
        core.set_mgr(Arc::clone(&mgr) as Arc<dyn ConnMgr>);
        mgr.try_connect(peer(), 0).unwrap();

        mgr.close();
        wait_until(|| core.is_closed()).await;

        fx.provider
            .event_tx()
            .send(CmEvent::new(CmEventKind::AddrResolved))
            .unwrap();
        fx.reactor.submit_wait(|| {}).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.reactor.submit_wait(|| {}).await;

        // The stale resolution event did not advance the handshake.
        assert!(!fx
            .provider
            .id
            .calls()
            .iter()
            .any(|c| c.starts_with("resolve_route")));
        assert!(fx.device.qps.lock().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let fx = fixture();
        let (core, mgr) = establish(&fx).await;

        mgr.close();
        mgr.close();
        wait_until(|| core.is_closed()).await;
        fx.reactor.submit_wait(|| {}).await;

        let calls = fx.provider.id.calls();
        assert_eq!(calls.iter().filter(|c| *c == "disconnect").count(), 1);
        // A plain local close leaves the tri-state at not-connected.
        assert_eq!(mgr.connection_state(), ConnectionState::NotConnected);
        assert!(!core.has_error());
    }
}
