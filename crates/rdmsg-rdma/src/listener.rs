//! Listening endpoint.
//!
//! The listener owns one handshake identifier in listening mode. Connection
//! requests queue on its event channel; `accept` consumes at most one per
//! call and never blocks. Each accepted request spawns a socket/manager
//! pair from the request's carried identifier, then issues the accept reply
//! with the fresh local queue-pair number so the peer can activate.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rdmsg_net::{NetError, ServerSocket};
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error};

use crate::cm_event::{CmEventKind, CmEventStream, CmId, ConnParam, PendingConnectionInfo};
use crate::reactor::Reactor;
use crate::socket::RdmaConnectedSocket;
use crate::stack::RdmaEnv;

pub struct RdmaServerSocket {
    env: Arc<RdmaEnv>,
    reactor: Arc<Reactor>,
    id: Mutex<Option<Arc<dyn CmId>>>,
    events: Mutex<Option<CmEventStream>>,
    local: SocketAddr,
}

impl RdmaServerSocket {
    /// Bind `addr` and start listening. A zero port is replaced by an
    /// ephemeral one; `local_addr` reports the actually bound address.
    pub fn listen(
        env: Arc<RdmaEnv>,
        reactor: Arc<Reactor>,
        addr: SocketAddr,
    ) -> Result<Self, NetError> {
        let (id, stream) = env.provider.create_id()?;
        let local = id
            .bind(addr)
            .map_err(|err| NetError::Listen(err.to_string()))?;
        id.listen(env.config.listen_backlog)?;
        debug!(%local, "listening");
        Ok(Self {
            env,
            reactor,
            id: Mutex::new(Some(id)),
            events: Mutex::new(Some(stream)),
            local,
        })
    }

    /// The listening channel only ever carries connection requests;
    /// anything else means the provider broke the protocol contract.
    fn fatal(&self, msg: &str) -> ! {
        error!(listener = %self.local, "{msg}");
        std::process::abort();
    }
}

#[async_trait]
impl ServerSocket for RdmaServerSocket {
    type Socket = RdmaConnectedSocket;

    fn accept(&self) -> Result<(RdmaConnectedSocket, Option<SocketAddr>), NetError> {
        let ev = {
            let mut events = self.events.lock();
            let Some(stream) = events.as_mut() else {
                return Err(NetError::Closed);
            };
            match stream.try_recv() {
                Ok(ev) => ev,
                Err(TryRecvError::Empty) => return Err(NetError::WouldBlock),
                Err(TryRecvError::Disconnected) => return Err(NetError::Closed),
            }
        };

        if ev.kind != CmEventKind::ConnectRequest {
            self.fatal(&format!("unexpected event {:?} on listener", ev.kind));
        }
        let Some(incoming) = ev.incoming else {
            self.fatal("connect request without identifier");
        };
        let Some(param) = ev.param else {
            self.fatal("connect request without private data");
        };

        let peer = incoming.id.peer_addr();
        // Keep a handle for the accept reply; the identifier itself moves
        // into the new connection's manager.
        let reply_id = Arc::clone(&incoming.id);
        let info = PendingConnectionInfo {
            id: incoming.id,
            stream: incoming.stream,
            remote_qpn: param.qp_num,
        };
        let sock = RdmaConnectedSocket::accepted(
            Arc::clone(&self.env),
            Arc::clone(&self.reactor),
            info,
        )?;
        if let Err(err) = reply_id.accept(ConnParam::new(
            sock.local_qpn(),
            self.env.config.retry_count,
        )) {
            // The manager and its event registration already exist; tear
            // them down rather than leak them on the reactor.
            sock.teardown();
            return Err(err);
        }
        debug!(
            ?peer,
            local_qpn = sock.local_qpn(),
            remote_qpn = sock.remote_qpn(),
            "accepted connection"
        );
        Ok((sock, peer))
    }

    fn abort_accept(&self) {
        debug!(listener = %self.local, "listener shut down");
        self.id.lock().take();
        self.events.lock().take();
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}
