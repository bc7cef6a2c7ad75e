//! Native connection-management protocol surface.
//!
//! The RDMA-CM protocol is consumed through two traits: [`CmId`], the native
//! handshake identifier (session handle), and [`CmProvider`], which mints
//! identifier/event-channel pairs. Handshake progress arrives as [`CmEvent`]s
//! on the identifier's own event channel and is processed serially on the
//! owning reactor.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use rdmsg_net::NetError;
use tokio::sync::mpsc;

/// Size of the handshake private-data payload: exactly one 32-bit
/// queue-pair number.
pub const PRIVATE_DATA_LEN: usize = 4;

/// Connection parameters attached to connect and accept requests.
///
/// The wire contract is bit-exact: the private data carries exactly the
/// sender's 32-bit local queue-pair number, little-endian. `retry_count` is
/// a local knob and is not part of the private data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnParam {
    pub qp_num: u32,
    pub retry_count: u8,
}

impl ConnParam {
    pub fn new(qp_num: u32, retry_count: u8) -> Self {
        Self { qp_num, retry_count }
    }

    /// Encode the private-data payload.
    pub fn to_private_data(&self) -> [u8; PRIVATE_DATA_LEN] {
        self.qp_num.to_le_bytes()
    }

    /// Decode a private-data payload received from the peer.
    pub fn from_private_data(data: &[u8]) -> Result<Self, NetError> {
        let bytes: [u8; PRIVATE_DATA_LEN] = data.try_into().map_err(|_| {
            NetError::ProtocolViolation(format!(
                "private data must be {} bytes, got {}",
                PRIVATE_DATA_LEN,
                data.len()
            ))
        })?;
        Ok(Self {
            qp_num: u32::from_le_bytes(bytes),
            retry_count: 0,
        })
    }
}

/// Event kinds delivered on a native event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEventKind {
    AddrResolved,
    RouteResolved,
    ConnectRequest,
    Established,
    Disconnected,
    /// Native teardown handshake complete; the terminal resource-retirement
    /// event for the connection manager.
    TimewaitExit,
    AddrError,
    RouteError,
    ConnectError,
    Unreachable,
    Rejected,
    DeviceRemoval,
}

/// A newly created identifier carried by a `ConnectRequest` event, together
/// with its own event channel.
pub struct IncomingId {
    pub id: Arc<dyn CmId>,
    pub stream: CmEventStream,
}

/// One event from the native event channel.
pub struct CmEvent {
    pub kind: CmEventKind,
    /// Errno-style status for error events, zero otherwise.
    pub status: i32,
    /// Decoded handshake private data, present on `ConnectRequest` and
    /// (client-side) `Established`.
    pub param: Option<ConnParam>,
    /// Present only on `ConnectRequest`.
    pub incoming: Option<IncomingId>,
}

impl CmEvent {
    pub fn new(kind: CmEventKind) -> Self {
        Self {
            kind,
            status: 0,
            param: None,
            incoming: None,
        }
    }

    pub fn with_status(kind: CmEventKind, status: i32) -> Self {
        Self {
            kind,
            status,
            param: None,
            incoming: None,
        }
    }

    pub fn with_param(kind: CmEventKind, param: ConnParam) -> Self {
        Self {
            kind,
            status: 0,
            param: Some(param),
            incoming: None,
        }
    }
}

// Manual Debug: `IncomingId` holds a trait object and a channel half.
impl fmt::Debug for CmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmEvent")
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("param", &self.param)
            .field("incoming", &self.incoming.is_some())
            .finish()
    }
}

/// The native handshake identifier: one per connection (or listener).
///
/// All methods are non-blocking; results of the asynchronous operations
/// (resolution, connect, accept, disconnect) arrive as [`CmEvent`]s on the
/// identifier's event channel.
pub trait CmId: Send + Sync {
    /// Bind to a local address. Returns the actually bound address (a zero
    /// port is replaced by an ephemeral one).
    fn bind(&self, addr: SocketAddr) -> Result<SocketAddr, NetError>;

    /// Mark the identifier listening with the given backlog.
    fn listen(&self, backlog: u32) -> Result<(), NetError>;

    /// Start asynchronous address resolution toward `dst`.
    fn resolve_addr(&self, dst: SocketAddr, timeout_ms: u32) -> Result<(), NetError>;

    /// Start asynchronous route resolution.
    fn resolve_route(&self, timeout_ms: u32) -> Result<(), NetError>;

    /// Issue the connect request, attaching `param` as private data.
    fn connect(&self, param: ConnParam) -> Result<(), NetError>;

    /// Issue the accept reply, attaching `param` as private data.
    fn accept(&self, param: ConnParam) -> Result<(), NetError>;

    /// Initiate the disconnect handshake. Idempotent.
    fn disconnect(&self) -> Result<(), NetError>;

    /// Associate a freshly created queue pair with this identifier, so the
    /// device can route its work to the peer established through it.
    fn bind_queue_pair(&self, qpn: u32);

    /// The remote address, once known.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Receiving half of a native event channel.
pub type CmEventStream = mpsc::UnboundedReceiver<CmEvent>;

/// Factory for native handshake identifiers.
pub trait CmProvider: Send + Sync {
    /// Create a fresh identifier and its event channel.
    fn create_id(&self) -> Result<(Arc<dyn CmId>, CmEventStream), NetError>;
}

/// Transient carrier for an inbound connection: the accepted identifier,
/// its event channel, and the remote queue-pair number decoded from the
/// connect request's private data. Handed from the listener to the newly
/// spawned socket/manager pair and dropped immediately after.
pub struct PendingConnectionInfo {
    pub id: Arc<dyn CmId>,
    pub stream: CmEventStream,
    pub remote_qpn: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_data_is_exactly_the_qpn() {
        let param = ConnParam::new(0xDEAD_BEEF, 7);
        let data = param.to_private_data();
        assert_eq!(data, 0xDEAD_BEEFu32.to_le_bytes());

        let back = ConnParam::from_private_data(&data).unwrap();
        assert_eq!(back.qp_num, 0xDEAD_BEEF);
    }

    #[test]
    fn test_private_data_wrong_length() {
        assert!(ConnParam::from_private_data(&[1, 2, 3]).is_err());
        assert!(ConnParam::from_private_data(&[1, 2, 3, 4, 5]).is_err());
    }

    #[test]
    fn test_event_debug_omits_channel() {
        let ev = CmEvent::with_status(CmEventKind::AddrError, 113);
        let s = format!("{:?}", ev);
        assert!(s.contains("AddrError"));
        assert!(s.contains("113"));
    }
}
