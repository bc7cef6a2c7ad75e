use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::NetError;

/// Connection state reported by [`ConnectedSocket::connection_state`].
///
/// Mirrors the tri-state the messenger polls during connection setup:
/// not yet connected, connected, or failed with an errno-style code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake still in progress.
    NotConnected,
    /// Handshake completed; the data path is usable.
    Connected,
    /// Handshake or connection failed with the given errno-style code.
    Failed(i32),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// A connected, connection-oriented transport endpoint.
///
/// Implementations may be backed by RDMA, TCP, or in-memory channels for
/// testing. `read` and `send` are non-blocking; `close` is the only
/// operation that suspends the caller, and only until the transport's
/// event-side teardown has completed.
#[async_trait]
pub trait ConnectedSocket: Send + Sync + 'static {
    /// Copy received bytes into `buf`.
    ///
    /// Returns the number of bytes copied, `Ok(0)` on graceful peer close,
    /// `Err(NetError::WouldBlock)` when no data is currently available, or
    /// the connection's sticky error after a failure.
    fn read(&self, buf: &mut [u8]) -> Result<usize, NetError>;

    /// Queue `data` for transmission.
    ///
    /// `more` is a coalescing hint: when true the implementation may stage
    /// the bytes and defer posting until a subsequent `send` with
    /// `more = false`. Fails with `NetError::NotConnected` before the
    /// connection is active, without transmitting anything.
    fn send(&self, data: Bytes, more: bool) -> Result<usize, NetError>;

    /// Current connection tri-state.
    fn connection_state(&self) -> ConnectionState;

    /// Stop issuing new work and move the connection toward teardown.
    /// Non-blocking; in-flight work is allowed to drain.
    fn shutdown(&self);

    /// Close the connection and wait for the event-side teardown
    /// notification. After this returns no transport callback will
    /// reference this socket again. Idempotent.
    async fn close(&self);
}

/// A bound, listening transport endpoint producing [`ConnectedSocket`]s.
#[async_trait]
pub trait ServerSocket: Send + Sync + 'static {
    type Socket: ConnectedSocket;

    /// Accept one pending connection, if any.
    ///
    /// Non-blocking: returns `Err(NetError::WouldBlock)` when no connection
    /// request is pending, consuming nothing. A pending request is consumed
    /// exactly once across repeated calls. On success returns the new
    /// socket and the peer address when known.
    fn accept(&self) -> Result<(Self::Socket, Option<SocketAddr>), NetError>;

    /// Tear down the listening endpoint. No further `accept` will succeed.
    fn abort_accept(&self);

    /// The local address this listener is bound to.
    fn local_addr(&self) -> SocketAddr;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::NotConnected.is_connected());
        assert!(!ConnectionState::Failed(104).is_connected());
    }
}
