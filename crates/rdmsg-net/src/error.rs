use thiserror::Error;

/// Errors surfaced by the connection-establishment layer.
///
/// The first five variants form the handshake failure taxonomy: they become
/// the socket's sticky error and route the connection to its fault path.
/// `ResourceAllocationFailure` and `ProtocolViolation` are never returned
/// across the socket API; the transport treats them as fatal environment
/// violations (see `rdmsg-rdma`). Device and protocol implementations
/// use them to report the condition upward to that decision point.
#[derive(Debug, Clone, Error)]
pub enum NetError {
    /// Peer address resolution failed or timed out.
    #[error("address resolution failed: {0}")]
    AddrResolutionFailure(String),

    /// Route resolution failed or timed out.
    #[error("route resolution failed: {0}")]
    RouteResolutionFailure(String),

    /// The connect handshake failed (rejected, unreachable, or errored).
    #[error("connect failed: {0}")]
    ConnectFailure(String),

    /// The peer disconnected outside a local close.
    #[error("unexpected disconnect")]
    UnexpectedDisconnect,

    /// Queue-pair or device resource allocation failed.
    #[error("resource allocation failed: {0}")]
    ResourceAllocationFailure(String),

    /// An event arrived that is outside the expected set for the current
    /// connection state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The operation requires an active connection and there is none.
    #[error("not connected")]
    NotConnected,

    /// No data or event is currently available; retry later.
    #[error("would block")]
    WouldBlock,

    /// The socket has been closed locally.
    #[error("connection closed")]
    Closed,

    /// Binding or listening on the requested address failed.
    #[error("listen failed: {0}")]
    Listen(String),
}

impl NetError {
    /// Stable errno-style code for this error, used as the sticky error
    /// value and in [`ConnectionState::Failed`](crate::ConnectionState).
    pub fn errno(&self) -> i32 {
        match self {
            NetError::AddrResolutionFailure(_) => 113, // EHOSTUNREACH
            NetError::RouteResolutionFailure(_) => 113,
            NetError::ConnectFailure(_) => 111, // ECONNREFUSED
            NetError::UnexpectedDisconnect => 104, // ECONNRESET
            NetError::ResourceAllocationFailure(_) => 12, // ENOMEM
            NetError::ProtocolViolation(_) => 71, // EPROTO
            NetError::NotConnected => 107, // ENOTCONN
            NetError::WouldBlock => 11, // EAGAIN
            NetError::Closed => 104,
            NetError::Listen(_) => 98, // EADDRINUSE
        }
    }

    /// Whether this error is terminal for the connection (sets the sticky
    /// error), as opposed to a transient operational condition.
    pub fn is_fault(&self) -> bool {
        !matches!(self, NetError::WouldBlock | NetError::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(NetError::NotConnected.to_string(), "not connected");
        assert_eq!(NetError::WouldBlock.to_string(), "would block");
        let err = NetError::ConnectFailure("rejected".into());
        assert!(err.to_string().contains("rejected"));
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(NetError::UnexpectedDisconnect.errno(), 104);
        assert_eq!(NetError::ConnectFailure(String::new()).errno(), 111);
        assert_eq!(NetError::WouldBlock.errno(), 11);
    }

    #[test]
    fn test_fault_classification() {
        assert!(NetError::UnexpectedDisconnect.is_fault());
        assert!(NetError::AddrResolutionFailure(String::new()).is_fault());
        assert!(!NetError::WouldBlock.is_fault());
        assert!(!NetError::NotConnected.is_fault());
    }
}
