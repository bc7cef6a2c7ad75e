//! Transport-device seam.
//!
//! The hardware/verbs layer (queue pairs, completion queues, registered
//! memory) is an external collaborator of this crate. These traits describe
//! exactly the surface the connection layer consumes: creating a queue pair
//! bound to the device/port resolved from a native handshake identifier,
//! posting send work, polling receive completions, and borrowing/returning
//! receive buffers from the device-managed pool.

use bytes::Bytes;
use rdmsg_net::NetError;

use crate::cm_event::CmId;

/// Completion status of a work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    Error,
}

/// One entry harvested from a completion queue.
#[derive(Debug, Clone, Copy)]
pub struct WorkCompletion {
    /// Work-request identifier; for receives this names the buffer chunk
    /// holding the data.
    pub wr_id: u64,
    /// Number of bytes received. Zero signals graceful peer close.
    pub byte_len: u32,
    pub status: WcStatus,
}

/// A receive buffer borrowed from the device pool.
///
/// Must be returned via [`RdmaDevice::release_recv_chunk`] once fully
/// consumed; the connected socket releases all outstanding chunks before it
/// is dropped.
#[derive(Debug)]
pub struct RecvChunk {
    pub wr_id: u64,
    pub data: Bytes,
}

/// A hardware queue pair owned by one connection manager.
///
/// State transitions follow the connection lifecycle: created in a reset
/// state, moved to ready once both local and remote queue-pair numbers are
/// known, moved to error on shutdown so in-flight work drains, and destroyed
/// on drop.
pub trait QueuePair: Send + Sync {
    /// The locally assigned queue-pair number.
    fn qp_number(&self) -> u32;

    /// Transition the queue pair to its operational state, wiring it to the
    /// peer's queue pair. Invoked once per successful handshake.
    fn to_ready(&self, remote_qpn: u32) -> Result<(), NetError>;

    /// Move the queue pair to the error state. No new work may be posted;
    /// in-flight work completes with a flush status.
    fn to_error(&self);

    /// Post one send work request.
    fn post_send(&self, data: Bytes) -> Result<(), NetError>;
}

/// The transport device: queue-pair factory and receive-buffer pool.
pub trait RdmaDevice: Send + Sync {
    /// Create a queue pair bound to the device and port resolved from the
    /// given native handshake identifier, wired to the dispatcher's
    /// completion queues.
    ///
    /// A failure here is reported as `ResourceAllocationFailure`; the
    /// connection layer treats it as fatal (see crate docs).
    fn create_queue_pair(&self, id: &dyn CmId) -> Result<Box<dyn QueuePair>, NetError>;

    /// Borrow the receive chunk named by a completed work request.
    fn take_recv_chunk(&self, wr_id: u64) -> Option<RecvChunk>;

    /// Return a fully consumed chunk to the pool.
    fn release_recv_chunk(&self, chunk: RecvChunk);

    /// Poll the receive completion queue for up to `max` completions
    /// addressed to the given queue pair.
    fn poll_recv(&self, qpn: u32, max: usize) -> Vec<WorkCompletion>;
}
