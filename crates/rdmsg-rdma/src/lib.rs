//! RDMA-CM transport for the rdmsg messenger.
//!
//! This crate implements the connection-establishment and lifecycle layer of
//! an RDMA-based transport: it turns the out-of-band, event-driven RDMA
//! connection-management protocol (address resolution, route resolution,
//! connect/accept handshake, disconnect, timeout/teardown) into the
//! socket-like [`rdmsg_net::ConnectedSocket`] / [`rdmsg_net::ServerSocket`]
//! abstraction used by the messenger.
//!
//! # Architecture
//!
//! - [`CmConnMgr`]: the connection-manager state machine, driven by native
//!   CM events delivered on the owning [`Reactor`].
//! - [`RdmaConnectedSocket`]: the data-path facade covering receive
//!   buffers, send coalescing, and close/teardown ordering.
//! - [`RdmaServerSocket`]: listening endpoint producing accepted
//!   socket/manager pairs.
//! - [`verbs`] / [`dispatcher`] / [`cm_event`]: trait seams for the external
//!   collaborators (transport device, completion dispatcher, native CM
//!   protocol). Hardware bindings implement these; [`sim`] provides an
//!   in-process fabric for tests and development without RDMA hardware.

pub mod cm;
pub mod cm_event;
pub mod config;
pub mod conn_mgr;
pub mod dispatcher;
pub mod listener;
pub mod reactor;
pub mod sim;
pub mod socket;
pub mod stack;
pub mod verbs;

pub use cm::CmConnMgr;
pub use cm_event::{CmEvent, CmEventKind, CmId, CmProvider, ConnParam, PendingConnectionInfo};
pub use config::RdmaCmConfig;
pub use conn_mgr::ConnMgr;
pub use dispatcher::{CompletionSink, Counter, Dispatcher};
pub use listener::RdmaServerSocket;
pub use reactor::Reactor;
pub use sim::SimFabric;
pub use socket::RdmaConnectedSocket;
pub use stack::RdmaEnv;
pub use verbs::{QueuePair, RdmaDevice, RecvChunk, WcStatus, WorkCompletion};
