//! Transport-agnostic socket abstraction for the rdmsg messenger.
//!
//! This crate defines the contract between the messenger proper and a
//! connection-oriented transport backend: the [`ConnectedSocket`] and
//! [`ServerSocket`] traits and the [`NetError`] taxonomy. Concrete
//! implementations live in their own crates (e.g. `rdmsg-rdma`).

pub mod error;
pub mod socket;

pub use error::NetError;
pub use socket::{ConnectedSocket, ConnectionState, ServerSocket};
