//! Completion-dispatcher seam.
//!
//! The dispatcher owns the shared completion queues, routes harvested
//! completions to the socket owning each queue pair, and keeps the
//! observability counters. It is an external collaborator; the connection
//! layer only registers/deregisters queue pairs and bumps counters.

use std::sync::Arc;

use crate::verbs::WorkCompletion;

/// Named performance counters. Observability only; never behavior-affecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    QpCreated,
    QpActive,
    QpDestroyed,
    HandshakeErrors,
}

/// Receiver of completion batches for one queue pair. Implemented by the
/// connected socket.
pub trait CompletionSink: Send + Sync {
    /// The queue-pair number this sink is registered under.
    fn qp_number(&self) -> u32;

    /// Deliver a batch of harvested receive completions. Called from the
    /// reactor thread owning the completion queue.
    fn pass_wc(&self, wc: Vec<WorkCompletion>);
}

/// Completion routing and counters.
pub trait Dispatcher: Send + Sync {
    /// Register a queue pair's completion sink.
    fn register_qp(&self, qpn: u32, sink: Arc<dyn CompletionSink>);

    /// Remove a queue pair's completion sink. Completions harvested after
    /// this point for the queue pair are dropped.
    fn deregister_qp(&self, qpn: u32);

    fn counter_inc(&self, counter: Counter);
    fn counter_dec(&self, counter: Counter);
}
