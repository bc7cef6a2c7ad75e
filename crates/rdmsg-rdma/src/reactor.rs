//! Per-worker reactor.
//!
//! Each worker owns one reactor: a single task that serially executes
//! submitted closures and dispatches native CM events to registered
//! handlers. Because everything flows through one op queue processed by one
//! task, no two handlers for the same worker ever run concurrently, which is
//! what makes the connection-manager state machines lock-free on their own
//! state.
//!
//! Threads other than the owning task interact with the reactor only
//! through the submission queue; registration and deregistration of event
//! interest are themselves marshaled the same way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::cm_event::{CmEvent, CmEventStream};

/// Identifies one registered event source on a reactor.
pub type EventToken = u64;

type Task = Box<dyn FnOnce() + Send + 'static>;
type EventHandler = Box<dyn FnMut(CmEvent) + Send + 'static>;

enum Op {
    Task(Task),
    TaskWait(Task, oneshot::Sender<()>),
    Register(EventToken, EventHandler),
    Deregister(EventToken),
    Event(EventToken, CmEvent),
}

/// Handle to one worker's reactor.
pub struct Reactor {
    id: u32,
    tx: mpsc::UnboundedSender<Op>,
    next_token: AtomicU64,
}

impl Reactor {
    /// Spawn the reactor task for worker `id`.
    pub fn spawn(id: u32) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run(id, rx));
        Arc::new(Self {
            id,
            tx,
            next_token: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Allocate a token for a new event registration.
    pub fn allocate_token(&self) -> EventToken {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Run `f` on the reactor task, fire and forget.
    pub fn submit(&self, f: impl FnOnce() + Send + 'static) {
        // Send fails only after the reactor task is gone, in which case
        // there is nothing left to run the closure against.
        let _ = self.tx.send(Op::Task(Box::new(f)));
    }

    /// Run `f` on the reactor task and wait for it to complete.
    pub async fn submit_wait(&self, f: impl FnOnce() + Send + 'static) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Op::TaskWait(Box::new(f), done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Register `handler` for events arriving on `stream`.
    ///
    /// A relay forwards the stream into the reactor's op queue, so handler
    /// invocations keep the stream's order and are serialized with all other
    /// work on this reactor. The relay ends when the stream's sender side is
    /// dropped.
    pub fn register_channel(
        &self,
        token: EventToken,
        mut stream: CmEventStream,
        handler: impl FnMut(CmEvent) + Send + 'static,
    ) {
        let _ = self.tx.send(Op::Register(token, Box::new(handler)));
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                if tx.send(Op::Event(token, event)).is_err() {
                    break;
                }
            }
        });
    }

    /// Remove the handler registered under `token`. Events already in
    /// flight for the token are drained and dropped.
    pub fn deregister(&self, token: EventToken) {
        let _ = self.tx.send(Op::Deregister(token));
    }

    async fn run(id: u32, mut rx: mpsc::UnboundedReceiver<Op>) {
        let mut handlers: HashMap<EventToken, EventHandler> = HashMap::new();
        debug!(worker = id, "reactor started");

        while let Some(op) = rx.recv().await {
            match op {
                Op::Task(f) => f(),
                Op::TaskWait(f, done) => {
                    f();
                    let _ = done.send(());
                }
                Op::Register(token, handler) => {
                    handlers.insert(token, handler);
                }
                Op::Deregister(token) => {
                    handlers.remove(&token);
                    trace!(worker = id, token, "event interest deregistered");
                }
                Op::Event(token, event) => match handlers.get_mut(&token) {
                    Some(handler) => handler(event),
                    None => {
                        trace!(worker = id, token, ?event, "event for deregistered token dropped")
                    }
                },
            }
        }
        debug!(worker = id, "reactor stopped");
    }
}
