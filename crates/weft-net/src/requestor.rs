//! Correlate outbound requests with the responses that answer them.
//!
//! The [`Requestor`] is the central client-side concurrency primitive:
//! many requests can be outstanding on one connection at once, and each
//! must be completed exactly once — by its response, by a timeout, or
//! by the connection going away.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use weft_proto::msg::{Envelope, MsgType, RequestId};

use crate::conn::{ConnId, Connection};
use crate::dispatch::Dispatcher;

/// How long a bounded synchronous wait lasts unless the caller says
/// otherwise.
///
/// One second is aggressive for a cold registry, which is why every
/// entry point also has a caller-supplied-timeout form.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(1);

/// A helper to mint request identifiers that no other requestor in this
/// process (or any other) will collide with.
///
/// Identifiers look like `4fa0c311d92e77b8-1c`: a random per-generator
/// prefix, then a counter.
#[derive(Debug)]
pub struct IdGenerator {
    /// Random prefix shared by every id this generator yields.
    prefix: String,
    /// The next counter value to hand out.
    next: AtomicU64,
}

impl Default for IdGenerator {
    fn default() -> Self {
        IdGenerator {
            prefix: format!("{:016x}", rand::random::<u64>()),
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator {
    /// Create a new IdGenerator with a fresh random prefix.
    pub fn new() -> Self {
        IdGenerator::default()
    }

    /// Return a previously unyielded identifier.
    pub fn fresh_id(&self) -> RequestId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        RequestId::from(format!("{}-{:x}", self.prefix, n))
    }
}

/// How one outstanding request wants to be completed.
enum Completion {
    /// A single-shot slot: the waiter holds the other end, either
    /// polling it as a future or blocking on it with a timeout.
    Slot(oneshot::Sender<Result<Envelope, RequestError>>),
    /// A callback, run on whatever task delivers the response.
    Callback(Box<dyn FnOnce(Envelope) + Send>),
}

/// Bookkeeping for one outstanding request.
struct Outstanding {
    /// The connection the request was written to. Used to fail the
    /// request if that particular connection goes away.
    conn: ConnId,
    /// How to complete the request.
    completion: Completion,
}

/// An error completing (or failing to launch) a request.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RequestError {
    /// The connection was down before the request could be written, or
    /// went down while the request was outstanding.
    #[error("peer disconnected")]
    Disconnected,
    /// No response arrived within the bounded wait.
    #[error("timed out waiting for a response")]
    Timeout,
    /// The caller supplied an id that is already outstanding.
    ///
    /// This cannot happen for ids minted by the requestor's own
    /// [`IdGenerator`].
    #[error("request id {0} is already outstanding")]
    DuplicateId(RequestId),
    /// The requestor was torn down while the request was outstanding.
    #[error("requestor was torn down before a response arrived")]
    Abandoned,
}

/// A future resolving to the response for one outstanding request.
///
/// Yielded by [`Requestor::send_future`]; resolves when the response
/// arrives, or fails when the connection or the requestor goes away
/// first.
#[derive(Debug)]
pub struct ResponseFuture {
    /// The receiving end of the request's single-shot slot.
    rx: oneshot::Receiver<Result<Envelope, RequestError>>,
}

impl Future for ResponseFuture {
    type Output = Result<Envelope, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|done| match done {
            Ok(outcome) => outcome,
            // The sender was dropped without completing us: the
            // requestor itself was torn down.
            Err(_) => Err(RequestError::Abandoned),
        })
    }
}

/// The table of outstanding requests, and the operations that complete
/// them.
///
/// Invariants: each id owns at most one table entry; the entry is
/// removed *before* its waiter is woken or its callback run, so a
/// duplicate or late response finds nothing and is dropped; and the
/// table lock is never held across a completion, because completions
/// run arbitrary caller code.
pub struct Requestor {
    /// Outstanding requests, keyed by request id.
    pending: Mutex<HashMap<RequestId, Outstanding>>,
    /// Source of fresh request ids.
    ids: IdGenerator,
    /// Bounded wait applied by [`send_sync`](Requestor::send_sync).
    sync_timeout: Duration,
}

impl Default for Requestor {
    fn default() -> Self {
        Requestor::new()
    }
}

impl Requestor {
    /// Create a new Requestor with the default synchronous timeout.
    pub fn new() -> Self {
        Requestor::with_sync_timeout(DEFAULT_SYNC_TIMEOUT)
    }

    /// Create a new Requestor whose [`send_sync`](Requestor::send_sync)
    /// waits up to `sync_timeout`.
    pub fn with_sync_timeout(sync_timeout: Duration) -> Self {
        Requestor {
            pending: Mutex::new(HashMap::new()),
            ids: IdGenerator::new(),
            sync_timeout,
        }
    }

    /// Return an id that no other request from this requestor uses.
    pub fn fresh_id(&self) -> RequestId {
        self.ids.fresh_id()
    }

    /// Register this requestor as the handler for response frames of
    /// type `mtype` on `dispatcher`.
    pub fn handle_responses(self: &Arc<Self>, dispatcher: &Dispatcher, mtype: MsgType) {
        let requestor = Arc::clone(self);
        dispatcher.register_raw(mtype, move |conn, env| requestor.on_response(conn, env));
    }

    /// Send `req` on `conn` and return a future for its response.
    ///
    /// The request is tracked before it is written, so a response cannot
    /// race past its own bookkeeping; if the write fails, the tracking
    /// is undone and the failure reported here.
    pub fn send_future(&self, conn: &Connection, req: Envelope) -> Result<ResponseFuture, RequestError> {
        let (tx, rx) = oneshot::channel();
        let id = req.id.clone();
        self.insert(id.clone(), conn.id(), Completion::Slot(tx))?;
        if conn.send(req).is_err() {
            self.take(&id);
            return Err(RequestError::Disconnected);
        }
        Ok(ResponseFuture { rx })
    }

    /// Send `req` on `conn` and wait (boundedly) for its response.
    ///
    /// Equivalent to [`send_future`](Requestor::send_future) plus a wait
    /// of at most the requestor's configured synchronous timeout.
    pub async fn send_sync(&self, conn: &Connection, req: Envelope) -> Result<Envelope, RequestError> {
        self.send_sync_with_timeout(conn, req, self.sync_timeout).await
    }

    /// As [`send_sync`](Requestor::send_sync), with a per-call timeout.
    ///
    /// On expiry the request's descriptor is removed first, so a
    /// response that arrives later finds nothing and is dropped quietly.
    pub async fn send_sync_with_timeout(
        &self,
        conn: &Connection,
        req: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, RequestError> {
        let id = req.id.clone();
        let fut = self.send_future(conn, req)?;
        match tokio::time::timeout(timeout, fut).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => {
                debug!("request {} timed out after {:?}", id, timeout);
                self.take(&id);
                Err(RequestError::Timeout)
            }
        }
    }

    /// Send `req` on `conn`; run `cb` with the response when it arrives.
    ///
    /// The callback runs on whatever task delivers the response, so it
    /// must be short and thread-safe. If the connection goes away first,
    /// the callback is abandoned, never run with a synthetic value.
    pub fn send_callback<F>(&self, conn: &Connection, req: Envelope, cb: F) -> Result<(), RequestError>
    where
        F: FnOnce(Envelope) + Send + 'static,
    {
        let id = req.id.clone();
        self.insert(id.clone(), conn.id(), Completion::Callback(Box::new(cb)))?;
        if conn.send(req).is_err() {
            self.take(&id);
            return Err(RequestError::Disconnected);
        }
        Ok(())
    }

    /// Deliver an inbound response frame.
    ///
    /// Wired onto a [`Dispatcher`] for each response message type via
    /// [`handle_responses`](Requestor::handle_responses).
    pub fn on_response(&self, conn: &Arc<Connection>, rsp: Envelope) {
        let Some(ent) = self.take(&rsp.id) else {
            // Timed out, cancelled, or never ours. Dropping it is the
            // whole point of removing descriptors eagerly.
            debug!("{}: response {} matches no outstanding request", conn, rsp.id);
            return;
        };
        trace!("{}: completing request {}", conn, rsp.id);
        // The entry is already out of the table: whatever the completion
        // does, nothing can complete this request a second time.
        match ent.completion {
            Completion::Slot(tx) => {
                // The waiter may have given up (timeout race); fine.
                let _ = tx.send(Ok(rsp));
            }
            Completion::Callback(cb) => cb(rsp),
        }
    }

    /// Fail every request that was sent on `conn`.
    ///
    /// Run from the connection's disconnect hook: waiters unblock
    /// immediately with [`RequestError::Disconnected`], and callbacks
    /// are abandoned.
    pub fn on_disconnect(&self, conn: ConnId) {
        let failed: Vec<(RequestId, Outstanding)> = {
            let mut pending = self.pending.lock().expect("requestor lock poisoned");
            let ids: Vec<RequestId> = pending
                .iter()
                .filter(|(_, ent)| ent.conn == conn)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|ent| (id, ent)))
                .collect()
        };
        for (id, ent) in failed {
            match ent.completion {
                Completion::Slot(tx) => {
                    let _ = tx.send(Err(RequestError::Disconnected));
                }
                Completion::Callback(_) => {
                    debug!("abandoning callback for request {}: {} is gone", id, conn);
                }
            }
        }
    }

    /// Return how many requests are currently outstanding.
    pub fn outstanding(&self) -> usize {
        self.pending.lock().expect("requestor lock poisoned").len()
    }

    /// Insert a descriptor, enforcing id uniqueness.
    fn insert(&self, id: RequestId, conn: ConnId, completion: Completion) -> Result<(), RequestError> {
        use std::collections::hash_map::Entry::*;
        let mut pending = self.pending.lock().expect("requestor lock poisoned");
        match pending.entry(id) {
            Occupied(ent) => Err(RequestError::DuplicateId(ent.key().clone())),
            Vacant(slot) => {
                slot.insert(Outstanding { conn, completion });
                Ok(())
            }
        }
    }

    /// Remove and return the descriptor for `id`, if any.
    fn take(&self, id: &RequestId) -> Option<Outstanding> {
        self.pending.lock().expect("requestor lock poisoned").remove(id)
    }
}
