//! One live peer connection: a cheap send handle plus the reactor task
//! that owns the socket.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt as _, StreamExt as _};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use weft_proto::msg::Envelope;

use crate::codec::EnvelopeCodec;
use crate::dispatch::Dispatcher;

/// Process-unique identity of one connection.
///
/// The registry and broker key their records by this, so that a record
/// can outlive any particular borrow of the [`Connection`] handle
/// without owning the socket. An `(ip, port)` pair is not an identity:
/// the same peer address may connect many times over a process
/// lifetime, and each of those connections gets a fresh `ConnId`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    /// Return a ConnId that has never been given out before.
    fn next() -> Self {
        /// The next connection number to hand out.
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        ConnId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Instruction sent from a [`Connection`] handle to its reactor.
enum ConnCmd {
    /// Write this message to the peer.
    Send(Envelope),
    /// Stop the reactor and drop the socket.
    Shutdown,
}

/// A function to run when a connection is torn down.
///
/// Hooks run on the reactor task, after the connection is marked
/// disconnected and before its task exits; they must not block.
pub type DisconnectHook = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// A handle to one live peer.
///
/// The handle is cheap to clone behind its `Arc` and safe to use from
/// any number of tasks: all socket I/O happens on a single reactor task,
/// so concurrent `send` calls can never interleave the bytes of two
/// frames, and inbound messages are dispatched in arrival order.
pub struct Connection {
    /// This connection's identity.
    id: ConnId,
    /// Displayable address of the peer, for log lines.
    peer: String,
    /// Channel to the reactor task.
    cmd_tx: mpsc::UnboundedSender<ConnCmd>,
    /// Whether the reactor is still running.
    ///
    /// Cleared by `shutdown()` and by the reactor on its way out. Once
    /// false it never becomes true again.
    live: AtomicBool,
}

impl Connection {
    /// Spawn a reactor for `stream` and return the handle to it.
    ///
    /// Inbound messages are handed to `dispatcher`; `hooks` run when the
    /// connection goes away for any reason (peer close, protocol
    /// violation, write failure, local shutdown).
    pub fn launch<S>(
        stream: S,
        peer: String,
        dispatcher: Arc<Dispatcher>,
        hooks: Vec<DisconnectHook>,
        max_frame_bytes: usize,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection {
            id: ConnId::next(),
            peer,
            cmd_tx,
            live: AtomicBool::new(true),
        });
        let framed = Framed::new(stream, EnvelopeCodec::new(max_frame_bytes));
        tokio::spawn(run_reactor(
            Arc::clone(&conn),
            framed,
            cmd_rx,
            dispatcher,
            hooks,
        ));
        conn
    }

    /// Return this connection's identity.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Return a displayable address for the peer.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Return true if the connection has not (yet) been torn down.
    pub fn connected(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    /// Serialize `msg` and enqueue it for the peer.
    ///
    /// This never blocks: the frame is handed to the reactor task, which
    /// writes it after everything already queued. Fails if the
    /// connection is gone; a message accepted here can still be lost if
    /// the peer vanishes before the reactor reaches it, which is within
    /// this protocol's delivery guarantees (none).
    pub fn send(&self, msg: Envelope) -> Result<(), ConnectionClosed> {
        if !self.connected() {
            return Err(ConnectionClosed);
        }
        self.cmd_tx
            .send(ConnCmd::Send(msg))
            .map_err(|_| ConnectionClosed)
    }

    /// Ask the reactor to close this connection. Idempotent.
    pub fn shutdown(&self) {
        if self.live.swap(false, Ordering::Relaxed) {
            // The reactor may already be gone; that's fine.
            let _ = self.cmd_tx.send(ConnCmd::Shutdown);
        }
    }

    /// Note that the reactor has stopped.
    fn mark_closed(&self) {
        self.live.store(false, Ordering::Relaxed);
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.peer)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("live", &self.connected())
            .finish_non_exhaustive()
    }
}

/// Error: tried to send on a connection whose peer is gone.
#[derive(Clone, Debug, thiserror::Error)]
#[error("connection is closed")]
#[non_exhaustive]
pub struct ConnectionClosed;

/// Drive one connection until it dies.
///
/// This is the single place that touches the socket: it interleaves
/// writing queued outbound frames with reading, decoding, and
/// dispatching inbound ones. Awaiting the framed `send` here is
/// deliberate — if the peer stops draining its socket we stop reading
/// from them too, and the transport's backpressure does the rest.
async fn run_reactor<S>(
    conn: Arc<Connection>,
    mut framed: Framed<S, EnvelopeCodec>,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnCmd>,
    dispatcher: Arc<Dispatcher>,
    hooks: Vec<DisconnectHook>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ConnCmd::Send(msg)) => {
                    if let Err(e) = framed.send(msg).await {
                        debug!("{}: write failed: {}", conn, e);
                        break;
                    }
                }
                Some(ConnCmd::Shutdown) | None => {
                    trace!("{}: local shutdown", conn);
                    break;
                }
            },
            inbound = framed.next() => match inbound {
                Some(Ok(msg)) => dispatcher.dispatch(&conn, msg),
                Some(Err(e)) => {
                    // Frame-level errors are fatal: after one malformed
                    // frame there is no way to find the start of the next.
                    warn!("{}: closing connection: {}", conn, e);
                    break;
                }
                None => {
                    debug!("{}: peer closed the connection", conn);
                    break;
                }
            },
        }
    }
    conn.mark_closed();
    for hook in &hooks {
        hook(&conn);
    }
}
