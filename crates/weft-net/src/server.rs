//! Accept TCP peers and hand each one to a connection reactor.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::trace;

use crate::conn::{Connection, DisconnectHook};
use crate::dispatch::Dispatcher;

/// A listener that turns every accepted socket into a [`Connection`]
/// sharing one dispatcher.
///
/// This is deliberately thin: the interesting behavior (which messages
/// exist, what to do when a peer vanishes) lives in the dispatcher
/// handlers and disconnect hooks the role installs before calling
/// [`run`](Server::run).
pub struct Server {
    /// The bound listener.
    listener: TcpListener,
    /// Handler table shared by every accepted connection.
    dispatcher: Arc<Dispatcher>,
    /// Hooks to run when any accepted connection is torn down.
    hooks: Vec<DisconnectHook>,
    /// Frame-size cap for every accepted connection.
    max_frame_bytes: usize,
}

impl Server {
    /// Bind a listener on `addr`.
    pub async fn bind(
        addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        max_frame_bytes: usize,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Server {
            listener,
            dispatcher,
            hooks: Vec::new(),
            max_frame_bytes,
        })
    }

    /// Return the address this server is listening on.
    ///
    /// Useful when the configured port was 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Add a hook to run whenever an accepted connection is torn down.
    ///
    /// The registry and broker use this to reap every record keyed by
    /// the dying connection before its handle is dropped.
    pub fn on_disconnect(&mut self, hook: DisconnectHook) {
        self.hooks.push(hook);
    }

    /// Accept connections forever (or until the listener fails).
    pub async fn run(self) -> io::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let conn = Connection::launch(
                stream,
                peer.to_string(),
                Arc::clone(&self.dispatcher),
                self.hooks.clone(),
                self.max_frame_bytes,
            );
            trace!("accepted {}", conn);
        }
    }
}
