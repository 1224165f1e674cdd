//! Connect to a TCP peer and drive the connection with a reactor.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::conn::{Connection, DisconnectHook};
use crate::dispatch::Dispatcher;

/// Bound on how long a connect attempt may take.
///
/// An unreachable peer must fail the caller promptly rather than hang
/// it for the kernel's full retransmission schedule.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// An error from a connect attempt.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConnectError {
    /// The peer did not accept within [`CONNECT_TIMEOUT`].
    #[error("timed out connecting to {0}")]
    Timeout(SocketAddr),
    /// The connect attempt itself failed.
    #[error("unable to connect to {addr}")]
    Io {
        /// The address we were connecting to.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: Arc<io::Error>,
    },
}

/// One outbound connection to a peer, with its reactor already running.
pub struct Client {
    /// The connection handle.
    conn: Arc<Connection>,
}

impl Client {
    /// Connect to `addr` and spawn a reactor for the connection.
    ///
    /// Inbound messages go to `dispatcher`; `hooks` run when the
    /// connection is torn down.
    pub async fn connect(
        addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        hooks: Vec<DisconnectHook>,
        max_frame_bytes: usize,
    ) -> Result<Self, ConnectError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectError::Timeout(addr))?
            .map_err(|e| ConnectError::Io {
                addr,
                source: Arc::new(e),
            })?;
        let conn = Connection::launch(
            stream,
            addr.to_string(),
            dispatcher,
            hooks,
            max_frame_bytes,
        );
        debug!("connected to {}", conn);
        Ok(Client { conn })
    }

    /// Return the connection this client drives.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Return true if the connection is still up.
    pub fn connected(&self) -> bool {
        self.conn.connected()
    }

    /// Close the connection. Idempotent.
    pub fn shutdown(&self) {
        self.conn.shutdown();
    }
}
