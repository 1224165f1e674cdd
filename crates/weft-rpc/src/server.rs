//! The provider assembly: a router on a listener, optionally announcing
//! its methods to a registry.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use weft_net::{Dispatcher, Server};
use weft_proto::codec::DEFAULT_MAX_FRAME;
use weft_proto::msg::{HostAddr, RpcRequest};
use weft_registry::{RegistryClient, RegistryError};

use crate::router::{MethodDesc, Router};

/// An error assembling or running an [`RpcServer`].
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RpcServerError {
    /// We could not bind or inspect the listener.
    #[error("listener error")]
    Io(#[source] Arc<io::Error>),
    /// Talking to the registry failed.
    #[error("registry error")]
    Registry(#[from] RegistryError),
}

impl From<io::Error> for RpcServerError {
    fn from(e: io::Error) -> Self {
        RpcServerError::Io(Arc::new(e))
    }
}

/// Configuration for an [`RpcServer`].
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct RpcServerConfig {
    /// Address to listen on.
    pub listen: SocketAddr,
    /// The registry to announce methods to, if any. Without one the
    /// server runs in direct mode: callers must already know where it
    /// is.
    pub registry: Option<SocketAddr>,
    /// The host to advertise to the registry. Defaults to the bound
    /// listener address, which is only right when that address is
    /// reachable by callers (it is not, say, `0.0.0.0`).
    pub advertise: Option<HostAddr>,
    /// Frame-size cap for every connection.
    pub max_frame_bytes: usize,
}

impl RpcServerConfig {
    /// Configuration for a direct-mode server on `listen`.
    pub fn new(listen: SocketAddr) -> Self {
        RpcServerConfig {
            listen,
            registry: None,
            advertise: None,
            max_frame_bytes: DEFAULT_MAX_FRAME,
        }
    }

    /// Announce registered methods to the registry at `registry`.
    pub fn with_registry(mut self, registry: SocketAddr) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Advertise `host` to the registry instead of the listener address.
    pub fn advertise(mut self, host: HostAddr) -> Self {
        self.advertise = Some(host);
        self
    }

    /// Use `max_frame_bytes` as the frame-size cap.
    pub fn max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }
}

/// A running RPC provider: a [`Router`] answering calls on a listener.
pub struct RpcServer {
    /// The route table calls are dispatched through.
    router: Arc<Router>,
    /// The underlying listener.
    server: Server,
    /// Our connection to the registry, when configured.
    registry: Option<RegistryClient>,
    /// The host we announce methods under.
    advertise: HostAddr,
}

impl RpcServer {
    /// Bind a server as described by `config`.
    ///
    /// In registry mode this also connects to the registry; methods are
    /// announced as they are registered.
    pub async fn bind(config: RpcServerConfig) -> Result<Self, RpcServerError> {
        let router = Arc::new(Router::new());
        let dispatcher = Arc::new(Dispatcher::new());
        {
            let router = Arc::clone(&router);
            dispatcher.register::<RpcRequest, _>(move |conn, id, req| {
                router.handle_rpc_request(conn, id, req);
            });
        }
        let server = Server::bind(config.listen, dispatcher, config.max_frame_bytes).await?;
        let advertise = match config.advertise {
            Some(host) => host,
            None => HostAddr::from(server.local_addr()?),
        };
        let registry = match config.registry {
            Some(addr) => {
                let client = RegistryClient::connect(addr, config.max_frame_bytes).await?;
                debug!("announcing methods to registry at {}", addr);
                Some(client)
            }
            None => None,
        };
        Ok(RpcServer {
            router,
            server,
            registry,
            advertise,
        })
    }

    /// Register `desc`: announce it to the registry (in registry mode),
    /// then bind it into the route table.
    pub async fn register(&self, desc: MethodDesc) -> Result<(), RpcServerError> {
        if let Some(registry) = &self.registry {
            registry.register_method(desc.name(), &self.advertise).await?;
        }
        self.router.register(desc);
        Ok(())
    }

    /// Return the address this server is listening on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Serve calls forever (or until the listener fails).
    pub async fn run(self) -> io::Result<()> {
        self.server.run().await
    }
}
