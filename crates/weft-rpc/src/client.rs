//! The caller assembly: one pinned provider, or registry-backed
//! discovery with a pooled connection per provider host.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, trace};

use weft_net::{
    Client, ConnectError, Connection, DisconnectHook, Dispatcher, Requestor,
    DEFAULT_SYNC_TIMEOUT,
};
use weft_proto::codec::DEFAULT_MAX_FRAME;
use weft_proto::msg::{HostAddr, JsonMap, MsgType};
use weft_registry::{DiscoveryClient, DiscoveryError, OfflineHook, RegistryError};

use crate::caller::{CallError, CallFuture, RpcCaller};

/// An error issuing a call through an [`RpcClient`].
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RpcClientError {
    /// We could not connect to a provider (or, at startup, the
    /// registry).
    #[error("unable to connect")]
    Connect(#[from] ConnectError),
    /// Setting up the registry connection failed.
    #[error("registry error")]
    Registry(#[from] RegistryError),
    /// No provider could be found for the method.
    #[error("discovery failed")]
    Discovery(#[from] DiscoveryError),
    /// A provider advertised an address we cannot dial.
    #[error("provider advertised an unusable address {0}")]
    BadAddress(HostAddr),
    /// The call itself failed.
    #[error(transparent)]
    Call(#[from] CallError),
}

/// Configuration for an [`RpcClient`].
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct RpcClientConfig {
    /// Where to connect: the registry (discovery mode) or the one
    /// provider (direct mode).
    pub addr: SocketAddr,
    /// Whether `addr` is a registry to consult, rather than a provider
    /// to pin.
    pub enable_discovery: bool,
    /// Bounded wait applied by the awaiting call flavor.
    pub sync_rpc_timeout: Duration,
    /// Frame-size cap for every connection.
    pub max_frame_bytes: usize,
}

impl RpcClientConfig {
    /// Configuration pinned to the single provider at `addr`.
    pub fn direct(addr: SocketAddr) -> Self {
        RpcClientConfig {
            addr,
            enable_discovery: false,
            sync_rpc_timeout: DEFAULT_SYNC_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME,
        }
    }

    /// Configuration that discovers providers through the registry at
    /// `addr`.
    pub fn with_registry(addr: SocketAddr) -> Self {
        RpcClientConfig {
            addr,
            enable_discovery: true,
            sync_rpc_timeout: DEFAULT_SYNC_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME,
        }
    }

    /// Use `timeout` as the bounded wait for awaited calls.
    pub fn sync_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.sync_rpc_timeout = timeout;
        self
    }

    /// Use `max_frame_bytes` as the frame-size cap.
    pub fn max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }
}

/// Where an [`RpcClient`] finds the peer for each call.
enum Backend {
    /// Every call goes to this one pinned provider.
    Direct(Client),
    /// Calls consult the registry and rotate across live providers.
    Discovery(DiscoveryClient),
}

/// A caller of remote methods.
///
/// In direct mode every call goes to the configured provider. In
/// discovery mode each call asks the registry (or the local cache it
/// feeds) for the method's providers, rotates across them, and reuses
/// pooled connections per provider host; a host the registry declares
/// offline has its pooled connection evicted and closed.
pub struct RpcClient {
    /// The configuration this client was built from.
    config: RpcClientConfig,
    /// Correlator shared by every provider connection.
    requestor: Arc<Requestor>,
    /// Builder/interpreter for the calls themselves.
    caller: RpcCaller,
    /// Handler table shared by every provider connection.
    dispatcher: Arc<Dispatcher>,
    /// How the peer for each call is chosen.
    backend: Backend,
    /// Pooled provider connections, by advertised host.
    pool: Arc<Mutex<HashMap<HostAddr, Arc<Client>>>>,
}

impl RpcClient {
    /// Build a client as described by `config`, connecting to the
    /// registry or the pinned provider as appropriate.
    pub async fn connect(config: RpcClientConfig) -> Result<Self, RpcClientError> {
        let dispatcher = Arc::new(Dispatcher::new());
        let requestor = Arc::new(Requestor::with_sync_timeout(config.sync_rpc_timeout));
        requestor.handle_responses(&dispatcher, MsgType::RSP_RPC);
        let caller = RpcCaller::new(Arc::clone(&requestor));
        let pool: Arc<Mutex<HashMap<HostAddr, Arc<Client>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let backend = if config.enable_discovery {
            // When a provider host goes offline, evict (and close) its
            // pooled connection so no further call is routed there.
            let hook: OfflineHook = {
                let pool = Arc::clone(&pool);
                Arc::new(move |host: &HostAddr| {
                    let evicted = pool.lock().expect("pool lock poisoned").remove(host);
                    if let Some(client) = evicted {
                        debug!("provider at {} went offline; dropping its connection", host);
                        client.shutdown();
                    }
                })
            };
            let discovery =
                DiscoveryClient::connect(config.addr, config.max_frame_bytes, Some(hook)).await?;
            Backend::Discovery(discovery)
        } else {
            let direct = Client::connect(
                config.addr,
                Arc::clone(&dispatcher),
                vec![Self::disconnect_hook(&requestor)],
                config.max_frame_bytes,
            )
            .await?;
            Backend::Direct(direct)
        };

        Ok(RpcClient {
            config,
            requestor,
            caller,
            dispatcher,
            backend,
            pool,
        })
    }

    /// Call `method` and wait (boundedly) for its result.
    pub async fn call(&self, method: &str, params: JsonMap) -> Result<Value, RpcClientError> {
        let conn = self.conn_for(method).await?;
        Ok(self.caller.call(&conn, method, params).await?)
    }

    /// As [`call`](RpcClient::call), with a per-call timeout.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: JsonMap,
        timeout: Duration,
    ) -> Result<Value, RpcClientError> {
        let conn = self.conn_for(method).await?;
        Ok(self
            .caller
            .call_with_timeout(&conn, method, params, timeout)
            .await?)
    }

    /// Call `method`, returning a future for its result.
    pub async fn call_future(
        &self,
        method: &str,
        params: JsonMap,
    ) -> Result<CallFuture, RpcClientError> {
        let conn = self.conn_for(method).await?;
        Ok(self.caller.call_future(&conn, method, params)?)
    }

    /// Call `method`, running `cb` with the outcome when the response
    /// arrives.
    pub async fn call_with<F>(
        &self,
        method: &str,
        params: JsonMap,
        cb: F,
    ) -> Result<(), RpcClientError>
    where
        F: FnOnce(Result<Value, CallError>) + Send + 'static,
    {
        let conn = self.conn_for(method).await?;
        Ok(self.caller.call_with(&conn, method, params, cb)?)
    }

    /// Return how many calls are currently outstanding.
    pub fn outstanding_calls(&self) -> usize {
        self.requestor.outstanding()
    }

    /// Pick the connection a call to `method` should use.
    async fn conn_for(&self, method: &str) -> Result<Arc<Connection>, RpcClientError> {
        match &self.backend {
            Backend::Direct(direct) => Ok(Arc::clone(direct.connection())),
            Backend::Discovery(discovery) => {
                let host = discovery.discover(method).await?;
                let client = self.pooled(&host).await?;
                Ok(Arc::clone(client.connection()))
            }
        }
    }

    /// Return a live pooled connection to `host`, dialing if needed.
    async fn pooled(&self, host: &HostAddr) -> Result<Arc<Client>, RpcClientError> {
        {
            let pool = self.pool.lock().expect("pool lock poisoned");
            if let Some(client) = pool.get(host) {
                if client.connected() {
                    return Ok(Arc::clone(client));
                }
                // A dead pooled connection: fall through and replace it.
            }
        }
        let addr = host
            .to_socket_addr()
            .map_err(|_| RpcClientError::BadAddress(host.clone()))?;
        trace!("dialing provider at {}", host);
        let client = Arc::new(
            Client::connect(
                addr,
                Arc::clone(&self.dispatcher),
                vec![Self::disconnect_hook(&self.requestor)],
                self.config.max_frame_bytes,
            )
            .await?,
        );
        self.pool
            .lock()
            .expect("pool lock poisoned")
            .insert(host.clone(), Arc::clone(&client));
        Ok(client)
    }

    /// The hook that fails a connection's outstanding calls when it
    /// dies.
    fn disconnect_hook(requestor: &Arc<Requestor>) -> DisconnectHook {
        let requestor = Arc::clone(requestor);
        Arc::new(move |conn: &Arc<Connection>| requestor.on_disconnect(conn.id()))
    }
}
