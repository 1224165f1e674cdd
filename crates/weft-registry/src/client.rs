//! The registry's client sides: announcing methods (providers) and
//! finding them (discoverers).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use weft_net::{
    Client, ConnectError, Connection, DisconnectHook, Dispatcher, RequestError, Requestor,
};
use weft_proto::msg::{
    Envelope, HostAddr, MsgType, RequestId, ResultCode, ServiceOp, ServiceRequest,
    ServiceResponse,
};

/// An error talking to the registry as a provider.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// We could not reach the registry at all.
    #[error("unable to reach the registry")]
    Connect(#[from] ConnectError),
    /// The request could not be completed.
    #[error("registry request failed")]
    Request(#[from] RequestError),
    /// The registry answered, refusing the operation.
    #[error("registry refused the operation: {}", .0.reason())]
    Refused(ResultCode),
    /// The registry answered with a body we did not expect.
    #[error("registry sent an unexpected response type")]
    UnexpectedResponse,
}

/// An error discovering a method's providers.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DiscoveryError {
    /// We could not reach the registry at all.
    #[error("unable to reach the registry")]
    Connect(#[from] ConnectError),
    /// The request could not be completed.
    #[error("discovery request failed")]
    Request(#[from] RequestError),
    /// The registry answered, refusing the query.
    #[error("registry refused the discovery: {}", .0.reason())]
    Refused(ResultCode),
    /// The registry answered successfully but listed no usable host.
    #[error("no live provider for method {0}")]
    NoProviders(String),
    /// The registry answered with a body we did not expect.
    #[error("registry sent an unexpected response type")]
    UnexpectedResponse,
}

/// A hook run when a provider host goes offline.
///
/// The RPC client uses this to evict pooled connections to the dead
/// host.
pub type OfflineHook = Arc<dyn Fn(&HostAddr) + Send + Sync>;

/// The live host list for one method, with round-robin selection.
///
/// Updated concurrently by pushed notifications while callers are
/// choosing from it.
#[derive(Default)]
pub struct MethodHosts {
    /// The hosts currently believed to provide the method.
    hosts: Mutex<Vec<HostAddr>>,
    /// Monotonic pick counter. Taken modulo the *current* list length
    /// at read time, so the list may grow and shrink freely without any
    /// recomputation here.
    next: AtomicUsize,
}

impl MethodHosts {
    /// Create a host list seeded with `hosts`.
    fn new(hosts: Vec<HostAddr>) -> Self {
        MethodHosts {
            hosts: Mutex::new(hosts),
            next: AtomicUsize::new(0),
        }
    }

    /// Pick the next host, round-robin. None if the list is empty.
    pub fn choose(&self) -> Option<HostAddr> {
        let hosts = self.hosts.lock().expect("host list lock poisoned");
        if hosts.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % hosts.len();
        Some(hosts[idx].clone())
    }

    /// Return true if no host is currently listed.
    pub fn is_empty(&self) -> bool {
        self.hosts.lock().expect("host list lock poisoned").is_empty()
    }

    /// Return a snapshot of the current list.
    pub fn all(&self) -> Vec<HostAddr> {
        self.hosts.lock().expect("host list lock poisoned").clone()
    }

    /// Add a host. A provider that re-announces a method must not
    /// appear twice.
    fn add(&self, host: HostAddr) {
        let mut hosts = self.hosts.lock().expect("host list lock poisoned");
        if !hosts.contains(&host) {
            hosts.push(host);
        }
    }

    /// Remove a host, if present.
    fn remove(&self, host: &HostAddr) {
        let mut hosts = self.hosts.lock().expect("host list lock poisoned");
        hosts.retain(|h| h != host);
    }
}

/// Caller-side discovery state: a `method → hosts` cache kept current by
/// discovery replies and pushed notifications.
pub struct Discoverer {
    /// Correlator for the discovery requests we send.
    requestor: Arc<Requestor>,
    /// What we currently know about each method.
    known: Mutex<HashMap<String, Arc<MethodHosts>>>,
    /// Run when a host goes offline.
    offline_hook: Option<OfflineHook>,
}

impl Discoverer {
    /// Create a new Discoverer using `requestor` for its requests.
    pub fn new(requestor: Arc<Requestor>, offline_hook: Option<OfflineHook>) -> Self {
        Discoverer {
            requestor,
            known: Mutex::new(HashMap::new()),
            offline_hook,
        }
    }

    /// Return a host providing `method`, consulting the registry over
    /// `conn` if the local cache has nothing.
    pub async fn discover(
        &self,
        conn: &Connection,
        method: &str,
    ) -> Result<HostAddr, DiscoveryError> {
        {
            let known = self.known.lock().expect("discoverer lock poisoned");
            if let Some(hosts) = known.get(method) {
                if let Some(host) = hosts.choose() {
                    return Ok(host);
                }
            }
            // Nothing cached (or everything offline): fall through and
            // ask the registry again.
        }

        let req = Envelope::new(
            self.requestor.fresh_id(),
            ServiceRequest::discovery(method),
        );
        let rsp = self.requestor.send_sync(conn, req).await?;
        let rsp: ServiceResponse = rsp
            .msg
            .try_into()
            .map_err(|_| DiscoveryError::UnexpectedResponse)?;
        if rsp.rcode != ResultCode::OK {
            debug!("discovery for {} failed: {}", method, rsp.rcode.reason());
            return Err(DiscoveryError::Refused(rsp.rcode));
        }

        let hosts = Arc::new(MethodHosts::new(rsp.hosts.unwrap_or_default()));
        let chosen = hosts
            .choose()
            .ok_or_else(|| DiscoveryError::NoProviders(method.to_owned()))?;
        self.known
            .lock()
            .expect("discoverer lock poisoned")
            .insert(method.to_owned(), hosts);
        Ok(chosen)
    }

    /// Handle a pushed ONLINE/OFFLINE notification.
    ///
    /// Registered on the dispatcher for inbound service *requests*: on a
    /// discovery connection, those are always pushes from the registry.
    pub fn on_notice(&self, conn: &Arc<Connection>, _id: RequestId, req: ServiceRequest) {
        let Some(host) = req.host else {
            // check() requires a host on every non-DISCOVERY optype, so
            // a push without one never leaves the codec.
            debug!("{}: notification without a host", conn);
            return;
        };
        match req.optype {
            ServiceOp::ONLINE => {
                trace!("{}: {} online at {}", conn, req.method, host);
                self.known
                    .lock()
                    .expect("discoverer lock poisoned")
                    .entry(req.method)
                    .or_default()
                    .add(host);
            }
            ServiceOp::OFFLINE => {
                trace!("{}: {} offline at {}", conn, req.method, host);
                if let Some(hosts) = self
                    .known
                    .lock()
                    .expect("discoverer lock poisoned")
                    .get(&req.method)
                {
                    hosts.remove(&host);
                }
                if let Some(hook) = &self.offline_hook {
                    hook(&host);
                }
            }
            other => {
                debug!("{}: ignoring pushed service request with optype {}", conn, other);
            }
        }
    }

    /// Return the cached host list for `method`, without consulting the
    /// registry.
    pub fn cached_hosts(&self, method: &str) -> Vec<HostAddr> {
        self.known
            .lock()
            .expect("discoverer lock poisoned")
            .get(method)
            .map(|hosts| hosts.all())
            .unwrap_or_default()
    }
}

/// A provider's connection to the registry.
pub struct RegistryClient {
    /// The underlying connection.
    client: Client,
    /// Correlator for registration requests.
    requestor: Arc<Requestor>,
}

impl RegistryClient {
    /// Connect to the registry at `addr`.
    pub async fn connect(
        addr: SocketAddr,
        max_frame_bytes: usize,
    ) -> Result<Self, RegistryError> {
        let dispatcher = Arc::new(Dispatcher::new());
        let requestor = Arc::new(Requestor::new());
        requestor.handle_responses(&dispatcher, MsgType::RSP_SERVICE);
        let hook: DisconnectHook = {
            let requestor = Arc::clone(&requestor);
            Arc::new(move |conn: &Arc<Connection>| requestor.on_disconnect(conn.id()))
        };
        let client = Client::connect(addr, dispatcher, vec![hook], max_frame_bytes).await?;
        Ok(RegistryClient { client, requestor })
    }

    /// Announce that `host` provides `method`.
    pub async fn register_method(
        &self,
        method: &str,
        host: &HostAddr,
    ) -> Result<(), RegistryError> {
        let req = Envelope::new(
            self.requestor.fresh_id(),
            ServiceRequest::registry(method, host.clone()),
        );
        let rsp = self
            .requestor
            .send_sync(self.client.connection(), req)
            .await?;
        let rsp: ServiceResponse = rsp
            .msg
            .try_into()
            .map_err(|_| RegistryError::UnexpectedResponse)?;
        if rsp.rcode != ResultCode::OK {
            return Err(RegistryError::Refused(rsp.rcode));
        }
        debug!("registered {} at {}", method, host);
        Ok(())
    }

    /// Close the connection to the registry.
    pub fn shutdown(&self) {
        self.client.shutdown();
    }
}

/// A caller's connection to the registry, wrapping a [`Discoverer`].
pub struct DiscoveryClient {
    /// The underlying connection.
    client: Client,
    /// The discovery state fed by this connection.
    discoverer: Arc<Discoverer>,
}

impl DiscoveryClient {
    /// Connect to the registry at `addr`.
    ///
    /// `offline_hook`, if given, runs whenever the registry pushes an
    /// OFFLINE notification for any method we have discovered.
    pub async fn connect(
        addr: SocketAddr,
        max_frame_bytes: usize,
        offline_hook: Option<OfflineHook>,
    ) -> Result<Self, RegistryError> {
        let dispatcher = Arc::new(Dispatcher::new());
        let requestor = Arc::new(Requestor::new());
        requestor.handle_responses(&dispatcher, MsgType::RSP_SERVICE);
        let discoverer = Arc::new(Discoverer::new(Arc::clone(&requestor), offline_hook));
        {
            let discoverer = Arc::clone(&discoverer);
            dispatcher.register::<ServiceRequest, _>(move |conn, id, req| {
                discoverer.on_notice(conn, id, req);
            });
        }
        let hook: DisconnectHook = {
            let requestor = Arc::clone(&requestor);
            Arc::new(move |conn: &Arc<Connection>| requestor.on_disconnect(conn.id()))
        };
        let client = Client::connect(addr, dispatcher, vec![hook], max_frame_bytes).await?;
        Ok(DiscoveryClient { client, discoverer })
    }

    /// Return a host providing `method`, consulting the registry if the
    /// local cache has nothing.
    pub async fn discover(&self, method: &str) -> Result<HostAddr, DiscoveryError> {
        self.discoverer
            .discover(self.client.connection(), method)
            .await
    }

    /// Return the discovery state, for direct inspection.
    pub fn discoverer(&self) -> &Arc<Discoverer> {
        &self.discoverer
    }

    /// Close the connection to the registry.
    pub fn shutdown(&self) {
        self.client.shutdown();
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    use super::*;

    /// Shorthand for a localhost HostAddr.
    fn host(port: u16) -> HostAddr {
        HostAddr::new("127.0.0.1", port)
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let hosts = MethodHosts::new(vec![host(1), host(2), host(3)]);
        let picks: Vec<u16> = (0..6).map(|_| hosts.choose().unwrap().port).collect();
        assert_eq!(picks, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn round_robin_survives_growth_and_shrinkage() {
        let hosts = MethodHosts::new(vec![host(1), host(2)]);
        assert_eq!(hosts.choose().unwrap().port, 1);
        assert_eq!(hosts.choose().unwrap().port, 2);

        hosts.add(host(3));
        // The counter keeps running; every host still gets picked.
        let picks: Vec<u16> = (0..3).map(|_| hosts.choose().unwrap().port).collect();
        assert_eq!(picks, vec![3, 1, 2]);

        hosts.remove(&host(1));
        hosts.remove(&host(2));
        assert_eq!(hosts.choose().unwrap().port, 3);

        hosts.remove(&host(3));
        assert!(hosts.choose().is_none());
        assert!(hosts.is_empty());
    }

    #[test]
    fn duplicate_hosts_collapse() {
        let hosts = MethodHosts::default();
        hosts.add(host(1));
        hosts.add(host(1));
        assert_eq!(hosts.all(), vec![host(1)]);
    }
}
