//! The registry's server side: who provides what, who wants to hear
//! about it, and the push notifications that connect the two.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use weft_net::{ConnId, Connection, Dispatcher, IdGenerator, Server};
use weft_proto::msg::{
    Envelope, HostAddr, RequestId, ResultCode, ServiceOp, ServiceRequest, ServiceResponse,
};

/// One connected provider: the host it advertises and the methods it
/// has registered over this connection.
///
/// The registry never initiates traffic toward a provider, so the
/// record carries no connection handle; the connection identity it is
/// keyed by is enough to reap it on disconnect.
struct ProviderRecord {
    /// The host other peers should dial to reach this provider.
    host: HostAddr,
    /// Every method this connection has registered.
    methods: BTreeSet<String>,
}

/// One connected discoverer: the methods it has asked about, and is
/// therefore subscribed to notifications for.
struct DiscovererRecord {
    /// The discoverer's connection.
    conn: Arc<Connection>,
    /// Every method this connection has discovered.
    methods: BTreeSet<String>,
}

/// The registry's four indexes, under one lock.
///
/// Invariant: a connection id appears in a `*_by_method` set exactly
/// when the corresponding `*_by_conn` record lists that method. Both
/// sides of that equivalence are updated under a single acquisition of
/// the lock, so no reader can observe them disagreeing.
#[derive(Default)]
struct Inner {
    /// method → provider connections currently offering it.
    providers_by_method: HashMap<String, BTreeSet<ConnId>>,
    /// provider connection → its record.
    providers_by_conn: HashMap<ConnId, ProviderRecord>,
    /// method → discoverer connections subscribed to it.
    discoverers_by_method: HashMap<String, BTreeSet<ConnId>>,
    /// discoverer connection → its record.
    discoverers_by_conn: HashMap<ConnId, DiscovererRecord>,
}

impl Inner {
    /// Collect the connections of every discoverer of `method`.
    fn discoverers_of(&self, method: &str) -> Vec<Arc<Connection>> {
        self.discoverers_by_method
            .get(method)
            .into_iter()
            .flatten()
            .filter_map(|id| self.discoverers_by_conn.get(id))
            .map(|rec| Arc::clone(&rec.conn))
            .collect()
    }

    /// Collect the advertised hosts of every provider of `method`.
    fn hosts_of(&self, method: &str) -> Vec<HostAddr> {
        self.providers_by_method
            .get(method)
            .into_iter()
            .flatten()
            .filter_map(|id| self.providers_by_conn.get(id))
            .map(|rec| rec.host.clone())
            .collect()
    }

    /// Drop `id` from one method-indexed set, pruning the set if empty.
    fn unlink(map: &mut HashMap<String, BTreeSet<ConnId>>, method: &str, id: ConnId) {
        let now_empty = match map.get_mut(method) {
            Some(set) => {
                set.remove(&id);
                set.is_empty()
            }
            None => false,
        };
        if now_empty {
            map.remove(method);
        }
    }
}

/// The registry core: provider and discoverer tables plus the
/// notification fan-out that keeps discoverers current.
///
/// Holds no sockets of its own; it is driven by a [`Dispatcher`] handler
/// for service requests and a disconnect hook, both installed by
/// [`RegistryServer`].
pub struct RegistryCore {
    /// All four indexes.
    inner: Mutex<Inner>,
    /// Fresh ids for pushed notifications (which answer no request, so
    /// they cannot echo one).
    ids: IdGenerator,
}

impl Default for RegistryCore {
    fn default() -> Self {
        RegistryCore::new()
    }
}

impl RegistryCore {
    /// Create a new, empty registry core.
    pub fn new() -> Self {
        RegistryCore {
            inner: Mutex::new(Inner::default()),
            ids: IdGenerator::new(),
        }
    }

    /// Handle one inbound service request.
    pub fn handle_service_request(
        &self,
        conn: &Arc<Connection>,
        id: RequestId,
        req: ServiceRequest,
    ) {
        match req.optype {
            ServiceOp::REGISTRY => self.on_registry(conn, id, req),
            ServiceOp::DISCOVERY => self.on_discovery(conn, id, req),
            other => {
                warn!("{}: service request with optype {}", conn, other);
                reply(
                    conn,
                    Envelope::new(id, ServiceResponse::error(other, ResultCode::INVALID_OPTYPE)),
                );
            }
        }
    }

    /// A provider announces that `host` provides `method`.
    fn on_registry(&self, conn: &Arc<Connection>, id: RequestId, req: ServiceRequest) {
        let Some(host) = req.host else {
            // The codec's checks make this unreachable for frames off
            // the wire; answer rather than trusting that.
            reply(
                conn,
                Envelope::new(
                    id,
                    ServiceResponse::error(ServiceOp::REGISTRY, ResultCode::INVALID_MSG),
                ),
            );
            return;
        };
        let method = req.method;

        let recipients = {
            let mut guard = self.inner.lock().expect("registry lock poisoned");
            let inner = &mut *guard;
            let record = inner
                .providers_by_conn
                .entry(conn.id())
                .or_insert_with(|| ProviderRecord {
                    host: host.clone(),
                    methods: BTreeSet::new(),
                });
            record.methods.insert(method.clone());
            inner
                .providers_by_method
                .entry(method.clone())
                .or_default()
                .insert(conn.id());
            inner.discoverers_of(&method)
            // Lock released before any notification is enqueued.
        };

        trace!("{}: registered {} at {}", conn, method, host);
        let notice = Envelope::new(
            self.ids.fresh_id(),
            ServiceRequest::notice(ServiceOp::ONLINE, method.as_str(), host.clone()),
        );
        for discoverer in recipients {
            reply(&discoverer, notice.clone());
        }

        reply(
            conn,
            Envelope::new(id, ServiceResponse::ok(ServiceOp::REGISTRY)),
        );
    }

    /// A discoverer asks which hosts provide `method`, and subscribes to
    /// future changes to that answer.
    fn on_discovery(&self, conn: &Arc<Connection>, id: RequestId, req: ServiceRequest) {
        let method = req.method;

        let hosts = {
            let mut guard = self.inner.lock().expect("registry lock poisoned");
            let inner = &mut *guard;
            let record = inner
                .discoverers_by_conn
                .entry(conn.id())
                .or_insert_with(|| DiscovererRecord {
                    conn: Arc::clone(conn),
                    methods: BTreeSet::new(),
                });
            record.methods.insert(method.clone());
            inner
                .discoverers_by_method
                .entry(method.clone())
                .or_default()
                .insert(conn.id());
            inner.hosts_of(&method)
        };

        let rsp = if hosts.is_empty() {
            debug!("{}: discovery for {}: no providers", conn, method);
            ServiceResponse::error(ServiceOp::DISCOVERY, ResultCode::NOT_FOUND_SERVICE)
        } else {
            trace!("{}: discovery for {}: {} host(s)", conn, method, hosts.len());
            ServiceResponse::discovered(method, hosts)
        };
        reply(conn, Envelope::new(id, rsp));
    }

    /// Reap everything keyed by a connection that has gone away.
    ///
    /// If it was a provider, each of its methods goes offline for that
    /// method's discoverers first; then both its provider and discoverer
    /// records (if any) are unlinked from every index.
    pub fn on_disconnect(&self, conn: &Arc<Connection>) {
        let notices: Vec<(Arc<Connection>, Envelope)> = {
            let mut guard = self.inner.lock().expect("registry lock poisoned");
            let inner = &mut *guard;
            let mut notices = Vec::new();

            if let Some(record) = inner.providers_by_conn.remove(&conn.id()) {
                debug!(
                    "{}: provider of {} method(s) disconnected",
                    conn,
                    record.methods.len()
                );
                for method in &record.methods {
                    let notice = Envelope::new(
                        self.ids.fresh_id(),
                        ServiceRequest::notice(ServiceOp::OFFLINE, method.as_str(), record.host.clone()),
                    );
                    for discoverer in inner.discoverers_of(method) {
                        notices.push((discoverer, notice.clone()));
                    }
                    Inner::unlink(&mut inner.providers_by_method, method, conn.id());
                }
            }

            if let Some(record) = inner.discoverers_by_conn.remove(&conn.id()) {
                for method in &record.methods {
                    Inner::unlink(&mut inner.discoverers_by_method, method, conn.id());
                }
            }

            notices
        };

        for (discoverer, notice) in notices {
            reply(&discoverer, notice);
        }
    }

    /// Return the advertised hosts currently providing `method`.
    pub fn hosts_for(&self, method: &str) -> Vec<HostAddr> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .hosts_of(method)
    }
}

/// Send `env` on `conn`, logging (rather than propagating) a dead peer.
///
/// A recipient that has disconnected will be reaped by its own
/// disconnect hook; failing to notify it is not an error.
fn reply(conn: &Arc<Connection>, env: Envelope) {
    if conn.send(env).is_err() {
        debug!("{}: dropping message for disconnected peer", conn);
    }
}

/// A ready-to-run registry: a [`RegistryCore`] wired onto a listener.
pub struct RegistryServer {
    /// The shared core.
    core: Arc<RegistryCore>,
    /// The underlying listener.
    server: Server,
}

impl RegistryServer {
    /// Bind a registry server on `addr`.
    pub async fn bind(addr: SocketAddr, max_frame_bytes: usize) -> io::Result<Self> {
        let core = Arc::new(RegistryCore::new());
        let dispatcher = Arc::new(Dispatcher::new());
        {
            let core = Arc::clone(&core);
            dispatcher.register::<ServiceRequest, _>(move |conn, id, req| {
                core.handle_service_request(conn, id, req);
            });
        }
        let mut server = Server::bind(addr, dispatcher, max_frame_bytes).await?;
        {
            let core = Arc::clone(&core);
            server.on_disconnect(Arc::new(move |conn| core.on_disconnect(conn)));
        }
        Ok(RegistryServer { core, server })
    }

    /// Return the address this registry is listening on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Return the core, for inspection.
    pub fn core(&self) -> &Arc<RegistryCore> {
        &self.core
    }

    /// Serve requests forever (or until the listener fails).
    pub async fn run(self) -> io::Result<()> {
        self.server.run().await
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
    use weft_proto::codec::DEFAULT_MAX_FRAME;

    /// A connection over an in-memory stream, with its peer end held
    /// open so the reactor stays up.
    fn test_conn() -> (Arc<Connection>, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let conn = Connection::launch(
            local,
            "duplex".to_owned(),
            Arc::new(Dispatcher::new()),
            vec![],
            DEFAULT_MAX_FRAME,
        );
        (conn, remote)
    }

    /// Drive a REGISTRY request into `core`.
    fn register(core: &RegistryCore, conn: &Arc<Connection>, method: &str, port: u16) {
        core.handle_service_request(
            conn,
            RequestId::from("req"),
            ServiceRequest::registry(method, HostAddr::new("127.0.0.1", port)),
        );
    }

    #[tokio::test]
    async fn provider_indexes_stay_symmetric() {
        let core = RegistryCore::new();
        let (conn_a, _peer_a) = test_conn();
        let (conn_b, _peer_b) = test_conn();

        register(&core, &conn_a, "Add", 1001);
        register(&core, &conn_a, "Echo", 1001);
        register(&core, &conn_b, "Add", 1002);

        {
            let inner = core.inner.lock().unwrap();
            // Both directions of the index agree.
            for (method, ids) in &inner.providers_by_method {
                for id in ids {
                    assert!(inner.providers_by_conn[id].methods.contains(method));
                }
            }
            for (id, rec) in &inner.providers_by_conn {
                for method in &rec.methods {
                    assert!(inner.providers_by_method[method].contains(id));
                }
            }
        }
        assert_eq!(core.hosts_for("Add").len(), 2);
        assert_eq!(core.hosts_for("Echo"), vec![HostAddr::new("127.0.0.1", 1001)]);

        // Re-registration of the same method is an upsert, not a dup.
        register(&core, &conn_a, "Add", 1001);
        assert_eq!(core.hosts_for("Add").len(), 2);

        core.on_disconnect(&conn_a);
        {
            let inner = core.inner.lock().unwrap();
            assert!(!inner.providers_by_conn.contains_key(&conn_a.id()));
            for ids in inner.providers_by_method.values() {
                assert!(!ids.contains(&conn_a.id()));
            }
        }
        assert_eq!(core.hosts_for("Add"), vec![HostAddr::new("127.0.0.1", 1002)]);
        assert_eq!(core.hosts_for("Echo"), vec![]);
    }

    #[tokio::test]
    async fn disconnect_reaps_discoverers_too() {
        let core = RegistryCore::new();
        let (conn, _peer) = test_conn();

        core.handle_service_request(
            &conn,
            RequestId::from("req"),
            ServiceRequest::discovery("Add"),
        );
        {
            let inner = core.inner.lock().unwrap();
            assert!(inner.discoverers_by_conn.contains_key(&conn.id()));
            assert!(inner.discoverers_by_method["Add"].contains(&conn.id()));
        }

        core.on_disconnect(&conn);
        {
            let inner = core.inner.lock().unwrap();
            assert!(inner.discoverers_by_conn.is_empty());
            assert!(inner.discoverers_by_method.is_empty());
        }
    }

    #[tokio::test]
    async fn unknown_optype_is_answered_not_fatal() {
        use futures::StreamExt as _;
        use tokio_util::codec::Framed;
        use weft_net::codec::EnvelopeCodec;

        let core = RegistryCore::new();
        let (conn, remote) = test_conn();
        core.handle_service_request(
            &conn,
            RequestId::from("req-9"),
            ServiceRequest::notice(99.into(), "Add", HostAddr::new("127.0.0.1", 1)),
        );
        assert!(conn.connected());

        let mut peer = Framed::new(remote, EnvelopeCodec::new(DEFAULT_MAX_FRAME));
        let env = peer.next().await.unwrap().unwrap();
        assert_eq!(env.id, RequestId::from("req-9"));
        let rsp: ServiceResponse = env.msg.try_into().unwrap();
        assert_eq!(rsp.rcode, ResultCode::INVALID_OPTYPE);
    }
}
