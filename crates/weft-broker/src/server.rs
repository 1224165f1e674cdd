//! The broker's server side: the topic ↔ subscriber graph and the
//! fan-out that delivers published payloads.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use weft_net::{ConnId, Connection, Dispatcher, Server};
use weft_proto::msg::{
    Envelope, RequestId, ResultCode, TopicOp, TopicRequest, TopicResponse,
};

/// One subscribed connection, and the names of every topic it is
/// subscribed to.
struct SubscriberRecord {
    /// The subscriber's connection.
    conn: Arc<Connection>,
    /// Every topic this connection is currently subscribed to.
    topics: Mutex<HashSet<String>>,
}

impl SubscriberRecord {
    /// Create a record for `conn` with no subscriptions.
    fn new(conn: &Arc<Connection>) -> Self {
        SubscriberRecord {
            conn: Arc::clone(conn),
            topics: Mutex::new(HashSet::new()),
        }
    }
}

/// One topic, and the records of every connection subscribed to it.
struct Topic {
    /// The topic's name.
    name: String,
    /// Current subscribers, keyed by connection identity.
    subscribers: Mutex<HashMap<ConnId, Arc<SubscriberRecord>>>,
}

impl Topic {
    /// Create an empty topic named `name`.
    fn new(name: &str) -> Self {
        Topic {
            name: name.to_owned(),
            subscribers: Mutex::new(HashMap::new()),
        }
    }
}

/// The broker's two top-level maps, under one lock.
#[derive(Default)]
struct Inner {
    /// Every topic, by name.
    topics: HashMap<String, Arc<Topic>>,
    /// Every subscribed connection, by identity.
    subscribers: HashMap<ConnId, Arc<SubscriberRecord>>,
}

/// The topic broker.
///
/// The topic set and the subscriber set are mutually indexed: a record
/// is in a topic's subscriber map exactly when the topic's name is in
/// the record's topic set. Every mutation that must touch both sides
/// does so under a single acquisition of the broker lock, taking the
/// per-topic and per-record locks inside it; that outer-before-inner
/// order is never reversed, and no lock at all is held while a
/// published payload is handed to a subscriber's connection.
pub struct TopicBroker {
    /// The two top-level maps.
    inner: Mutex<Inner>,
}

impl Default for TopicBroker {
    fn default() -> Self {
        TopicBroker::new()
    }
}

impl TopicBroker {
    /// Create a new broker with no topics.
    pub fn new() -> Self {
        TopicBroker {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Handle one inbound topic request, sending the reply on `conn`.
    pub fn handle_topic_request(&self, conn: &Arc<Connection>, id: RequestId, req: TopicRequest) {
        let outcome = match req.optype {
            TopicOp::CREATE => {
                self.create(&req.topic_key);
                Ok(())
            }
            TopicOp::REMOVE => self.remove(&req.topic_key),
            TopicOp::SUBSCRIBE => self.subscribe(conn, &req.topic_key),
            TopicOp::CANCEL => self.cancel(conn, &req.topic_key),
            TopicOp::PUBLISH => self.publish(&id, &req),
            other => {
                warn!("{}: topic request with optype {}", conn, other);
                Err(ResultCode::INVALID_OPTYPE)
            }
        };
        let rsp = match outcome {
            Ok(()) => TopicResponse::ok(),
            Err(rcode) => {
                debug!(
                    "{}: topic {} op {} failed: {}",
                    conn,
                    req.topic_key,
                    req.optype,
                    rcode.reason()
                );
                TopicResponse::error(rcode)
            }
        };
        if conn.send(Envelope::new(id, rsp)).is_err() {
            debug!("{}: dropping topic reply for disconnected peer", conn);
        }
    }

    /// Create `name` if it does not exist. Re-creation is a no-op
    /// success and does not disturb existing subscribers.
    fn create(&self, name: &str) {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        inner
            .topics
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(Topic::new(name)));
    }

    /// Remove `name`, detaching every subscriber from it.
    fn remove(&self, name: &str) -> Result<(), ResultCode> {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        let Some(topic) = inner.topics.remove(name) else {
            return Err(ResultCode::NOT_FOUND_TOPIC);
        };
        let subscribers = topic.subscribers.lock().expect("topic lock poisoned");
        for record in subscribers.values() {
            record
                .topics
                .lock()
                .expect("subscriber lock poisoned")
                .remove(name);
        }
        trace!("removed topic {} ({} subscribers)", name, subscribers.len());
        Ok(())
    }

    /// Subscribe `conn` to `name`.
    fn subscribe(&self, conn: &Arc<Connection>, name: &str) -> Result<(), ResultCode> {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        let Some(topic) = inner.topics.get(name).map(Arc::clone) else {
            return Err(ResultCode::NOT_FOUND_TOPIC);
        };
        let record = Arc::clone(
            inner
                .subscribers
                .entry(conn.id())
                .or_insert_with(|| Arc::new(SubscriberRecord::new(conn))),
        );
        topic
            .subscribers
            .lock()
            .expect("topic lock poisoned")
            .insert(conn.id(), Arc::clone(&record));
        record
            .topics
            .lock()
            .expect("subscriber lock poisoned")
            .insert(name.to_owned());
        trace!("{}: subscribed to {}", conn, name);
        Ok(())
    }

    /// Cancel `conn`'s subscription to `name`.
    fn cancel(&self, conn: &Arc<Connection>, name: &str) -> Result<(), ResultCode> {
        let inner = self.inner.lock().expect("broker lock poisoned");
        let Some(topic) = inner.topics.get(name) else {
            return Err(ResultCode::NOT_FOUND_TOPIC);
        };
        let Some(record) = inner.subscribers.get(&conn.id()) else {
            return Err(ResultCode::NOT_FOUND_TOPIC);
        };
        record
            .topics
            .lock()
            .expect("subscriber lock poisoned")
            .remove(name);
        topic
            .subscribers
            .lock()
            .expect("topic lock poisoned")
            .remove(&conn.id());
        trace!("{}: cancelled {}", conn, name);
        Ok(())
    }

    /// Fan `req` out to every current subscriber of its topic.
    ///
    /// The subscriber set is snapshotted under the topic lock and
    /// traversed with no locks held. One subscriber's dead connection
    /// does not abort delivery to the rest; that subscriber is about to
    /// be reaped by its own disconnect hook anyway.
    fn publish(&self, id: &RequestId, req: &TopicRequest) -> Result<(), ResultCode> {
        let topic = {
            let inner = self.inner.lock().expect("broker lock poisoned");
            inner
                .topics
                .get(&req.topic_key)
                .map(Arc::clone)
                .ok_or(ResultCode::NOT_FOUND_TOPIC)?
        };
        let recipients: Vec<Arc<Connection>> = {
            let subscribers = topic.subscribers.lock().expect("topic lock poisoned");
            subscribers
                .values()
                .map(|record| Arc::clone(&record.conn))
                .collect()
        };
        trace!(
            "publishing on {} to {} subscriber(s)",
            topic.name,
            recipients.len()
        );
        for subscriber in recipients {
            if subscriber.send(Envelope::new(id.clone(), req.clone())).is_err() {
                debug!("{}: dropping publish for disconnected subscriber", subscriber);
            }
        }
        Ok(())
    }

    /// Detach a dying connection from every topic it subscribed to.
    pub fn on_disconnect(&self, conn: &Arc<Connection>) {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        let Some(record) = inner.subscribers.remove(&conn.id()) else {
            return;
        };
        let names: Vec<String> = record
            .topics
            .lock()
            .expect("subscriber lock poisoned")
            .iter()
            .cloned()
            .collect();
        for name in names {
            if let Some(topic) = inner.topics.get(&name) {
                topic
                    .subscribers
                    .lock()
                    .expect("topic lock poisoned")
                    .remove(&conn.id());
            }
        }
        debug!("{}: reaped subscriber record", conn);
    }
}

/// A ready-to-run topic broker: a [`TopicBroker`] wired onto a listener.
pub struct TopicServer {
    /// The shared broker state.
    broker: Arc<TopicBroker>,
    /// The underlying listener.
    server: Server,
}

impl TopicServer {
    /// Bind a topic server on `addr`.
    pub async fn bind(addr: SocketAddr, max_frame_bytes: usize) -> io::Result<Self> {
        let broker = Arc::new(TopicBroker::new());
        let dispatcher = Arc::new(Dispatcher::new());
        {
            let broker = Arc::clone(&broker);
            dispatcher.register::<TopicRequest, _>(move |conn, id, req| {
                broker.handle_topic_request(conn, id, req);
            });
        }
        let mut server = Server::bind(addr, dispatcher, max_frame_bytes).await?;
        {
            let broker = Arc::clone(&broker);
            server.on_disconnect(Arc::new(move |conn| broker.on_disconnect(conn)));
        }
        Ok(TopicServer { broker, server })
    }

    /// Return the address this broker is listening on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.server.local_addr()
    }

    /// Return the broker state, for inspection.
    pub fn broker(&self) -> &Arc<TopicBroker> {
        &self.broker
    }

    /// Serve requests forever (or until the listener fails).
    pub async fn run(self) -> io::Result<()> {
        self.server.run().await
    }
}
