//! The broker's client side: topic verbs and the callback table that
//! receives fanned-out payloads.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use weft_net::{
    Client, ConnectError, Connection, DisconnectHook, Dispatcher, RequestError, Requestor,
};
use weft_proto::msg::{
    Envelope, MsgType, RequestId, ResultCode, TopicOp, TopicRequest, TopicResponse,
};

/// An error performing a topic operation.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TopicError {
    /// We could not reach the broker at all.
    #[error("unable to reach the broker")]
    Connect(#[from] ConnectError),
    /// The request could not be completed.
    #[error("topic request failed")]
    Request(#[from] RequestError),
    /// The broker answered, refusing the operation.
    #[error("broker refused the operation: {}", .0.reason())]
    Refused(ResultCode),
    /// The broker answered with a body we did not expect.
    #[error("broker sent an unexpected response type")]
    UnexpectedResponse,
}

/// A callback run for each payload published on a subscribed topic.
///
/// Arguments are the topic name and the payload. Runs on the
/// connection's reactor task: keep it short, hand anything slow to a
/// channel.
pub type SubscribeCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// A client connection to a topic broker.
pub struct TopicClient {
    /// The underlying connection.
    client: Client,
    /// Correlator for the requests we send.
    requestor: Arc<Requestor>,
    /// Callbacks for the topics we are subscribed to.
    ///
    /// Shared with the dispatcher handler that receives fanned-out
    /// publishes.
    subscriptions: Arc<Mutex<HashMap<String, SubscribeCallback>>>,
}

impl TopicClient {
    /// Connect to the broker at `addr`.
    pub async fn connect(addr: SocketAddr, max_frame_bytes: usize) -> Result<Self, TopicError> {
        let dispatcher = Arc::new(Dispatcher::new());
        let requestor = Arc::new(Requestor::new());
        requestor.handle_responses(&dispatcher, MsgType::RSP_TOPIC);

        let subscriptions: Arc<Mutex<HashMap<String, SubscribeCallback>>> =
            Arc::new(Mutex::new(HashMap::new()));
        {
            let subscriptions = Arc::clone(&subscriptions);
            dispatcher.register::<TopicRequest, _>(move |conn, id, req| {
                on_publish(&subscriptions, conn, id, req);
            });
        }

        let hook: DisconnectHook = {
            let requestor = Arc::clone(&requestor);
            Arc::new(move |conn: &Arc<Connection>| requestor.on_disconnect(conn.id()))
        };
        let client = Client::connect(addr, dispatcher, vec![hook], max_frame_bytes).await?;
        Ok(TopicClient {
            client,
            requestor,
            subscriptions,
        })
    }

    /// Create `topic` on the broker. Succeeds if it already exists.
    pub async fn create(&self, topic: &str) -> Result<(), TopicError> {
        self.request(TopicRequest::new(TopicOp::CREATE, topic)).await
    }

    /// Remove `topic` from the broker, detaching all subscribers.
    pub async fn remove(&self, topic: &str) -> Result<(), TopicError> {
        self.request(TopicRequest::new(TopicOp::REMOVE, topic)).await
    }

    /// Subscribe to `topic`, running `callback` for every payload
    /// published on it.
    ///
    /// The callback is installed before the request is sent — a payload
    /// fanned out between the broker's acknowledgment and our receipt of
    /// it must not be dropped — and uninstalled again if the request
    /// fails.
    pub async fn subscribe(&self, topic: &str, callback: SubscribeCallback) -> Result<(), TopicError> {
        self.subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .insert(topic.to_owned(), callback);
        let outcome = self
            .request(TopicRequest::new(TopicOp::SUBSCRIBE, topic))
            .await;
        if outcome.is_err() {
            self.subscriptions
                .lock()
                .expect("subscription lock poisoned")
                .remove(topic);
        }
        outcome
    }

    /// Cancel our subscription to `topic`.
    pub async fn cancel(&self, topic: &str) -> Result<(), TopicError> {
        self.subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .remove(topic);
        self.request(TopicRequest::new(TopicOp::CANCEL, topic)).await
    }

    /// Publish `payload` on `topic`.
    pub async fn publish(&self, topic: &str, payload: &str) -> Result<(), TopicError> {
        self.request(TopicRequest::publish(topic, payload)).await
    }

    /// Close the connection to the broker.
    pub fn shutdown(&self) {
        self.client.shutdown();
    }

    /// Send one topic request and interpret the reply.
    async fn request(&self, req: TopicRequest) -> Result<(), TopicError> {
        let req = Envelope::new(self.requestor.fresh_id(), req);
        let rsp = self
            .requestor
            .send_sync(self.client.connection(), req)
            .await?;
        let rsp: TopicResponse = rsp
            .msg
            .try_into()
            .map_err(|_| TopicError::UnexpectedResponse)?;
        if rsp.rcode != ResultCode::OK {
            return Err(TopicError::Refused(rsp.rcode));
        }
        Ok(())
    }
}

/// Handle a topic request pushed down from the broker.
///
/// On a client connection these are always PUBLISH fan-outs; anything
/// else is logged and dropped.
fn on_publish(
    subscriptions: &Mutex<HashMap<String, SubscribeCallback>>,
    conn: &Arc<Connection>,
    _id: RequestId,
    req: TopicRequest,
) {
    if req.optype != TopicOp::PUBLISH {
        debug!("{}: ignoring pushed topic request with optype {}", conn, req.optype);
        return;
    }
    let Some(payload) = req.topic_msg else {
        // check() requires a payload on every PUBLISH, so this never
        // leaves the codec.
        debug!("{}: publish without a payload", conn);
        return;
    };
    let callback = {
        let subscriptions = subscriptions.lock().expect("subscription lock poisoned");
        subscriptions.get(&req.topic_key).map(Arc::clone)
        // Lock released before the callback runs.
    };
    match callback {
        Some(callback) => {
            trace!("{}: payload on {}", conn, req.topic_key);
            callback(&req.topic_key, &payload);
        }
        None => {
            // Raced with a cancel, or the broker is confused. Either
            // way, not fatal.
            debug!("{}: payload on {} with no subscription", conn, req.topic_key);
        }
    }
}
