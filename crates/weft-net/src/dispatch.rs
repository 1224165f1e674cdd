//! Route each well-formed inbound message to the handler registered for
//! its message type.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use weft_proto::msg::{Envelope, MsgBody, MsgType, RequestId};

use crate::conn::Connection;

/// A type-erased message handler.
///
/// Handlers run on the reactor task of the connection that received the
/// message, so they must be short and must not block; anything slow
/// belongs on its own task.
type RawHandler = Arc<dyn Fn(&Arc<Connection>, Envelope) + Send + Sync>;

/// A mapping from message type to handler.
///
/// Each role builds one of these at startup and shares it across every
/// connection it owns. Registration is allowed while connections are
/// already dispatching, though in practice nobody registers after
/// startup.
#[derive(Default)]
pub struct Dispatcher {
    /// The handler table.
    handlers: RwLock<HashMap<MsgType, RawHandler>>,
}

impl Dispatcher {
    /// Create a new, empty Dispatcher.
    pub fn new() -> Self {
        Dispatcher::default()
    }

    /// Register `handler` for the message type that carries `M`.
    ///
    /// The dispatcher narrows the envelope to `M` before calling, so the
    /// handler never sees a body of the wrong variant. Registering a
    /// second handler for the same type replaces the first.
    pub fn register<M, F>(&self, handler: F)
    where
        M: MsgBody,
        F: Fn(&Arc<Connection>, RequestId, M) + Send + Sync + 'static,
    {
        self.register_raw(M::MSG_TYPE, move |conn, env| {
            let id = env.id;
            match M::try_from(env.msg) {
                Ok(msg) => handler(conn, id, msg),
                Err(_) => {
                    // The codec selects the variant from the same mtype
                    // we registered under, so this arm is unreachable
                    // for frames that came off the wire.
                    debug!("{}: message {} had an unexpected body variant", conn, id);
                }
            }
        });
    }

    /// Register `handler` for `mtype` without narrowing.
    ///
    /// Used where one handler serves whole envelopes, such as routing
    /// every response frame into a requestor.
    pub fn register_raw<F>(&self, mtype: MsgType, handler: F)
    where
        F: Fn(&Arc<Connection>, Envelope) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .expect("dispatcher lock poisoned")
            .insert(mtype, Arc::new(handler));
    }

    /// Deliver `env` to the handler registered for its message type.
    ///
    /// A message type with no handler means the peer is speaking a
    /// protocol this role does not implement; the connection is closed.
    pub fn dispatch(&self, conn: &Arc<Connection>, env: Envelope) {
        let handler = {
            let handlers = self.handlers.read().expect("dispatcher lock poisoned");
            handlers.get(&env.mtype()).map(Arc::clone)
            // Lock released here: handlers run arbitrary role code.
        };
        match handler {
            Some(handler) => handler(conn, env),
            None => {
                warn!(
                    "{}: no handler for message type {}; closing connection",
                    conn,
                    env.mtype()
                );
                conn.shutdown();
            }
        }
    }
}
