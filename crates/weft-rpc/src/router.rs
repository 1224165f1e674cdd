//! The provider-side route table: method declarations, parameter
//! checking, and handler invocation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, trace, warn};

use weft_net::Connection;
use weft_proto::msg::{Envelope, JsonMap, RequestId, ResultCode, RpcRequest, RpcResponse};

/// The JSON shapes a declared parameter or return value may take.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParamKind {
    /// A JSON boolean.
    Bool,
    /// A JSON number with an integer value.
    Integral,
    /// Any JSON number.
    Numeric,
    /// A JSON string.
    String,
    /// A JSON array.
    Array,
    /// A JSON object.
    Object,
}

impl ParamKind {
    /// Return true if `value` has this shape.
    fn admits(self, value: &Value) -> bool {
        match self {
            ParamKind::Bool => value.is_boolean(),
            ParamKind::Integral => value.is_i64() || value.is_u64(),
            ParamKind::Numeric => value.is_number(),
            ParamKind::String => value.is_string(),
            ParamKind::Array => value.is_array(),
            ParamKind::Object => value.is_object(),
        }
    }
}

/// An error reported by a method handler.
///
/// Reaches the caller as [`ResultCode::INVALID_ERROR`]; the connection
/// itself is unaffected.
#[derive(Clone, Debug, thiserror::Error)]
#[error("method handler failed: {0}")]
#[non_exhaustive]
pub struct HandlerError(String);

impl HandlerError {
    /// Create a new HandlerError with the given message.
    pub fn new(msg: impl Into<String>) -> Self {
        HandlerError(msg.into())
    }
}

/// The function that implements a method.
///
/// Handlers run on the reactor task of the connection that carried the
/// request and are given the request's (already schema-checked)
/// parameters. They run to completion; there is no handler timeout.
pub type MethodHandler = Box<dyn Fn(&JsonMap) -> Result<Value, HandlerError> + Send + Sync>;

/// Everything the router knows about one method: its name, its
/// parameter schema, its declared return shape, and its handler.
pub struct MethodDesc {
    /// The method's name, as dispatched on the wire.
    name: String,
    /// Declared parameters: each must be present with the right shape.
    params: Vec<(String, ParamKind)>,
    /// The declared shape of the return value.
    ///
    /// Recorded for documentation and tooling; the router does not
    /// second-guess what a handler returns.
    returns: ParamKind,
    /// The local function implementing the method.
    handler: MethodHandler,
}

impl MethodDesc {
    /// Start building a description of the method `name`.
    pub fn builder(name: impl Into<String>) -> MethodDescBuilder {
        MethodDescBuilder {
            name: name.into(),
            params: Vec::new(),
            returns: ParamKind::Object,
            handler: None,
        }
    }

    /// Return this method's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return this method's declared return shape.
    pub fn returns(&self) -> ParamKind {
        self.returns
    }

    /// Return true if `params` carries every declared parameter with
    /// the declared shape.
    ///
    /// Undeclared extra parameters are allowed through: the schema says
    /// what the handler needs, not everything the caller may know.
    fn params_match(&self, params: &JsonMap) -> bool {
        self.params.iter().all(|(name, kind)| {
            params.get(name).is_some_and(|value| kind.admits(value))
        })
    }
}

/// Builder for a [`MethodDesc`].
pub struct MethodDescBuilder {
    /// The method's name.
    name: String,
    /// Declared parameters so far.
    params: Vec<(String, ParamKind)>,
    /// Declared return shape.
    returns: ParamKind,
    /// The handler, once given.
    handler: Option<MethodHandler>,
}

impl MethodDescBuilder {
    /// Declare a parameter that callers must supply.
    pub fn param(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.params.push((name.into(), kind));
        self
    }

    /// Declare the shape of the return value.
    pub fn returns(mut self, kind: ParamKind) -> Self {
        self.returns = kind;
        self
    }

    /// Bind the function that implements the method.
    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&JsonMap) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Finish the description.
    ///
    /// A description built without a handler answers every call with an
    /// internal error; that is a bug in the provider, not the caller.
    pub fn build(self) -> MethodDesc {
        let name = self.name;
        let handler = self.handler.unwrap_or_else(|| {
            Box::new(|_params: &JsonMap| Err(HandlerError::new("method has no handler bound")))
        });
        MethodDesc {
            name,
            params: self.params,
            returns: self.returns,
            handler,
        }
    }
}

/// The method route table.
///
/// Built at startup and effectively immutable afterwards: nothing in
/// the core re-binds a live method.
#[derive(Default)]
pub struct Router {
    /// Registered methods, by name.
    methods: RwLock<HashMap<String, Arc<MethodDesc>>>,
}

impl Router {
    /// Create a new, empty Router.
    pub fn new() -> Self {
        Router::default()
    }

    /// Add `desc` to the table. Registering a name twice replaces the
    /// earlier binding.
    pub fn register(&self, desc: MethodDesc) {
        let mut methods = self.methods.write().expect("router lock poisoned");
        if let Some(old) = methods.insert(desc.name.clone(), Arc::new(desc)) {
            debug!("re-registered method {}", old.name());
        }
    }

    /// Handle one inbound call request, sending the reply on `conn`.
    ///
    /// An unknown method name yields a NOT_FOUND_SERVICE *response*, not
    /// a connection close: in a proxied deployment the method table may
    /// legitimately differ per peer.
    pub fn handle_rpc_request(&self, conn: &Arc<Connection>, id: RequestId, req: RpcRequest) {
        let desc = {
            let methods = self.methods.read().expect("router lock poisoned");
            methods.get(&req.method).map(Arc::clone)
        };
        let rsp = match desc {
            None => {
                debug!("{}: call to unknown method {}", conn, req.method);
                RpcResponse::error(ResultCode::NOT_FOUND_SERVICE)
            }
            Some(desc) if !desc.params_match(&req.params) => {
                debug!("{}: bad parameters for {}", conn, req.method);
                RpcResponse::error(ResultCode::INVALID_PARAMS)
            }
            Some(desc) => match (desc.handler)(&req.params) {
                Ok(value) => {
                    trace!("{}: {} ok", conn, req.method);
                    RpcResponse::ok(value)
                }
                Err(e) => {
                    warn!("{}: handler for {} failed: {}", conn, req.method, e);
                    RpcResponse::error(ResultCode::INVALID_ERROR)
                }
            },
        };
        if conn.send(Envelope::new(id, rsp)).is_err() {
            debug!("{}: dropping rpc reply for disconnected peer", conn);
        }
    }
}
