//! Messages sent between peers on a weft fabric.
//!
//! Every frame on the wire carries one message. A message is a request
//! id plus a typed body: the body's variant is selected by the `mtype`
//! field of the frame header, and its content is a JSON object.
//!
//! This module implements the six body types, the open integer
//! enumerations they embed, and the semantic checks that run before a
//! decoded message is allowed anywhere near a handler.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use caret::caret_int;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Alias for the JSON object type used for message bodies and RPC
/// parameters.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

caret_int! {
    /// The type of a message, as encoded in the frame header.
    ///
    /// The value of the MsgType selects which body type the frame
    /// carries. Peers must agree on this numbering.
    #[derive(Hash)]
    pub struct MsgType(u32) {
        /// An RPC call request.
        REQ_RPC = 0,
        /// The reply to an RPC call.
        RSP_RPC = 1,
        /// A topic operation (create, remove, subscribe, cancel, publish).
        REQ_TOPIC = 2,
        /// The reply to a topic operation.
        RSP_TOPIC = 3,
        /// A registry operation (register, discover) or a pushed
        /// online/offline notification.
        REQ_SERVICE = 4,
        /// The reply to a registry operation.
        RSP_SERVICE = 5,
    }
}

caret_int! {
    /// Outcome code carried by every response body.
    ///
    /// Zero is success; everything else is a failure. A response with a
    /// non-zero code may omit its payload fields.
    #[derive(Hash)]
    pub struct ResultCode(u32) {
        /// The request was handled successfully.
        OK = 0,
        /// The peer could not parse a message.
        PARSE_FAILED = 1,
        /// The peer received a message type it did not expect.
        ERROR_MSGTYPE = 2,
        /// The peer received a message that failed its semantic checks.
        INVALID_MSG = 3,
        /// The connection was lost before a reply arrived.
        DISCONNECTED = 4,
        /// An RPC request did not match the method's parameter schema.
        INVALID_PARAMS = 5,
        /// No provider is known for the requested method.
        NOT_FOUND_SERVICE = 6,
        /// A request carried an operation type the peer does not handle.
        INVALID_OPTYPE = 7,
        /// No topic exists with the requested name.
        NOT_FOUND_TOPIC = 8,
        /// The method handler failed internally.
        INVALID_ERROR = 9,
    }
}

caret_int! {
    /// Operation selector for [`TopicRequest`] messages.
    #[derive(Hash)]
    pub struct TopicOp(u32) {
        /// Create a topic (idempotent).
        CREATE = 0,
        /// Remove a topic and detach its subscribers.
        REMOVE = 1,
        /// Subscribe the sending connection to a topic.
        SUBSCRIBE = 2,
        /// Cancel the sending connection's subscription.
        CANCEL = 3,
        /// Publish a payload to every subscriber of a topic.
        PUBLISH = 4,
    }
}

caret_int! {
    /// Operation selector for [`ServiceRequest`] messages.
    #[derive(Hash)]
    pub struct ServiceOp(u32) {
        /// Announce that the sending connection provides a method.
        REGISTRY = 0,
        /// Ask which hosts provide a method.
        DISCOVERY = 1,
        /// Pushed by the registry: a new provider host appeared.
        ONLINE = 2,
        /// Pushed by the registry: a provider host went away.
        OFFLINE = 3,
    }
}

/// Implement serde for a wire integer type as a bare JSON number.
macro_rules! impl_wire_int_serde {
    { $($t:ident),* $(,)? } => { $(
        impl Serialize for $t {
            fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
                s.serialize_u32((*self).into())
            }
        }
        impl<'de> Deserialize<'de> for $t {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
                u32::deserialize(d).map($t::from)
            }
        }
    )* }
}
impl_wire_int_serde! { MsgType, ResultCode, TopicOp, ServiceOp }

impl ResultCode {
    /// Return a short human-readable reason for this code, for log lines.
    pub fn reason(self) -> &'static str {
        match self {
            ResultCode::OK => "success",
            ResultCode::PARSE_FAILED => "message could not be parsed",
            ResultCode::ERROR_MSGTYPE => "unexpected message type",
            ResultCode::INVALID_MSG => "invalid message",
            ResultCode::DISCONNECTED => "peer disconnected",
            ResultCode::INVALID_PARAMS => "invalid rpc parameters",
            ResultCode::NOT_FOUND_SERVICE => "no such service",
            ResultCode::INVALID_OPTYPE => "invalid operation type",
            ResultCode::NOT_FOUND_TOPIC => "no such topic",
            ResultCode::INVALID_ERROR => "internal handler error",
            _ => "unknown error",
        }
    }
}

/// The address of a host that provides one or more methods.
///
/// Encoded in message bodies as `{"ip": ..., "port": ...}`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub struct HostAddr {
    /// The host's IP address, as text.
    pub ip: String,
    /// The host's TCP port.
    pub port: u16,
}

impl HostAddr {
    /// Construct a new HostAddr.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        HostAddr {
            ip: ip.into(),
            port,
        }
    }

    /// Try to interpret this address as a socket address to connect to.
    ///
    /// Fails if the `ip` field is not a literal IP address. (Hostnames
    /// never appear on the wire; providers advertise addresses.)
    pub fn to_socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .ip
            .parse()
            .map_err(|_| Error::BadMsg("host address is not a literal IP"))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for HostAddr {
    fn from(addr: SocketAddr) -> Self {
        HostAddr::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// An opaque identifier correlating a request with its response.
///
/// Assigned by the requesting side and echoed by responses; pushed
/// notifications get fresh ids of their own. The wire requires only
/// that it be non-empty UTF-8.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct RequestId(Box<str>);

impl RequestId {
    /// Return this id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId(s.into())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId(s.into())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request to invoke a named method on the receiving peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct RpcRequest {
    /// The name of the method to invoke.
    pub method: String,
    /// The method's parameters, keyed by parameter name.
    #[serde(rename = "parameters")]
    pub params: JsonMap,
}

impl RpcRequest {
    /// Construct a new request for `method` with the given parameters.
    pub fn new(method: impl Into<String>, params: JsonMap) -> Self {
        RpcRequest {
            method: method.into(),
            params,
        }
    }
}

/// The reply to an [`RpcRequest`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct RpcResponse {
    /// The outcome of the call.
    pub rcode: ResultCode,
    /// The method's return value. Present if (and only if) `rcode` is
    /// [`ResultCode::OK`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl RpcResponse {
    /// Construct a successful reply carrying `result`.
    pub fn ok(result: serde_json::Value) -> Self {
        RpcResponse {
            rcode: ResultCode::OK,
            result: Some(result),
        }
    }

    /// Construct a failed reply carrying only an outcome code.
    pub fn error(rcode: ResultCode) -> Self {
        RpcResponse {
            rcode,
            result: None,
        }
    }
}

/// A topic operation, or a published payload fanned out to a subscriber.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct TopicRequest {
    /// The name of the topic this request operates on.
    pub topic_key: String,
    /// Which operation to perform.
    pub optype: TopicOp,
    /// The published payload. Present if (and only if) `optype` is
    /// [`TopicOp::PUBLISH`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_msg: Option<String>,
}

impl TopicRequest {
    /// Construct a non-publish topic operation.
    pub fn new(optype: TopicOp, topic_key: impl Into<String>) -> Self {
        TopicRequest {
            topic_key: topic_key.into(),
            optype,
            topic_msg: None,
        }
    }

    /// Construct a publish operation carrying `payload`.
    pub fn publish(topic_key: impl Into<String>, payload: impl Into<String>) -> Self {
        TopicRequest {
            topic_key: topic_key.into(),
            optype: TopicOp::PUBLISH,
            topic_msg: Some(payload.into()),
        }
    }
}

/// The reply to a [`TopicRequest`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct TopicResponse {
    /// The outcome of the operation.
    pub rcode: ResultCode,
}

impl TopicResponse {
    /// Construct a successful reply.
    pub fn ok() -> Self {
        TopicResponse {
            rcode: ResultCode::OK,
        }
    }

    /// Construct a failed reply.
    pub fn error(rcode: ResultCode) -> Self {
        TopicResponse { rcode }
    }
}

/// A registry operation, or a pushed online/offline notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ServiceRequest {
    /// The method name this request is about.
    pub method: String,
    /// Which operation to perform.
    pub optype: ServiceOp,
    /// The provider host. Present for every operation except
    /// [`ServiceOp::DISCOVERY`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<HostAddr>,
}

impl ServiceRequest {
    /// Construct a registration announcing that `host` provides `method`.
    pub fn registry(method: impl Into<String>, host: HostAddr) -> Self {
        ServiceRequest {
            method: method.into(),
            optype: ServiceOp::REGISTRY,
            host: Some(host),
        }
    }

    /// Construct a discovery query for `method`.
    pub fn discovery(method: impl Into<String>) -> Self {
        ServiceRequest {
            method: method.into(),
            optype: ServiceOp::DISCOVERY,
            host: None,
        }
    }

    /// Construct an online/offline notification about `host`.
    pub fn notice(optype: ServiceOp, method: impl Into<String>, host: HostAddr) -> Self {
        ServiceRequest {
            method: method.into(),
            optype,
            host: Some(host),
        }
    }
}

/// The reply to a [`ServiceRequest`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ServiceResponse {
    /// The outcome of the operation.
    pub rcode: ResultCode,
    /// The operation this reply answers.
    pub optype: ServiceOp,
    /// The queried method name. Present on successful discovery replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// The hosts that currently provide the queried method. Present on
    /// successful discovery replies.
    #[serde(default, rename = "host", skip_serializing_if = "Option::is_none")]
    pub hosts: Option<Vec<HostAddr>>,
}

impl ServiceResponse {
    /// Construct a successful non-discovery reply.
    pub fn ok(optype: ServiceOp) -> Self {
        ServiceResponse {
            rcode: ResultCode::OK,
            optype,
            method: None,
            hosts: None,
        }
    }

    /// Construct a successful discovery reply listing `hosts`.
    pub fn discovered(method: impl Into<String>, hosts: Vec<HostAddr>) -> Self {
        ServiceResponse {
            rcode: ResultCode::OK,
            optype: ServiceOp::DISCOVERY,
            method: Some(method.into()),
            hosts: Some(hosts),
        }
    }

    /// Construct a failed reply.
    pub fn error(optype: ServiceOp, rcode: ResultCode) -> Self {
        ServiceResponse {
            rcode,
            optype,
            method: None,
            hosts: None,
        }
    }
}

/// Any message body that can appear on a weft connection.
///
/// The variant is selected by the frame header's mtype, not by anything
/// in the body itself; [`AnyMsg::decode`] is the factory that performs
/// that selection.
#[derive(Clone, Debug, PartialEq, derive_more::From, derive_more::TryInto)]
#[non_exhaustive]
pub enum AnyMsg {
    /// An RPC call request.
    RpcRequest(RpcRequest),
    /// The reply to an RPC call.
    RpcResponse(RpcResponse),
    /// A topic operation or a fanned-out publish.
    TopicRequest(TopicRequest),
    /// The reply to a topic operation.
    TopicResponse(TopicResponse),
    /// A registry operation or a pushed notification.
    ServiceRequest(ServiceRequest),
    /// The reply to a registry operation.
    ServiceResponse(ServiceResponse),
}

impl AnyMsg {
    /// Return the wire type tag for this body.
    pub fn mtype(&self) -> MsgType {
        match self {
            AnyMsg::RpcRequest(_) => MsgType::REQ_RPC,
            AnyMsg::RpcResponse(_) => MsgType::RSP_RPC,
            AnyMsg::TopicRequest(_) => MsgType::REQ_TOPIC,
            AnyMsg::TopicResponse(_) => MsgType::RSP_TOPIC,
            AnyMsg::ServiceRequest(_) => MsgType::REQ_SERVICE,
            AnyMsg::ServiceResponse(_) => MsgType::RSP_SERVICE,
        }
    }

    /// Construct a body of the type selected by `mtype` from JSON bytes,
    /// and run its semantic checks.
    ///
    /// Handlers never see a message for which this has not succeeded.
    pub fn decode(mtype: MsgType, body: &[u8]) -> Result<Self> {
        /// Helper: decode `body` as a `T` and wrap it as an `AnyMsg`.
        fn parse<'a, T: Deserialize<'a> + Into<AnyMsg>>(body: &'a [u8]) -> Result<AnyMsg> {
            serde_json::from_slice::<T>(body)
                .map(Into::into)
                .map_err(|e| Error::BodyDecode(Arc::new(e)))
        }
        let msg = match mtype {
            MsgType::REQ_RPC => parse::<RpcRequest>(body)?,
            MsgType::RSP_RPC => parse::<RpcResponse>(body)?,
            MsgType::REQ_TOPIC => parse::<TopicRequest>(body)?,
            MsgType::RSP_TOPIC => parse::<TopicResponse>(body)?,
            MsgType::REQ_SERVICE => parse::<ServiceRequest>(body)?,
            MsgType::RSP_SERVICE => parse::<ServiceResponse>(body)?,
            _ => return Err(Error::UnknownMsgType(mtype)),
        };
        msg.check()?;
        Ok(msg)
    }

    /// Encode this body as JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let encoded = match self {
            AnyMsg::RpcRequest(m) => serde_json::to_vec(m),
            AnyMsg::RpcResponse(m) => serde_json::to_vec(m),
            AnyMsg::TopicRequest(m) => serde_json::to_vec(m),
            AnyMsg::TopicResponse(m) => serde_json::to_vec(m),
            AnyMsg::ServiceRequest(m) => serde_json::to_vec(m),
            AnyMsg::ServiceResponse(m) => serde_json::to_vec(m),
        };
        encoded.map_err(|e| Error::BodyEncode(Arc::new(e)))
    }

    /// Check the cross-field requirements that serde cannot express.
    ///
    /// Serde already rejects a missing or mistyped unconditional field;
    /// what is left are the fields whose presence depends on another
    /// field's value. Responses with a non-zero `rcode` are allowed to
    /// omit their payload, so a well-formed error reply always passes.
    pub fn check(&self) -> Result<()> {
        match self {
            AnyMsg::RpcResponse(m) if m.rcode == ResultCode::OK && m.result.is_none() => {
                Err(Error::BadMsg("successful rpc response without a result"))
            }
            AnyMsg::TopicRequest(m)
                if m.optype == TopicOp::PUBLISH && m.topic_msg.is_none() =>
            {
                Err(Error::BadMsg("publish without a payload"))
            }
            AnyMsg::ServiceRequest(m)
                if m.optype != ServiceOp::DISCOVERY && m.host.is_none() =>
            {
                Err(Error::BadMsg("service request without a host"))
            }
            AnyMsg::ServiceResponse(m)
                if m.optype == ServiceOp::DISCOVERY
                    && m.rcode == ResultCode::OK
                    && (m.method.is_none() || m.hosts.is_none()) =>
            {
                Err(Error::BadMsg("successful discovery response without hosts"))
            }
            _ => Ok(()),
        }
    }
}

/// Trait for body types that correspond to exactly one wire message type.
///
/// Used by dispatchers to narrow an [`AnyMsg`] to the variant a handler
/// was registered for.
pub trait MsgBody: Into<AnyMsg> + TryFrom<AnyMsg> + Send + 'static {
    /// The message type tag that selects this body on the wire.
    const MSG_TYPE: MsgType;
}

/// Helper: declare the `MsgBody` impl for one body type.
macro_rules! impl_msg_body {
    { $($t:ident => $mtype:ident,)* } => { $(
        impl MsgBody for $t {
            const MSG_TYPE: MsgType = MsgType::$mtype;
        }
    )* }
}
impl_msg_body! {
    RpcRequest => REQ_RPC,
    RpcResponse => RSP_RPC,
    TopicRequest => REQ_TOPIC,
    TopicResponse => RSP_TOPIC,
    ServiceRequest => REQ_SERVICE,
    ServiceResponse => RSP_SERVICE,
}

/// One message as it travels on a connection: a request id plus a body.
///
/// Responses echo the id of the request they answer; pushed
/// notifications carry fresh ids of their own.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct Envelope {
    /// The correlation id for this message.
    pub id: RequestId,
    /// The message body.
    pub msg: AnyMsg,
}

impl Envelope {
    /// Construct an envelope from an id and any body type.
    pub fn new(id: impl Into<RequestId>, msg: impl Into<AnyMsg>) -> Self {
        Envelope {
            id: id.into(),
            msg: msg.into(),
        }
    }

    /// Return the wire type tag for this envelope's body.
    pub fn mtype(&self) -> MsgType {
        self.msg.mtype()
    }

    /// Construct a reply to this envelope: same id, new body.
    pub fn reply(&self, msg: impl Into<AnyMsg>) -> Envelope {
        Envelope {
            id: self.id.clone(),
            msg: msg.into(),
        }
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

    /// Decode `body` with `mtype`, expecting success.
    fn decode_ok(mtype: MsgType, body: &str) -> AnyMsg {
        AnyMsg::decode(mtype, body.as_bytes()).unwrap()
    }

    /// Decode `body` with `mtype`, expecting failure.
    fn decode_err(mtype: MsgType, body: &str) -> Error {
        AnyMsg::decode(mtype, body.as_bytes()).unwrap_err()
    }

    #[test]
    fn wire_numbering() {
        // These values must match every other implementation of the
        // protocol; they are load-bearing, not arbitrary.
        assert_eq!(u32::from(MsgType::REQ_RPC), 0);
        assert_eq!(u32::from(MsgType::RSP_RPC), 1);
        assert_eq!(u32::from(MsgType::REQ_TOPIC), 2);
        assert_eq!(u32::from(MsgType::RSP_TOPIC), 3);
        assert_eq!(u32::from(MsgType::REQ_SERVICE), 4);
        assert_eq!(u32::from(MsgType::RSP_SERVICE), 5);

        assert_eq!(u32::from(ResultCode::OK), 0);
        assert_eq!(u32::from(ResultCode::DISCONNECTED), 4);
        assert_eq!(u32::from(ResultCode::NOT_FOUND_TOPIC), 8);
        assert_eq!(u32::from(ResultCode::INVALID_ERROR), 9);

        assert_eq!(u32::from(TopicOp::CREATE), 0);
        assert_eq!(u32::from(TopicOp::PUBLISH), 4);
        assert_eq!(u32::from(ServiceOp::REGISTRY), 0);
        assert_eq!(u32::from(ServiceOp::OFFLINE), 3);
    }

    #[test]
    fn valid_bodies() {
        let m = decode_ok(
            MsgType::REQ_RPC,
            r#"{"method": "Add", "parameters": {"num1": 11, "num2": 22}}"#,
        );
        let req: RpcRequest = m.try_into().unwrap();
        assert_eq!(req.method, "Add");
        assert_eq!(req.params.get("num1").unwrap(), 11);

        let m = decode_ok(MsgType::RSP_RPC, r#"{"rcode": 0, "result": 33}"#);
        let rsp: RpcResponse = m.try_into().unwrap();
        assert_eq!(rsp.rcode, ResultCode::OK);
        assert_eq!(rsp.result.unwrap(), 33);

        let m = decode_ok(
            MsgType::REQ_TOPIC,
            r#"{"topic_key": "daily.news", "optype": 4, "topic_msg": "hi"}"#,
        );
        let req: TopicRequest = m.try_into().unwrap();
        assert_eq!(req.optype, TopicOp::PUBLISH);
        assert_eq!(req.topic_msg.as_deref(), Some("hi"));

        let m = decode_ok(
            MsgType::REQ_SERVICE,
            r#"{"method": "Add", "optype": 0, "host": {"ip": "127.0.0.1", "port": 18081}}"#,
        );
        let req: ServiceRequest = m.try_into().unwrap();
        assert_eq!(req.host.unwrap(), HostAddr::new("127.0.0.1", 18081));

        let m = decode_ok(
            MsgType::RSP_SERVICE,
            r#"{"rcode": 0, "optype": 1, "method": "Add",
                "host": [{"ip": "127.0.0.1", "port": 18081}]}"#,
        );
        let rsp: ServiceResponse = m.try_into().unwrap();
        assert_eq!(rsp.hosts.unwrap().len(), 1);
    }

    #[test]
    fn invalid_bodies() {
        // Missing or mistyped unconditional fields: serde rejects these.
        assert!(matches!(
            decode_err(MsgType::REQ_RPC, r#"{"parameters": {}}"#),
            Error::BodyDecode(_)
        ));
        assert!(matches!(
            decode_err(MsgType::REQ_RPC, r#"{"method": "Add", "parameters": 7}"#),
            Error::BodyDecode(_)
        ));
        assert!(matches!(
            decode_err(MsgType::REQ_TOPIC, r#"{"topic_key": "t"}"#),
            Error::BodyDecode(_)
        ));
        assert!(matches!(
            decode_err(MsgType::RSP_TOPIC, r#"{"rcode": "zero"}"#),
            Error::BodyDecode(_)
        ));
        assert!(matches!(
            decode_err(MsgType::REQ_RPC, r#"not json at all"#),
            Error::BodyDecode(_)
        ));

        // Conditionally required fields: check() rejects these.
        assert!(matches!(
            decode_err(MsgType::RSP_RPC, r#"{"rcode": 0}"#),
            Error::BadMsg(_)
        ));
        assert!(matches!(
            decode_err(MsgType::REQ_TOPIC, r#"{"topic_key": "t", "optype": 4}"#),
            Error::BadMsg(_)
        ));
        assert!(matches!(
            decode_err(MsgType::REQ_SERVICE, r#"{"method": "Add", "optype": 0}"#),
            Error::BadMsg(_)
        ));
        assert!(matches!(
            decode_err(MsgType::RSP_SERVICE, r#"{"rcode": 0, "optype": 1}"#),
            Error::BadMsg(_)
        ));

        // A mtype nobody implements.
        assert!(matches!(
            decode_err(77.into(), r#"{}"#),
            Error::UnknownMsgType(_)
        ));
    }

    #[test]
    fn error_responses_omit_payload() {
        // A failed response is allowed to carry nothing but its code.
        let m = decode_ok(MsgType::RSP_RPC, r#"{"rcode": 6}"#);
        let rsp: RpcResponse = m.try_into().unwrap();
        assert_eq!(rsp.rcode, ResultCode::NOT_FOUND_SERVICE);
        assert!(rsp.result.is_none());

        let m = decode_ok(MsgType::RSP_SERVICE, r#"{"rcode": 6, "optype": 1}"#);
        let rsp: ServiceResponse = m.try_into().unwrap();
        assert!(rsp.hosts.is_none());
    }

    #[test]
    fn enums_encode_as_numbers() {
        let rsp = TopicResponse::error(ResultCode::NOT_FOUND_TOPIC);
        let json = serde_json::to_string(&rsp).unwrap();
        assert_eq!(json, r#"{"rcode":8}"#);

        let req = TopicRequest::new(TopicOp::SUBSCRIBE, "daily.news");
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"topic_key":"daily.news","optype":2}"#);
    }

    #[test]
    fn unknown_optype_survives_decoding() {
        // An unrecognized operation must reach the handler so that it
        // can be answered with INVALID_OPTYPE, rather than being
        // indistinguishable from a malformed frame.
        let m = decode_ok(
            MsgType::REQ_SERVICE,
            r#"{"method": "Add", "optype": 9, "host": {"ip": "10.0.0.1", "port": 1}}"#,
        );
        let req: ServiceRequest = m.try_into().unwrap();
        assert!(!req.optype.is_recognized());
    }

    #[test]
    fn reason_strings() {
        assert_eq!(ResultCode::OK.reason(), "success");
        assert_eq!(ResultCode::NOT_FOUND_TOPIC.reason(), "no such topic");
        assert_eq!(ResultCode::from(1000).reason(), "unknown error");
    }

    #[test]
    fn host_addr_display_and_parse() {
        let host = HostAddr::new("127.0.0.1", 18081);
        assert_eq!(host.to_string(), "127.0.0.1:18081");
        assert_eq!(
            host.to_socket_addr().unwrap(),
            "127.0.0.1:18081".parse().unwrap()
        );
        assert!(HostAddr::new("registry.example.com", 1)
            .to_socket_addr()
            .is_err());
    }

    #[test]
    fn envelope_reply_echoes_id() {
        let req = Envelope::new("req-1", RpcRequest::new("Add", JsonMap::new()));
        assert_eq!(req.mtype(), MsgType::REQ_RPC);
        let rsp = req.reply(RpcResponse::ok(33.into()));
        assert_eq!(rsp.id, req.id);
        assert_eq!(rsp.mtype(), MsgType::RSP_RPC);
    }
}
