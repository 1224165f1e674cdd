//! Build RPC requests and interpret their responses.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;

use weft_net::{Connection, RequestError, Requestor, ResponseFuture};
use weft_proto::msg::{Envelope, JsonMap, ResultCode, RpcRequest, RpcResponse};

/// An error completing an RPC call.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CallError {
    /// The request could not be completed at the transport level.
    #[error("rpc request failed")]
    Request(#[from] RequestError),
    /// The provider answered, reporting a failure.
    #[error("rpc call failed: {}", .0.reason())]
    Refused(ResultCode),
    /// The provider answered with a body we did not expect.
    #[error("provider sent an unexpected response type")]
    UnexpectedResponse,
}

/// Interpret a response envelope as a call outcome.
///
/// A well-formed error response carries no result; a successful one
/// always does (the codec's checks enforce that), so `OK` with a
/// missing result can only mean a confused peer.
fn decode(rsp: Envelope) -> Result<Value, CallError> {
    let rsp: RpcResponse = rsp
        .msg
        .try_into()
        .map_err(|_| CallError::UnexpectedResponse)?;
    if rsp.rcode != ResultCode::OK {
        return Err(CallError::Refused(rsp.rcode));
    }
    rsp.result.ok_or(CallError::UnexpectedResponse)
}

/// A future resolving to the result of one RPC call.
#[derive(Debug)]
pub struct CallFuture {
    /// The underlying response future.
    inner: ResponseFuture,
}

impl Future for CallFuture {
    type Output = Result<Value, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner)
            .poll(cx)
            .map(|outcome| decode(outcome?))
    }
}

/// Issues RPC calls over connections somebody else chose.
///
/// One builder serves all three completion flavors: construct the
/// request with a fresh id, hand it to the [`Requestor`], and map the
/// response. The caller never retries; retry is the application's
/// policy, not the fabric's.
pub struct RpcCaller {
    /// The correlator that tracks our outstanding calls.
    requestor: Arc<Requestor>,
}

impl RpcCaller {
    /// Create a caller that correlates its calls through `requestor`.
    pub fn new(requestor: Arc<Requestor>) -> Self {
        RpcCaller { requestor }
    }

    /// Call `method` and wait (boundedly) for its result.
    pub async fn call(
        &self,
        conn: &Connection,
        method: &str,
        params: JsonMap,
    ) -> Result<Value, CallError> {
        let rsp = self
            .requestor
            .send_sync(conn, self.request(method, params))
            .await?;
        decode(rsp)
    }

    /// As [`call`](RpcCaller::call), with a per-call timeout.
    pub async fn call_with_timeout(
        &self,
        conn: &Connection,
        method: &str,
        params: JsonMap,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let rsp = self
            .requestor
            .send_sync_with_timeout(conn, self.request(method, params), timeout)
            .await?;
        decode(rsp)
    }

    /// Call `method`, returning a future for its result.
    pub fn call_future(
        &self,
        conn: &Connection,
        method: &str,
        params: JsonMap,
    ) -> Result<CallFuture, CallError> {
        let inner = self
            .requestor
            .send_future(conn, self.request(method, params))?;
        Ok(CallFuture { inner })
    }

    /// Call `method`, running `cb` with the outcome when the response
    /// arrives.
    ///
    /// The callback runs on whatever task delivers the response; if the
    /// connection dies first it is abandoned, never called.
    pub fn call_with<F>(
        &self,
        conn: &Connection,
        method: &str,
        params: JsonMap,
        cb: F,
    ) -> Result<(), CallError>
    where
        F: FnOnce(Result<Value, CallError>) + Send + 'static,
    {
        self.requestor
            .send_callback(conn, self.request(method, params), move |rsp| {
                cb(decode(rsp));
            })?;
        Ok(())
    }

    /// Build the request envelope for one call.
    fn request(&self, method: &str, params: JsonMap) -> Envelope {
        Envelope::new(self.requestor.fresh_id(), RpcRequest::new(method, params))
    }
}
