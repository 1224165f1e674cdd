//! End-to-end RPC: the three call flavors, schema rejection, timeouts,
//! and registry-backed discovery.

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

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use weft_net::RequestError;
use weft_proto::msg::{JsonMap, ResultCode};
use weft_rpc::{
    CallError, HandlerError, MethodDesc, ParamKind, RpcClient, RpcClientConfig, RpcClientError,
    RpcServer, RpcServerConfig,
};

/// The `Add` method: two integers in, their sum out.
fn add_desc() -> MethodDesc {
    MethodDesc::builder("Add")
        .param("num1", ParamKind::Integral)
        .param("num2", ParamKind::Integral)
        .returns(ParamKind::Integral)
        .handler(|params: &JsonMap| {
            let a = params["num1"].as_i64().ok_or_else(|| HandlerError::new("num1"))?;
            let b = params["num2"].as_i64().ok_or_else(|| HandlerError::new("num2"))?;
            Ok(Value::from(a + b))
        })
        .build()
}

/// The `Echo` method: a string in, the same string out.
fn echo_desc() -> MethodDesc {
    MethodDesc::builder("Echo")
        .param("content", ParamKind::String)
        .returns(ParamKind::String)
        .handler(|params: &JsonMap| Ok(params["content"].clone()))
        .build()
}

/// `{num1: a, num2: b}`.
fn nums(a: i64, b: i64) -> JsonMap {
    let mut params = JsonMap::new();
    params.insert("num1".into(), a.into());
    params.insert("num2".into(), b.into());
    params
}

/// Spawn a direct-mode server providing `Add` and `Echo`.
async fn spawn_provider() -> SocketAddr {
    let server = RpcServer::bind(RpcServerConfig::new("127.0.0.1:0".parse().unwrap()))
        .await
        .unwrap();
    server.register(add_desc()).await.unwrap();
    server.register(echo_desc()).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_sync_call() {
    let addr = spawn_provider().await;
    let client = RpcClient::connect(RpcClientConfig::direct(addr)).await.unwrap();

    let result = client.call("Add", nums(11, 22)).await.unwrap();
    assert_eq!(result, 33);

    // A missing declared parameter is refused by the provider.
    let mut partial = JsonMap::new();
    partial.insert("num1".into(), 1.into());
    let err = client.call("Add", partial).await.unwrap_err();
    assert!(matches!(
        err,
        RpcClientError::Call(CallError::Refused(ResultCode::INVALID_PARAMS))
    ));

    // So is a method nobody registered.
    let err = client.call("NoSuchMethod", nums(1, 2)).await.unwrap_err();
    assert!(matches!(
        err,
        RpcClientError::Call(CallError::Refused(ResultCode::NOT_FOUND_SERVICE))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn future_and_callback_flavors() {
    let addr = spawn_provider().await;
    let client = RpcClient::connect(RpcClientConfig::direct(addr)).await.unwrap();

    // Future flavor.
    let fut = client.call_future("Add", nums(30, 47)).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .expect("future did not resolve in time")
        .unwrap();
    assert_eq!(result, 77);

    // Callback flavor.
    let (tx, rx) = oneshot::channel();
    client
        .call_with("Add", nums(50, 71), move |outcome| {
            let _ = tx.send(outcome);
        })
        .await
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("callback did not fire in time")
        .unwrap();
    assert_eq!(outcome.unwrap(), 121);
}

#[tokio::test(flavor = "multi_thread")]
async fn large_payload_round_trip() {
    let addr = spawn_provider().await;
    let client = RpcClient::connect(RpcClientConfig::direct(addr)).await.unwrap();

    // Well under the 64 KiB frame cap, but big enough to exercise
    // partial reads on the way through.
    let payload = "x".repeat(32 * 1024);
    let mut params = JsonMap::new();
    params.insert("content".into(), payload.clone().into());
    let result = client.call("Echo", params).await.unwrap();
    assert_eq!(result.as_str().unwrap(), payload);
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_call_times_out_against_a_mute_peer() {
    // A listener that accepts and then never says anything.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            held.push(stream);
        }
    });

    let client = RpcClient::connect(RpcClientConfig::direct(addr)).await.unwrap();
    let started = Instant::now();
    let err = client.call("Add", nums(1, 2)).await.unwrap_err();
    assert!(matches!(
        err,
        RpcClientError::Call(CallError::Request(RequestError::Timeout))
    ));
    // Default bounded wait is one second; well inside two.
    assert!(started.elapsed() < Duration::from_secs(2));
    // The descriptor was removed on the way out.
    assert_eq!(client.outstanding_calls(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn discovery_routes_calls_through_the_registry() {
    use weft_proto::codec::DEFAULT_MAX_FRAME;
    use weft_registry::RegistryServer;

    let registry = RegistryServer::bind("127.0.0.1:0".parse().unwrap(), DEFAULT_MAX_FRAME)
        .await
        .unwrap();
    let registry_addr = registry.local_addr().unwrap();
    tokio::spawn(registry.run());

    // A provider that announces its methods to the registry.
    let server = RpcServer::bind(
        RpcServerConfig::new("127.0.0.1:0".parse().unwrap()).with_registry(registry_addr),
    )
    .await
    .unwrap();
    server.register(add_desc()).await.unwrap();
    tokio::spawn(server.run());

    // A client that has never heard of the provider directly.
    let client = RpcClient::connect(RpcClientConfig::with_registry(registry_addr))
        .await
        .unwrap();
    let result = client.call("Add", nums(19, 23)).await.unwrap();
    assert_eq!(result, 42);

    // An unregistered method fails at discovery, before any provider
    // connection is attempted.
    let err = client.call("Mystery", nums(1, 2)).await.unwrap_err();
    assert!(matches!(err, RpcClientError::Discovery(_)));
}
