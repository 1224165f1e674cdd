//! End-to-end registry behavior: discovery, online push, offline push.

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
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft_proto::codec::DEFAULT_MAX_FRAME;
use weft_proto::msg::{HostAddr, ResultCode};
use weft_registry::{
    DiscoveryClient, DiscoveryError, OfflineHook, RegistryClient, RegistryServer,
};

/// Poll `cond` until it holds or a couple of seconds elapse.
async fn eventually<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Bind a registry and return its address.
async fn spawn_registry() -> SocketAddr {
    let server = RegistryServer::bind("127.0.0.1:0".parse().unwrap(), DEFAULT_MAX_FRAME)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

#[tokio::test(flavor = "multi_thread")]
async fn discovery_registration_and_push() {
    let registry_addr = spawn_registry().await;
    let advertised = HostAddr::new("127.0.0.1", 18081);

    // A discoverer, recording every offline push it sees.
    let offline_seen: Arc<Mutex<Vec<HostAddr>>> = Arc::new(Mutex::new(Vec::new()));
    let hook: OfflineHook = {
        let offline_seen = Arc::clone(&offline_seen);
        Arc::new(move |host: &HostAddr| {
            offline_seen.lock().unwrap().push(host.clone());
        })
    };
    let discovery = DiscoveryClient::connect(registry_addr, DEFAULT_MAX_FRAME, Some(hook))
        .await
        .unwrap();

    // Nothing is registered yet.
    let err = discovery.discover("Add").await.unwrap_err();
    assert!(matches!(
        err,
        DiscoveryError::Refused(ResultCode::NOT_FOUND_SERVICE)
    ));

    // A provider appears. The discoverer asked about `Add` earlier, so
    // it gets an unsolicited ONLINE push and needs no second query.
    let provider = RegistryClient::connect(registry_addr, DEFAULT_MAX_FRAME)
        .await
        .unwrap();
    provider.register_method("Add", &advertised).await.unwrap();

    {
        let discoverer = Arc::clone(discovery.discoverer());
        eventually(
            move || discoverer.cached_hosts("Add") == vec![HostAddr::new("127.0.0.1", 18081)],
            "ONLINE push to reach the discoverer",
        )
        .await;
    }
    assert_eq!(discovery.discover("Add").await.unwrap(), advertised);

    // The provider goes away. The discoverer hears OFFLINE, empties its
    // cache, and runs the offline hook.
    provider.shutdown();
    {
        let discoverer = Arc::clone(discovery.discoverer());
        eventually(
            move || discoverer.cached_hosts("Add").is_empty(),
            "OFFLINE push to reach the discoverer",
        )
        .await;
    }
    assert_eq!(offline_seen.lock().unwrap().clone(), vec![advertised]);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_discoverer_sees_existing_provider() {
    let registry_addr = spawn_registry().await;
    let advertised = HostAddr::new("127.0.0.1", 18082);

    let provider = RegistryClient::connect(registry_addr, DEFAULT_MAX_FRAME)
        .await
        .unwrap();
    provider.register_method("Echo", &advertised).await.unwrap();

    // A discoverer that arrives after the registration finds the
    // provider through an ordinary query.
    let discovery = DiscoveryClient::connect(registry_addr, DEFAULT_MAX_FRAME, None)
        .await
        .unwrap();
    assert_eq!(discovery.discover("Echo").await.unwrap(), advertised);
}
