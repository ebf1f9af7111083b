//! Admission pipeline: classification, blocking, and rate limiting.

mod common;

use std::collections::HashMap;

use relaymesh_common::{CallRequest, ErrorCode};
use relaymesh_router::dispatcher::DropReason;
use relaymesh_router::remote::RemoteConfig;

use common::TestCluster;

const WORKER: &str = "10.9.0.1:7000";

async fn single_router_cluster() -> TestCluster {
    // one member: every service is exit-mode here
    TestCluster::with_config(1, 2, |config| {
        config.rate_limiter.enabled = true;
        config.rate_limiter.total_rps_limit = 3;
    })
    .await
}

#[tokio::test]
async fn test_missing_service_name_rejected() {
    let cluster = TestCluster::new(1, 2).await;
    let router = cluster.router(&cluster.host_ports[0]);
    let outcome = router
        .dispatcher
        .handle_request(CallRequest::new("", "echo").with_caller("bob"))
        .await;
    assert_eq!(outcome.err_code(), Some(ErrorCode::BadRequest));
}

#[tokio::test]
async fn test_missing_caller_name_rejected() {
    let cluster = TestCluster::new(1, 2).await;
    let router = cluster.router(&cluster.host_ports[0]);
    let outcome = router.dispatcher.handle_request(CallRequest::new("steve", "echo")).await;
    assert_eq!(outcome.err_code(), Some(ErrorCode::BadRequest));

    // with lazy handling off the sentinel caller is used instead
    let remote: RemoteConfig =
        serde_json::from_value(serde_json::json!({"lazyHandling": {"enabled": false}})).unwrap();
    router.dispatcher.apply_remote_config(&remote);
    let outcome = router.dispatcher.handle_request(CallRequest::new("steve", "echo")).await;
    assert_ne!(outcome.err_code(), Some(ErrorCode::BadRequest));
}

#[tokio::test]
async fn test_routing_delegate_overrides_destination() {
    let cluster = TestCluster::new(1, 2).await;
    let router = cluster.router(&cluster.host_ports[0]);
    cluster.advertise(WORKER, &cluster.host_ports[0].clone(), &["steve-staging"]).await.unwrap();
    cluster.settle().await;

    let req = CallRequest::new("steve", "echo")
        .with_caller("bob")
        .with_routing_delegate("steve-staging");
    let outcome = router.dispatcher.handle_request(req).await;
    assert!(outcome.response().is_some(), "delegate target has a live peer");
    // the declared service never got a channel
    assert_eq!(router.dispatcher.channel_mode("steve").await, None);
}

#[tokio::test]
async fn test_block_pops_exact_and_wildcards() {
    let cluster = TestCluster::new(1, 2).await;
    let router = cluster.router(&cluster.host_ports[0]);
    router.dispatcher.block("a", "b").unwrap();

    for (caller, service) in [("a", "b"), ("a", "anything"), ("anyone", "b")] {
        // a~~b blocks the edge; wildcard forms cover the rest
        if caller == "anyone" {
            router.dispatcher.block("*", "b").unwrap();
        }
        if service == "anything" {
            router.dispatcher.block("a", "*").unwrap();
        }
        let outcome = router
            .dispatcher
            .handle_request(CallRequest::new(service, "echo").with_caller(caller))
            .await;
        assert!(
            matches!(outcome, relaymesh_router::DispatchOutcome::Dropped(DropReason::Blocked)),
            "expected {caller}~~{service} to be popped"
        );
    }
    assert!(router.stats.counter("request.blocked") >= 3);

    router.dispatcher.unblock("a", "b");
    router.dispatcher.unblock("*", "b");
    router.dispatcher.unblock("a", "*");
    let outcome = router
        .dispatcher
        .handle_request(CallRequest::new("b", "echo").with_caller("a"))
        .await;
    assert!(!outcome.is_dropped());
}

#[tokio::test]
async fn test_remote_kill_switch_blocks() {
    let cluster = TestCluster::new(1, 2).await;
    let router = cluster.router(&cluster.host_ports[0]);
    let remote: RemoteConfig = serde_json::from_value(serde_json::json!({
        "killSwitch": ["bad-caller~~*", "*~~bad-service"]
    }))
    .unwrap();
    router.dispatcher.apply_remote_config(&remote);

    let outcome = router
        .dispatcher
        .handle_request(CallRequest::new("steve", "echo").with_caller("bad-caller"))
        .await;
    assert!(outcome.is_dropped());

    let outcome = router
        .dispatcher
        .handle_request(CallRequest::new("bad-service", "echo").with_caller("bob"))
        .await;
    assert!(outcome.is_dropped());
}

#[tokio::test]
async fn test_rate_limit_boundaries() {
    // S6: totalRpsLimit=3, steve limited to 2
    let cluster = single_router_cluster().await;
    let router = cluster.router(&cluster.host_ports[0]);
    // live workers so admitted requests complete instead of declining
    cluster.advertise(WORKER, &cluster.host_ports[0].clone(), &["steve", "bob"]).await.unwrap();
    cluster.settle().await;
    let mut limits = HashMap::new();
    limits.insert("steve".to_string(), 2u64);
    router.dispatcher.limiter().update_service_limits(100, &limits);

    let steve = |caller: &str| CallRequest::new("steve", "echo").with_caller(caller);
    let bob = || CallRequest::new("bob", "echo").with_caller("caller");

    // steve #1 and #2 pass
    assert!(router.dispatcher.handle_request(steve("c1")).await.err_code().is_none());
    assert!(router.dispatcher.handle_request(steve("c2")).await.err_code().is_none());

    // steve #3 trips the service limit
    let outcome = router.dispatcher.handle_request(steve("c3")).await;
    assert_eq!(outcome.err_code(), Some(ErrorCode::Busy));
    if let relaymesh_router::DispatchOutcome::Error(frame) = outcome {
        assert!(frame.message.contains("service rps of 2"), "got: {}", frame.message);
    }

    // bob #1 is the third admitted request; bob #2 trips the total limit
    assert!(router.dispatcher.handle_request(bob()).await.err_code().is_none());
    let outcome = router.dispatcher.handle_request(bob()).await;
    assert_eq!(outcome.err_code(), Some(ErrorCode::Busy));
    if let relaymesh_router::DispatchOutcome::Error(frame) = outcome {
        assert!(frame.message.contains("total rps of 3"), "got: {}", frame.message);
    }

    // raising limits in place admits traffic again without a counter reset
    router.dispatcher.limiter().update_total_limit(10);
    let mut limits = HashMap::new();
    limits.insert("steve".to_string(), 10u64);
    router.dispatcher.limiter().update_service_limits(100, &limits);
    assert!(router.dispatcher.handle_request(steve("c4")).await.err_code().is_none());
    assert!(router.dispatcher.handle_request(bob()).await.err_code().is_none());
}

#[tokio::test]
async fn test_exempt_service_bypasses_limits() {
    let cluster = TestCluster::with_config(1, 2, |config| {
        config.rate_limiter.enabled = true;
        config.rate_limiter.total_rps_limit = 1;
        config.rate_limiter.exempt_services = vec!["steve".to_string()];
    })
    .await;
    let router = cluster.router(&cluster.host_ports[0]);

    for i in 0..10 {
        let req = CallRequest::new("steve", "echo").with_caller("bob");
        let outcome = router.dispatcher.handle_request(req).await;
        assert_ne!(outcome.err_code(), Some(ErrorCode::Busy), "request {i} limited");
    }
}

#[tokio::test]
async fn test_kill_switch_tier_pops_silently() {
    let cluster = TestCluster::with_config(1, 2, |config| {
        config.rate_limiter.enabled = true;
        config.rate_limiter.total_rps_limit = 2;
        config.rate_limiter.default_service_rps_limit = 2;
        config.rate_limiter.kill_switch_buffer = 2.0;
    })
    .await;
    let router = cluster.router(&cluster.host_ports[0]);

    // soft limit answers Busy while under the kill-switch ceiling of 4
    let mut busy = 0;
    let mut dropped = 0;
    for _ in 0..10 {
        let req = CallRequest::new("steve", "echo").with_caller("bob");
        match router.dispatcher.handle_request(req).await {
            relaymesh_router::DispatchOutcome::Error(frame)
                if frame.code == ErrorCode::Busy => busy += 1,
            relaymesh_router::DispatchOutcome::Dropped(DropReason::KillSwitch) => dropped += 1,
            _ => {}
        }
    }
    assert!(busy >= 1, "soft tier should answer Busy first");
    assert!(dropped >= 1, "hard tier should black-hole");
    assert!(router.stats.counter("rate-limiting.kill-switch") >= 1);
}

#[tokio::test]
async fn test_rate_limiting_toggled_by_remote_config() {
    let cluster = TestCluster::with_config(1, 2, |config| {
        config.rate_limiter.enabled = false;
        config.rate_limiter.total_rps_limit = 0;
    })
    .await;
    let router = cluster.router(&cluster.host_ports[0]);
    cluster.advertise(WORKER, &cluster.host_ports[0].clone(), &["steve"]).await.unwrap();
    cluster.settle().await;

    // disabled: even a zero limit admits everything
    let req = CallRequest::new("steve", "echo").with_caller("bob");
    assert!(router.dispatcher.handle_request(req).await.err_code().is_none());

    let remote: RemoteConfig =
        serde_json::from_value(serde_json::json!({"rateLimiting": {"enabled": true}})).unwrap();
    router.dispatcher.apply_remote_config(&remote);

    let req = CallRequest::new("steve", "echo").with_caller("bob");
    assert_eq!(router.dispatcher.handle_request(req).await.err_code(), Some(ErrorCode::Busy));
}
