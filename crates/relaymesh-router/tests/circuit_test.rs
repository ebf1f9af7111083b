//! Circuit breaking on the relay path.

mod common;

use std::time::Duration;

use relaymesh_common::{CallRequest, ErrorCode, ErrorFrame};
use relaymesh_router::remote::RemoteConfig;

use common::TestCluster;

const WORKER: &str = "10.9.0.1:7000";

async fn circuit_cluster(code_name: ErrorCode) -> TestCluster {
    TestCluster::with_config(1, 2, move |config| {
        config.circuits.enabled = true;
        config.circuits.period = Duration::from_millis(10);
        config.circuits.min_requests = 0;
        config.circuits.max_error_rate = 0.5;
        config.circuits.probation = 5;
        config.circuits.code_name = code_name;
    })
    .await
}

fn call() -> CallRequest {
    CallRequest::new("steve", "ifyousayso").with_caller("bob")
}

#[tokio::test]
async fn test_circuit_trips_on_error_stream() {
    // S5: ~80% errors over a period trip (bob, steve, ifyousayso)
    let cluster = circuit_cluster(ErrorCode::Declined).await;
    let via = cluster.host_ports[0].clone();
    let router = cluster.router(&via);
    cluster.advertise(WORKER, &via, &["steve"]).await.unwrap();
    cluster.settle().await;

    let worker_peer = router.transport.mem_peer(WORKER);
    for i in 0..100 {
        if i % 5 == 0 {
            worker_peer.script_outcome(Ok(relaymesh_common::CallResponse::empty()));
        } else {
            worker_peer.script_outcome(Err(ErrorFrame::network("worker blew up")));
        }
    }
    for _ in 0..100 {
        router.dispatcher.handle_request(call()).await;
    }

    // period boundary evaluates the window
    tokio::time::sleep(Duration::from_millis(15)).await;
    let mut declined = 0;
    for _ in 0..20 {
        let outcome = router.dispatcher.handle_request(call()).await;
        if outcome.err_code() == Some(ErrorCode::Declined) {
            if let relaymesh_router::DispatchOutcome::Error(frame) = outcome {
                if frame.message == "Service is not healthy" {
                    declined += 1;
                }
            }
        }
    }
    assert!(declined > 0, "tripped circuit should decline past the probe budget");

    // the control endpoint lists the circuit as unhealthy
    let snapshot = router.dispatcher.circuits().snapshot();
    let row = snapshot
        .iter()
        .find(|row| {
            row.key.caller_name == "bob"
                && row.key.service_name == "steve"
                && row.key.endpoint_name == "ifyousayso"
        })
        .expect("circuit listed");
    assert!(!row.healthy);
}

#[tokio::test]
async fn test_unhealthy_code_name_alias() {
    let cluster = circuit_cluster(ErrorCode::Unhealthy).await;
    let via = cluster.host_ports[0].clone();
    let router = cluster.router(&via);
    cluster.advertise(WORKER, &via, &["steve"]).await.unwrap();
    cluster.settle().await;

    let worker_peer = router.transport.mem_peer(WORKER);
    worker_peer.script_failures(100, ErrorFrame::network("worker blew up"));
    for _ in 0..100 {
        router.dispatcher.handle_request(call()).await;
    }
    tokio::time::sleep(Duration::from_millis(15)).await;

    let mut unhealthy = 0;
    for _ in 0..20 {
        if router.dispatcher.handle_request(call()).await.err_code() == Some(ErrorCode::Unhealthy)
        {
            unhealthy += 1;
        }
    }
    assert!(unhealthy > 0);
}

#[tokio::test]
async fn test_probation_recovers_circuit() {
    let cluster = circuit_cluster(ErrorCode::Declined).await;
    let via = cluster.host_ports[0].clone();
    let router = cluster.router(&via);
    cluster.advertise(WORKER, &via, &["steve"]).await.unwrap();
    cluster.settle().await;

    let worker_peer = router.transport.mem_peer(WORKER);
    worker_peer.script_failures(50, ErrorFrame::network("worker blew up"));
    for _ in 0..50 {
        router.dispatcher.handle_request(call()).await;
    }
    tokio::time::sleep(Duration::from_millis(15)).await;

    // worker healed: probes succeed (default transport answer is success)
    let mut recovered = false;
    for _ in 0..30 {
        let outcome = router.dispatcher.handle_request(call()).await;
        if outcome.response().is_some() {
            let snapshot = router.dispatcher.circuits().snapshot();
            if snapshot.iter().all(|row| row.healthy) {
                recovered = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    assert!(recovered, "probation successes should close the circuit");
}

#[tokio::test]
async fn test_declines_do_not_feed_error_budget() {
    let cluster = circuit_cluster(ErrorCode::Declined).await;
    let via = cluster.host_ports[0].clone();
    let router = cluster.router(&via);
    cluster.advertise(WORKER, &via, &["steve"]).await.unwrap();
    cluster.settle().await;

    // the worker declines everything; that is pushback, not ill health
    let worker_peer = router.transport.mem_peer(WORKER);
    worker_peer.script_failures(60, ErrorFrame::declined("worker is shedding load"));
    for _ in 0..60 {
        router.dispatcher.handle_request(call()).await;
    }
    tokio::time::sleep(Duration::from_millis(15)).await;
    router.dispatcher.handle_request(call()).await;

    let snapshot = router.dispatcher.circuits().snapshot();
    assert!(snapshot.iter().all(|row| row.healthy), "declines must not trip the circuit");
}

#[tokio::test]
async fn test_circuits_disabled_by_default_and_toggled_remotely() {
    let cluster = TestCluster::new(1, 2).await;
    let via = cluster.host_ports[0].clone();
    let router = cluster.router(&via);
    cluster.advertise(WORKER, &via, &["steve"]).await.unwrap();
    cluster.settle().await;

    assert!(!router.dispatcher.circuits().enabled());
    let worker_peer = router.transport.mem_peer(WORKER);
    worker_peer.script_failures(20, ErrorFrame::network("worker blew up"));
    for _ in 0..20 {
        router.dispatcher.handle_request(call()).await;
    }
    // no circuits were created while disabled
    assert!(router.dispatcher.circuits().is_empty());

    let remote: RemoteConfig =
        serde_json::from_value(serde_json::json!({"circuits": {"enabled": true}})).unwrap();
    router.dispatcher.apply_remote_config(&remote);
    router.dispatcher.handle_request(call()).await;
    assert_eq!(router.dispatcher.circuits().len(), 1);
}
