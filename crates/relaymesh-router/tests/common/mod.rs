//! Single-process cluster harness.
//!
//! Builds N routers over one shared hash ring and wires every router's
//! in-memory transport so that a send to a router host-port lands in that
//! router's ingress handler. Sends to worker host-ports answer with an
//! empty success unless a test scripts the peer.

// not every test binary uses every helper
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relaymesh_common::{
    AdRequest, AdService, CallRequest, CallResult, DiscoveryResult, ErrorFrame, HostPort,
};
use relaymesh_metrics::MemorySink;
use relaymesh_router::advertise::AdvertiseHandler;
use relaymesh_router::config::RouterConfig;
use relaymesh_router::dispatcher::{DispatchOutcome, Dispatcher, RouterContext};
use relaymesh_router::ring::{HashRing, RingView};
use relaymesh_router::transport::inmem::InMemoryTransport;
use relaymesh_router::transport::Transport;

pub struct TestRouter {
    pub host_port: HostPort,
    pub dispatcher: Arc<Dispatcher>,
    pub handler: AdvertiseHandler,
    pub transport: Arc<InMemoryTransport>,
    pub stats: Arc<MemorySink>,
}

pub struct TestCluster {
    pub hash_ring: Arc<HashRing>,
    pub host_ports: Vec<HostPort>,
    pub routers: HashMap<HostPort, TestRouter>,
}

impl TestCluster {
    pub async fn new(n: usize, k: usize) -> Self {
        Self::with_config(n, k, |_| {}).await
    }

    pub async fn with_config(
        n: usize,
        k: usize,
        configure: impl Fn(&mut RouterConfig),
    ) -> Self {
        let host_ports: Vec<HostPort> =
            (0..n).map(|i| format!("10.0.0.{}:4040", i + 1)).collect();
        let hash_ring = Arc::new(HashRing::new(host_ports.clone()));

        let mut routers = HashMap::new();
        for host_port in &host_ports {
            let mut config = RouterConfig::new(host_port.clone());
            config.k_default = k;
            // keep fan-out retries snappy under test
            config.relay_ad_retry_delay = Duration::from_millis(10);
            configure(&mut config);

            let ring = Arc::new(RingView::new(
                hash_ring.clone(),
                host_port.clone(),
                config.k_default,
            ));
            let transport = Arc::new(InMemoryTransport::new());
            let stats = Arc::new(MemorySink::new());
            let dispatcher = Dispatcher::spawn(RouterContext {
                config,
                ring,
                transport: transport.clone() as Arc<dyn Transport>,
                stats: stats.clone(),
            });
            let handler = AdvertiseHandler::new(dispatcher.clone());
            routers.insert(
                host_port.clone(),
                TestRouter {
                    host_port: host_port.clone(),
                    dispatcher,
                    handler,
                    transport,
                    stats,
                },
            );
        }

        let handlers: Arc<HashMap<HostPort, AdvertiseHandler>> = Arc::new(
            routers
                .iter()
                .map(|(hp, router)| (hp.clone(), router.handler.clone()))
                .collect(),
        );
        for router in routers.values() {
            let handlers = handlers.clone();
            router.transport.set_network(Arc::new(move |target, req| {
                let handlers = handlers.clone();
                Box::pin(async move {
                    match handlers.get(&target) {
                        Some(handler) => match handler.route(req).await {
                            DispatchOutcome::Response(res) => Ok(res),
                            DispatchOutcome::Error(frame) => Err(frame),
                            DispatchOutcome::Dropped(_) => {
                                Err(ErrorFrame::timeout("request black-holed"))
                            }
                        },
                        // an unscripted worker accepts and answers empty
                        None => Ok(relaymesh_common::CallResponse::empty()),
                    }
                })
            }));
        }

        Self { hash_ring, host_ports, routers }
    }

    pub fn router(&self, host_port: &str) -> &TestRouter {
        &self.routers[host_port]
    }

    /// The exit set for a service, from any member's view.
    pub fn exits_for(&self, service_name: &str) -> Vec<HostPort> {
        self.router(&self.host_ports[0])
            .dispatcher
            .ring()
            .exits_for(service_name)
    }

    /// A member that is not an exit for the service, if the fleet has one.
    pub fn forward_router_for(&self, service_name: &str) -> Option<&TestRouter> {
        let exits = self.exits_for(service_name);
        self.host_ports
            .iter()
            .find(|hp| !exits.contains(hp))
            .map(|hp| self.router(hp))
    }

    fn ad_body(services: &[&str]) -> AdRequest {
        AdRequest {
            services: services
                .iter()
                .map(|sn| AdService { service_name: sn.to_string(), cost: 0 })
                .collect(),
        }
    }

    /// Worker `worker_hp` advertises `services` through the router at `via`.
    pub async fn advertise(&self, worker_hp: &str, via: &str, services: &[&str]) -> CallResult {
        let router = self.router(via);
        let req = CallRequest::new("relaymesh", "ad")
            .with_caller("test-worker")
            .with_remote_name(worker_hp)
            .with_body(serde_json::to_value(Self::ad_body(services)).unwrap());
        match router.handler.route(req).await {
            DispatchOutcome::Response(res) => Ok(res),
            DispatchOutcome::Error(frame) => Err(frame),
            DispatchOutcome::Dropped(reason) => panic!("advertise dropped: {reason:?}"),
        }
    }

    pub async fn unadvertise(&self, worker_hp: &str, via: &str, services: &[&str]) -> CallResult {
        let router = self.router(via);
        let req = CallRequest::new("relaymesh", "unad")
            .with_caller("test-worker")
            .with_remote_name(worker_hp)
            .with_body(serde_json::to_value(Self::ad_body(services)).unwrap());
        match router.handler.route(req).await {
            DispatchOutcome::Response(res) => Ok(res),
            DispatchOutcome::Error(frame) => Err(frame),
            DispatchOutcome::Dropped(reason) => panic!("unadvertise dropped: {reason:?}"),
        }
    }

    pub async fn discover(&self, via: &str, service_name: &str) -> CallResult {
        let router = self.router(via);
        let req = CallRequest::new("relaymesh", "discover")
            .with_caller("test-client")
            .with_body(serde_json::json!({ "serviceName": service_name }));
        match router.handler.route(req).await {
            DispatchOutcome::Response(res) => Ok(res),
            DispatchOutcome::Error(frame) => Err(frame),
            DispatchOutcome::Dropped(reason) => panic!("discover dropped: {reason:?}"),
        }
    }

    /// Let spawned fan-out and drain tasks run.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Decode a discovery result into sorted `ip:port` strings.
pub fn discovered_host_ports(result: &relaymesh_common::CallResponse) -> Vec<String> {
    let decoded: DiscoveryResult = serde_json::from_value(result.body.clone()).unwrap();
    let mut host_ports: Vec<String> =
        decoded.peers.iter().map(|peer| peer.to_host_port()).collect();
    host_ports.sort();
    host_ports
}

/// Drive one manual reap tick on a router.
pub async fn reap_tick(router: &TestRouter) {
    for (host_port, services) in router.dispatcher.begin_reap_cycle().await {
        router.dispatcher.reap_peer(&host_port, &services).await;
    }
}
