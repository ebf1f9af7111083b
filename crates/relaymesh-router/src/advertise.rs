//! The advertise protocol and the router's own endpoint surface.
//!
//! `ad`/`unad` arrive from workers on the ingress router; each named
//! service is bucketed by its exit routers and fanned out as
//! `relay-ad`/`relay-unad`. The ingress response returns immediately — the
//! fan-out is soft best-effort with bounded retries, and the reaper makes
//! up for anything that slipped through.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use relaymesh_common::{
    AdRequest, AdResponse, CallRequest, CallResponse, CallResult, Endpoint, ErrorFrame, HostPort,
    RelayAdRequest, RelayAdService, UnadResponse,
};

use crate::discovery;
use crate::dispatcher::{DispatchOutcome, Dispatcher};

/// Serves the endpoints addressed to the router itself and routes
/// everything else through the dispatcher's data path.
#[derive(Clone)]
pub struct AdvertiseHandler {
    dispatcher: Arc<Dispatcher>,
}

impl AdvertiseHandler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Full ingress entry point: requests addressed to the router service
    /// hit the endpoint handlers, everything else is relayed.
    pub async fn route(&self, req: CallRequest) -> DispatchOutcome {
        if req.service_name == self.dispatcher.config().router_service {
            let outcome = match Endpoint::from_name(&req.endpoint) {
                Some(endpoint) => self.handle_endpoint(endpoint, req).await,
                None => Err(ErrorFrame::bad_request(format!(
                    "unknown endpoint {:?}",
                    req.endpoint
                ))),
            };
            match outcome {
                Ok(res) => DispatchOutcome::Response(res),
                Err(frame) => DispatchOutcome::Error(frame),
            }
        } else {
            self.dispatcher.handle_request(req).await
        }
    }

    pub async fn handle_endpoint(&self, endpoint: Endpoint, req: CallRequest) -> CallResult {
        match endpoint {
            Endpoint::Ad => self.handle_ad(req).await,
            Endpoint::Unad => self.handle_unad(req).await,
            Endpoint::RelayAd => self.handle_relay_ad(req).await,
            Endpoint::RelayUnad => self.handle_relay_unad(req).await,
            Endpoint::Discover => discovery::discover(&self.dispatcher, &req, false).await,
            Endpoint::DiscoverAffine => discovery::discover(&self.dispatcher, &req, true).await,
            Endpoint::Circuits => self.handle_circuits(),
        }
    }

    /// Ingress advertise: bucket services by exit, fan out, answer now.
    async fn handle_ad(&self, req: CallRequest) -> CallResult {
        let (host_port, by_exit, exit_count) = self.bucket_by_exit(&req)?;
        for (service_name, _) in local_entries(&by_exit, self.local()) {
            self.dispatcher.refresh_service_peer(&service_name, &host_port).await;
        }
        self.fan_out(Endpoint::RelayAd, by_exit);
        encode(&AdResponse { connection_count: exit_count })
    }

    /// Ingress unadvertise, mirroring `handle_ad`.
    async fn handle_unad(&self, req: CallRequest) -> CallResult {
        let (host_port, by_exit, _) = self.bucket_by_exit(&req)?;
        for (service_name, _) in local_entries(&by_exit, self.local()) {
            self.dispatcher.remove_service_peer(&service_name, &host_port).await;
        }
        self.fan_out(Endpoint::RelayUnad, by_exit);
        encode(&UnadResponse {})
    }

    async fn handle_relay_ad(&self, req: CallRequest) -> CallResult {
        let body: RelayAdRequest = decode(req.body)?;
        for entry in body.services {
            self.dispatcher
                .refresh_service_peer(&entry.service_name, &entry.host_port)
                .await;
        }
        encode(&UnadResponse {})
    }

    async fn handle_relay_unad(&self, req: CallRequest) -> CallResult {
        let body: RelayAdRequest = decode(req.body)?;
        for entry in body.services {
            self.dispatcher
                .remove_service_peer(&entry.service_name, &entry.host_port)
                .await;
        }
        encode(&UnadResponse {})
    }

    fn handle_circuits(&self) -> CallResult {
        encode(&self.dispatcher.circuits().snapshot())
    }

    fn local(&self) -> &str {
        &self.dispatcher.config().local_host_port
    }

    /// Parse an `ad`/`unad` body and group its services by the exit hosts
    /// responsible for them. Returns the advertiser's host-port, the
    /// per-exit buckets (the local router included), and the distinct exit
    /// count reported back to the worker.
    #[allow(clippy::type_complexity)]
    fn bucket_by_exit(
        &self,
        req: &CallRequest,
    ) -> Result<(HostPort, HashMap<HostPort, Vec<RelayAdService>>, usize), ErrorFrame> {
        let body: AdRequest = decode(req.body.clone())?;
        let host_port = req
            .remote_name
            .clone()
            .ok_or_else(|| ErrorFrame::bad_request("unidentified connection"))?;

        let mut by_exit: HashMap<HostPort, Vec<RelayAdService>> = HashMap::new();
        let mut exits_seen: HashSet<HostPort> = HashSet::new();
        for service in body.services {
            if service.service_name.is_empty() {
                return Err(ErrorFrame::bad_request("no service name given"));
            }
            for exit in self.dispatcher.ring().exits_for(&service.service_name) {
                exits_seen.insert(exit.clone());
                by_exit.entry(exit).or_default().push(RelayAdService {
                    service_name: service.service_name.clone(),
                    host_port: host_port.clone(),
                    cost: service.cost,
                });
            }
        }
        let exit_count = exits_seen.len();
        Ok((host_port, by_exit, exit_count))
    }

    /// Spawn one relay task per remote exit; the ingress response never
    /// waits on these.
    fn fan_out(&self, endpoint: Endpoint, by_exit: HashMap<HostPort, Vec<RelayAdService>>) {
        let local = self.local().to_string();
        for (exit, services) in by_exit {
            if exit == local {
                continue;
            }
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                send_relay(dispatcher, exit, endpoint, services).await;
            });
        }
    }
}

fn local_entries(
    by_exit: &HashMap<HostPort, Vec<RelayAdService>>,
    local: &str,
) -> Vec<(String, u32)> {
    by_exit
        .get(local)
        .map(|services| {
            services
                .iter()
                .map(|entry| (entry.service_name.clone(), entry.cost))
                .collect()
        })
        .unwrap_or_default()
}

/// One exit's share of an advertise fan-out: bounded retries on network and
/// timeout errors, everything else logged and swallowed. The worker's
/// response already went out, so failures here cost convergence time, not
/// correctness — the next re-advertise or the reaper settles it.
pub async fn send_relay(
    dispatcher: Arc<Dispatcher>,
    exit: HostPort,
    endpoint: Endpoint,
    services: Vec<RelayAdService>,
) {
    let config = dispatcher.config();
    let body = match serde_json::to_value(&RelayAdRequest { services }) {
        Ok(body) => body,
        Err(err) => {
            warn!(exit = %exit, error = %err, "failed to encode relay body");
            return;
        }
    };
    let peer = dispatcher.transport().peer(&exit);

    let mut attempt = 1;
    loop {
        dispatcher.stats().incr("advertise.relay-attempt", 1);
        let req = CallRequest::new(config.router_service.clone(), endpoint.name())
            .with_caller(config.caller_name.clone())
            .with_body(body.clone());
        match peer.send(req, config.relay_ad_timeout).await {
            Ok(_) => {
                debug!(exit = %exit, endpoint = endpoint.name(), attempt, "relay delivered");
                return;
            }
            Err(frame) if frame.code.is_retryable() && attempt < config.max_relay_ad_attempts => {
                warn!(
                    exit = %exit,
                    endpoint = endpoint.name(),
                    attempt,
                    error = %frame,
                    "relay attempt failed; retrying"
                );
                attempt += 1;
                sleep(config.relay_ad_retry_delay).await;
            }
            Err(frame) => {
                dispatcher.stats().incr("advertise.relay-failure", 1);
                if frame.code.is_fatal() {
                    error!(exit = %exit, endpoint = endpoint.name(), error = %frame, "relay failed");
                } else {
                    warn!(exit = %exit, endpoint = endpoint.name(), error = %frame, "relay failed");
                }
                return;
            }
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, ErrorFrame> {
    serde_json::from_value(body)
        .map_err(|err| ErrorFrame::bad_request(format!("malformed request body: {err}")))
}

fn encode<T: serde::Serialize>(value: &T) -> CallResult {
    match serde_json::to_value(value) {
        Ok(body) => Ok(CallResponse::new(body)),
        Err(err) => Err(ErrorFrame::bad_request(format!("unencodable response: {err}"))),
    }
}
