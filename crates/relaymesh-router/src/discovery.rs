//! Discovery lookups.
//!
//! `discover` resolves a service name to its live worker peers. An exit
//! node answers from its own service channel; a forward-mode node forwards
//! the query once to an exit as `discover-affine`, which never re-forwards.
//! Forwarded queries carry the router service name as their caller so a
//! misrouted hop answers locally instead of looping.

use std::sync::Arc;

use tracing::warn;

use relaymesh_common::{
    CallRequest, CallResponse, CallResult, DiscoveryQuery, DiscoveryResult, Endpoint, ErrorFrame,
    PeerInfo,
};

use crate::dispatcher::Dispatcher;
use crate::service_channel::ChannelMode;

/// Resolve one discovery query. `affine` marks the forwarded form.
pub async fn discover(dispatcher: &Arc<Dispatcher>, req: &CallRequest, affine: bool) -> CallResult {
    let query: DiscoveryQuery = serde_json::from_value(req.body.clone())
        .map_err(|err| ErrorFrame::bad_request(format!("malformed discovery query: {err}")))?;
    if query.service_name.is_empty() {
        return Err(ErrorFrame::bad_request("invalid service name"));
    }

    let config = dispatcher.config();
    let (mode, peers) = dispatcher.channel_view(&query.service_name).await;

    let from_router = req.caller_name.as_deref() == Some(config.router_service.as_str());
    if !affine && mode == ChannelMode::Forward && !from_router {
        return forward_to_exit(dispatcher, &query, &peers).await;
    }

    let mut infos = Vec::with_capacity(peers.len());
    for host_port in &peers {
        match PeerInfo::from_host_port(host_port) {
            Ok(info) => infos.push(info),
            Err(err) => {
                warn!(host_port = %host_port, error = %err, "skipping unencodable peer address");
            }
        }
    }
    if infos.is_empty() {
        return Err(ErrorFrame::declined(format!(
            "no peers available for {}",
            query.service_name
        )));
    }
    let body = serde_json::to_value(&DiscoveryResult { peers: infos })
        .map_err(|err| ErrorFrame::bad_request(format!("unencodable response: {err}")))?;
    Ok(CallResponse::new(body))
}

/// One hop to an exit; the forwarded form never forwards again.
async fn forward_to_exit(
    dispatcher: &Arc<Dispatcher>,
    query: &DiscoveryQuery,
    exits: &[String],
) -> CallResult {
    let config = dispatcher.config();
    let Some(exit) = exits.first() else {
        return Err(ErrorFrame::declined(format!(
            "no peers available for {}",
            query.service_name
        )));
    };
    let req = CallRequest::new(config.router_service.clone(), Endpoint::DiscoverAffine.name())
        .with_caller(config.router_service.clone())
        .with_body(
            serde_json::to_value(query)
                .map_err(|err| ErrorFrame::bad_request(format!("unencodable query: {err}")))?,
        );
    let peer = dispatcher.transport().peer(exit);
    peer.send(req, config.discover_timeout).await
}
