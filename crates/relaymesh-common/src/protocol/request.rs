use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ErrorFrame;
use crate::{CallerName, EndpointName, HostPort, ServiceName};

/// A request envelope as the dispatch core sees it.
///
/// The framed transport decodes frames and headers before the core is
/// involved; what arrives here is the declared destination service, the
/// endpoint within it, the `cn`/`rd` headers, the remote name of the
/// connection the frame arrived on, and the (already reassembled) body.
///
/// # Example
///
/// ```
/// use relaymesh_common::protocol::CallRequest;
///
/// let req = CallRequest::new("steve", "ifyousayso")
///     .with_caller("bob")
///     .with_routing_delegate("steve-staging");
/// assert_eq!(req.effective_service(), "steve-staging");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    /// Declared destination service name.
    pub service_name: ServiceName,
    /// Endpoint within the destination service.
    pub endpoint: EndpointName,
    /// `cn` header: identity of the originating service.
    pub caller_name: Option<CallerName>,
    /// `rd` header: overrides the effective destination for admission.
    pub routing_delegate: Option<ServiceName>,
    /// Remote name of the connection this frame arrived on, when identified.
    pub remote_name: Option<HostPort>,
    /// Request body, reassembled by the transport.
    pub body: Value,
}

impl CallRequest {
    pub fn new(service_name: impl Into<ServiceName>, endpoint: impl Into<EndpointName>) -> Self {
        Self {
            service_name: service_name.into(),
            endpoint: endpoint.into(),
            caller_name: None,
            routing_delegate: None,
            remote_name: None,
            body: Value::Null,
        }
    }

    pub fn with_caller(mut self, caller: impl Into<CallerName>) -> Self {
        self.caller_name = Some(caller.into());
        self
    }

    pub fn with_routing_delegate(mut self, rd: impl Into<ServiceName>) -> Self {
        self.routing_delegate = Some(rd.into());
        self
    }

    pub fn with_remote_name(mut self, hp: impl Into<HostPort>) -> Self {
        self.remote_name = Some(hp.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// The destination service after applying the routing delegate.
    ///
    /// All admission checks use this name, not the declared one.
    pub fn effective_service(&self) -> &str {
        self.routing_delegate
            .as_deref()
            .unwrap_or(&self.service_name)
    }
}

/// A successful response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub body: Value,
}

impl CallResponse {
    pub fn new(body: Value) -> Self {
        Self { body }
    }

    pub fn empty() -> Self {
        Self { body: Value::Object(Default::default()) }
    }
}

pub type CallResult = std::result::Result<CallResponse, ErrorFrame>;
