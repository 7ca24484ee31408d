//! Routing decisions for inbound requests.
//!
//! Handles the decision pipeline for each request:
//! 1. Validate (at least one question)
//! 2. Authorize zone transfers against the allow-list
//! 3. Resolve the upstream from the routing table
//!
//! Transports handle the actual I/O, the resolver only decides. All
//! steps read the same configuration snapshot, which is released
//! before any upstream I/O starts.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::{ConfigStore, RoutingConfig};
use crate::dns::{Request, TransferKind};
use crate::error::RequestError;

/// Where and how to forward a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Upstream `host:port`.
    pub upstream: String,
    /// Set when the request is a zone transfer.
    pub transfer: Option<TransferKind>,
}

/// Whether `requester` may send `request`.
///
/// Ordinary queries are always allowed. Transfers are allowed only when
/// the first question's zone lists `requester` (an IP address without
/// port) verbatim.
pub fn is_transfer_allowed(request: &Request, requester: &str, config: &RoutingConfig) -> bool {
    if !request.is_transfer() {
        return true;
    }
    let Some(zone) = request.subject() else {
        return false;
    };
    config
        .transfer_allowlist(zone)
        .is_some_and(|allowed| allowed.iter().any(|ip| ip == requester))
}

/// Upstream for `name`: the exact route if there is one, otherwise the
/// default server.
pub fn resolve_upstream<'a>(name: &str, config: &'a RoutingConfig) -> &'a str {
    config
        .route(name)
        .unwrap_or_else(|| config.default_server())
}

/// Makes routing decisions against the active configuration.
pub struct Resolver {
    store: Arc<ConfigStore>,
}

impl Resolver {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    /// Decide where `request` from `peer` goes.
    pub fn decide(&self, request: &Request, peer: SocketAddr) -> Result<Route, RequestError> {
        let subject = request.subject().ok_or(RequestError::NoQuestions)?;

        let config = self.store.snapshot();

        let requester = peer.ip().to_string();
        if !is_transfer_allowed(request, &requester, &config) {
            return Err(RequestError::AuthorizationDenied {
                zone: subject.to_string(),
                requester,
            });
        }

        Ok(Route {
            upstream: resolve_upstream(subject, &config).to_string(),
            transfer: request.transfer_kind(),
        })
    }
}
