//! Transport layer for the DNS proxy.
//!
//! Provides UDP and TCP transports for receiving requests from clients
//! and the shared entry point that routes and forwards each of them.

pub mod tcp;
pub mod udp;

/// Maximum size of an inbound UDP DNS message (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::task::JoinSet;

use crate::dns::{self, HEADER_LEN, ParseError, Request};
use crate::error::RequestError;
use crate::forward::Forwarder;
use crate::resolver::{Resolver, Route};

/// Transport an inbound request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where replies for one requester are written.
pub trait ResponseSink: Send {
    /// Write one complete DNS message to the requester.
    fn write_message(&mut self, message: &[u8]) -> impl Future<Output = io::Result<()>> + Send;
}

/// Logger for request outcomes.
pub struct QueryLogger {
    protocol: Protocol,
}

impl QueryLogger {
    pub fn new(protocol: Protocol) -> Self {
        Self { protocol }
    }

    pub fn forwarded(&self, domain: &str, route: &Route, elapsed: Duration, from: SocketAddr) {
        let action = if route.transfer.is_some() {
            "TRANSFERRED"
        } else {
            "FORWARDED"
        };
        debug!(
            "[{}] {} {} to {} total={:.3}ms (from {})",
            self.protocol,
            domain,
            action,
            route.upstream,
            elapsed.as_secs_f64() * 1000.0,
            from
        );
    }

    pub fn failed(&self, domain: &str, err: &RequestError, from: SocketAddr) {
        warn!("[{}] {} FAILED: {} (from {})", self.protocol, domain, err, from);
    }

    pub fn malformed(&self, from: SocketAddr) {
        debug!("[{}] malformed request (from {})", self.protocol, from);
    }
}

/// Routes and forwards inbound requests.
///
/// Every per-request failure collapses into the same SERVFAIL reply, so
/// the requester cannot tell a denied transfer from an unreachable
/// upstream.
pub struct RequestHandler {
    resolver: Resolver,
    forwarder: Forwarder,
}

impl RequestHandler {
    pub fn new(resolver: Resolver, forwarder: Forwarder) -> Self {
        Self {
            resolver,
            forwarder,
        }
    }

    /// Handle one inbound message (without TCP length prefix).
    pub async fn handle<S: ResponseSink>(
        &self,
        message: Vec<u8>,
        peer: SocketAddr,
        protocol: Protocol,
        sink: &mut S,
    ) {
        let start = Instant::now();
        let logger = QueryLogger::new(protocol);
        let header = message.get(..HEADER_LEN).map(<[u8]>::to_vec);

        let request = match Request::parse(message) {
            Ok(request) => request,
            Err(ParseError::Malformed) => {
                logger.malformed(peer);
                if let Some(reply) = header.as_deref().and_then(dns::format_error_response) {
                    write_reply(sink, &reply, peer).await;
                }
                return;
            }
            Err(e) => {
                debug!("[{}] dropping message from {}: {}", protocol, peer, e);
                return;
            }
        };

        let domain = request.subject().unwrap_or("<none>");
        match self.route_and_forward(&request, peer, protocol, sink).await {
            Ok(route) => logger.forwarded(domain, &route, start.elapsed(), peer),
            Err(err) => {
                logger.failed(domain, &err, peer);
                write_reply(sink, &request.failure_response(), peer).await;
            }
        }
    }

    async fn route_and_forward<S: ResponseSink>(
        &self,
        request: &Request,
        peer: SocketAddr,
        protocol: Protocol,
        sink: &mut S,
    ) -> Result<Route, RequestError> {
        let route = self.resolver.decide(request, peer)?;
        self.forwarder.forward(&route, request, protocol, sink).await?;
        Ok(route)
    }
}

async fn write_reply<S: ResponseSink>(sink: &mut S, reply: &[u8], peer: SocketAddr) {
    if let Err(e) = sink.write_message(reply).await {
        debug!("failed to send reply to {}: {}", peer, e);
    }
}

/// Wait for in-flight request tasks, aborting whatever is left after `grace`.
async fn drain(tasks: &mut JoinSet<()>, grace: Duration, protocol: Protocol) {
    if tasks.is_empty() {
        return;
    }
    info!("[{}] waiting for {} in-flight requests", protocol, tasks.len());

    let all_done = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(grace, all_done).await.is_err() {
        warn!(
            "[{}] aborting {} requests still running after {:?}",
            protocol,
            tasks.len(),
            grace
        );
        tasks.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::{ConfigStore, RoutingConfig};
    use crate::dns::{RCODE_FORMERR, RCODE_SERVFAIL, TYPE_AXFR, encode_query};

    const TYPE_A: u16 = 1;

    /// Records every message written to it.
    #[derive(Default)]
    struct RecordingSink {
        messages: Vec<Vec<u8>>,
    }

    impl ResponseSink for RecordingSink {
        async fn write_message(&mut self, message: &[u8]) -> io::Result<()> {
            self.messages.push(message.to_vec());
            Ok(())
        }
    }

    fn handler(config: RoutingConfig) -> RequestHandler {
        RequestHandler::new(
            Resolver::new(Arc::new(ConfigStore::new(config))),
            Forwarder::new(Duration::from_millis(200)),
        )
    }

    fn peer(ip: &str) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), 40000)
    }

    fn rcode(message: &[u8]) -> u8 {
        message[3] & 0x0F
    }

    #[tokio::test]
    async fn zero_questions_get_servfail() {
        let mut sink = RecordingSink::default();
        let mut query = encode_query(9, "a.example", TYPE_A);
        query[5] = 0;
        query.truncate(HEADER_LEN);

        handler(RoutingConfig::new(""))
            .handle(query, peer("192.0.2.1"), Protocol::Udp, &mut sink)
            .await;

        assert_eq!(sink.messages.len(), 1);
        assert_eq!(rcode(&sink.messages[0]), RCODE_SERVFAIL);
        assert_eq!(&sink.messages[0][..2], &[0x00, 0x09]);
    }

    #[tokio::test]
    async fn malformed_question_gets_formerr() {
        let mut sink = RecordingSink::default();
        let mut query = encode_query(9, "a.example", TYPE_A);
        query.truncate(query.len() - 2);

        handler(RoutingConfig::new(""))
            .handle(query, peer("192.0.2.1"), Protocol::Udp, &mut sink)
            .await;

        assert_eq!(sink.messages.len(), 1);
        assert_eq!(rcode(&sink.messages[0]), RCODE_FORMERR);
    }

    #[tokio::test]
    async fn responses_and_runts_are_dropped() {
        let mut sink = RecordingSink::default();
        let mut response = encode_query(9, "a.example", TYPE_A);
        response[2] |= 0x80;
        let handler = handler(RoutingConfig::new(""));

        handler
            .handle(response, peer("192.0.2.1"), Protocol::Udp, &mut sink)
            .await;
        handler
            .handle(vec![0x01, 0x02], peer("192.0.2.1"), Protocol::Udp, &mut sink)
            .await;

        assert!(sink.messages.is_empty());
    }

    #[tokio::test]
    async fn denied_transfer_gets_servfail() {
        let mut sink = RecordingSink::default();
        let config = RoutingConfig::new("").with_transfer("a.example.", ["10.0.0.2"]);

        handler(config)
            .handle(
                encode_query(3, "a.example", TYPE_AXFR),
                peer("10.0.0.3"),
                Protocol::Tcp,
                &mut sink,
            )
            .await;

        assert_eq!(sink.messages.len(), 1);
        assert_eq!(rcode(&sink.messages[0]), RCODE_SERVFAIL);
    }

    #[tokio::test]
    async fn authorization_is_checked_before_transport() {
        let mut sink = RecordingSink::default();
        let config = RoutingConfig::new("127.0.0.1:9").with_transfer("a.example.", ["10.0.0.2"]);
        let handler = handler(config);
        let request = Request::parse(encode_query(3, "a.example", TYPE_AXFR)).unwrap();

        let unlisted = handler
            .route_and_forward(&request, peer("10.0.0.3"), Protocol::Udp, &mut sink)
            .await;
        let listed = handler
            .route_and_forward(&request, peer("10.0.0.2"), Protocol::Udp, &mut sink)
            .await;

        assert!(matches!(unlisted, Err(RequestError::AuthorizationDenied { .. })));
        assert!(matches!(listed, Err(RequestError::UnsupportedTransport)));
        assert!(sink.messages.is_empty());
    }

    #[tokio::test]
    async fn transfer_over_udp_is_rejected_even_when_allowed() {
        let mut sink = RecordingSink::default();
        let route = Route {
            upstream: "127.0.0.1:9".to_string(),
            transfer: Some(dns::TransferKind::Axfr),
        };
        let request = Request::parse(encode_query(3, "a.example", TYPE_AXFR)).unwrap();

        let err = Forwarder::default()
            .forward(&route, &request, Protocol::Udp, &mut sink)
            .await
            .unwrap_err();

        assert!(matches!(err, RequestError::UnsupportedTransport));
        assert!(sink.messages.is_empty());
    }
}
