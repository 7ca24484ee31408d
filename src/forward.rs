//! Forwarding of routed requests to upstream servers.
//!
//! Ordinary queries get exactly one exchange on the same transport the
//! request arrived on. Zone transfers are relayed envelope by envelope
//! over TCP. Nothing here synthesizes replies; failures are returned to
//! the caller, which owns the failure indication.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use log::debug;
use tokio::net::{TcpStream, UdpSocket, lookup_host};

use crate::dns::{HEADER_LEN, Request, TransferKind, TransferTracker};
use crate::error::RequestError;
use crate::resolver::Route;
use crate::transport::tcp::{read_framed, write_framed};
use crate::transport::{Protocol, ResponseSink};

/// Largest UDP datagram we accept from an upstream.
const MAX_UDP_RESPONSE_SIZE: usize = 65535;

/// Default bound on each upstream I/O step.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);

/// Executes routing decisions against upstream servers.
#[derive(Debug, Clone)]
pub struct Forwarder {
    timeout: Duration,
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new(DEFAULT_UPSTREAM_TIMEOUT)
    }
}

impl Forwarder {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Forward `request` along `route` and write the result to `sink`.
    ///
    /// Transfers are refused on anything but TCP. Envelopes already
    /// relayed when a transfer breaks stay written.
    pub async fn forward<S: ResponseSink>(
        &self,
        route: &Route,
        request: &Request,
        protocol: Protocol,
        sink: &mut S,
    ) -> Result<(), RequestError> {
        if let Some(kind) = route.transfer {
            if protocol != Protocol::Tcp {
                return Err(RequestError::UnsupportedTransport);
            }
            return self
                .relay_transfer(kind, request, &route.upstream, sink)
                .await;
        }

        let response = self
            .exchange(request, &route.upstream, protocol)
            .await
            .map_err(|source| RequestError::UpstreamExchange {
                upstream: route.upstream.clone(),
                source,
            })?;

        sink.write_message(&response)
            .await
            .map_err(RequestError::Reply)
    }

    /// One query/response exchange with `upstream` over `protocol`.
    pub async fn exchange(
        &self,
        request: &Request,
        upstream: &str,
        protocol: Protocol,
    ) -> io::Result<Vec<u8>> {
        let response = match protocol {
            Protocol::Udp => self.exchange_udp(request, upstream).await?,
            Protocol::Tcp => self.exchange_tcp(request, upstream).await?,
        };

        if response.len() < HEADER_LEN {
            return Err(invalid("upstream reply shorter than a header"));
        }
        Ok(response)
    }

    async fn exchange_udp(&self, request: &Request, upstream: &str) -> io::Result<Vec<u8>> {
        let addr = self.bounded(resolve_addr(upstream)).await?;
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        socket.send(request.bytes()).await?;

        self.bounded(recv_reply(&socket, request.id())).await
    }

    async fn exchange_tcp(&self, request: &Request, upstream: &str) -> io::Result<Vec<u8>> {
        let mut stream = self.bounded(TcpStream::connect(upstream)).await?;
        self.bounded(write_framed(&mut stream, request.bytes())).await?;
        let response = self.bounded(read_framed(&mut stream)).await?;

        if response.len() >= 2 && response[..2] != request.id().to_be_bytes() {
            return Err(invalid("upstream reply ID does not match the query"));
        }
        Ok(response)
    }

    async fn relay_transfer<S: ResponseSink>(
        &self,
        kind: TransferKind,
        request: &Request,
        upstream: &str,
        sink: &mut S,
    ) -> Result<(), RequestError> {
        let failed = |source| RequestError::Transfer {
            upstream: upstream.to_string(),
            source,
        };
        let mut stream = self
            .bounded(TcpStream::connect(upstream))
            .await
            .map_err(failed)?;
        self.bounded(write_framed(&mut stream, request.bytes()))
            .await
            .map_err(failed)?;

        let mut tracker = TransferTracker::new(kind);
        let mut envelopes = 0usize;
        loop {
            let envelope = self
                .bounded(read_framed(&mut stream))
                .await
                .map_err(failed)?;
            let done = tracker.observe(&envelope).map_err(failed)?;
            sink.write_message(&envelope)
                .await
                .map_err(RequestError::Reply)?;
            envelopes += 1;

            if done {
                debug!("Transfer from {} complete after {} envelopes", upstream, envelopes);
                return Ok(());
            }
        }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = io::Result<T>>) -> io::Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "upstream did not answer in time",
            )),
        }
    }
}

/// Wait for the datagram answering query `id`.
async fn recv_reply(socket: &UdpSocket, id: u16) -> io::Result<Vec<u8>> {
    let id = id.to_be_bytes();
    let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
    loop {
        let len = socket.recv(&mut buf).await?;
        // Stray datagrams with another ID are not ours to answer.
        if len >= 2 && buf[..2] != id {
            continue;
        }
        buf.truncate(len);
        return Ok(buf);
    }
}

async fn resolve_addr(upstream: &str) -> io::Result<SocketAddr> {
    lookup_host(upstream).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address found for {upstream}"),
        )
    })
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::encode_query;

    const TYPE_A: u16 = 1;

    /// Requester that went away before the reply was written.
    struct ClosedSink;

    impl ResponseSink for ClosedSink {
        async fn write_message(&mut self, _message: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "requester gone"))
        }
    }

    /// UDP upstream echoing every query back as a response.
    async fn echo_upstream() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, src)) = socket.recv_from(&mut buf).await {
                buf[2] |= 0x80;
                let _ = socket.send_to(&buf[..len], src).await;
            }
        });
        addr
    }

    fn route(upstream: SocketAddr) -> Route {
        Route {
            upstream: upstream.to_string(),
            transfer: None,
        }
    }

    #[tokio::test]
    async fn exchange_returns_matching_reply() {
        let upstream = echo_upstream().await;
        let request = Request::parse(encode_query(0x2222, "a.example", TYPE_A)).unwrap();

        let reply = Forwarder::default()
            .exchange(&request, &upstream.to_string(), Protocol::Udp)
            .await
            .unwrap();

        assert_eq!(&reply[..2], &[0x22, 0x22]);
        assert_eq!(reply[2] & 0x80, 0x80);
    }

    #[tokio::test]
    async fn failed_reply_write_is_not_blamed_on_upstream() {
        let upstream = echo_upstream().await;
        let request = Request::parse(encode_query(0x3333, "a.example", TYPE_A)).unwrap();

        let err = Forwarder::default()
            .forward(&route(upstream), &request, Protocol::Udp, &mut ClosedSink)
            .await
            .unwrap_err();

        assert!(matches!(err, RequestError::Reply(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn silent_upstream_is_an_exchange_failure() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = Request::parse(encode_query(0x4444, "a.example", TYPE_A)).unwrap();

        let route = route(silent.local_addr().unwrap());

        let err = Forwarder::new(Duration::from_millis(100))
            .forward(&route, &request, Protocol::Udp, &mut ClosedSink)
            .await
            .unwrap_err();

        assert!(matches!(err, RequestError::UpstreamExchange { .. }), "got {err:?}");
    }
}
