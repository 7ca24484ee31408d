//! UDP transport for DNS requests.
//!
//! Every datagram is handled in its own task: it is routed, exchanged
//! with its upstream over a fresh UDP socket, and the answer is sent
//! back from the listening socket.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use super::{MAX_DNS_PACKET_SIZE, Protocol, RequestHandler, ResponseSink, drain};

/// UDP transport for DNS proxy.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind the listening UDP socket.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);

        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Start the UDP transport.
    ///
    /// Stops receiving once `shutdown` changes, then gives in-flight
    /// requests up to `grace` to finish.
    pub fn start(
        self,
        handler: Arc<RequestHandler>,
        shutdown: watch::Receiver<bool>,
        grace: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(run(self.socket, handler, shutdown, grace))
    }
}

/// Sends replies to one client through the listening socket.
struct UdpReply {
    socket: Arc<UdpSocket>,
    client_addr: SocketAddr,
}

impl ResponseSink for UdpReply {
    async fn write_message(&mut self, message: &[u8]) -> io::Result<()> {
        self.socket.send_to(message, self.client_addr).await?;
        Ok(())
    }
}

/// Receive loop for the UDP transport.
async fn run(
    socket: Arc<UdpSocket>,
    handler: Arc<RequestHandler>,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
) {
    let mut requests = JoinSet::new();
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (len, src) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("UDP recv error: {}", e);
                        continue;
                    }
                };

                let message = buf[..len].to_vec();
                let handler = handler.clone();
                let mut reply = UdpReply {
                    socket: socket.clone(),
                    client_addr: src,
                };
                requests.spawn(async move {
                    handler.handle(message, src, Protocol::Udp, &mut reply).await;
                });
            }
            Some(result) = requests.join_next(), if !requests.is_empty() => {
                if let Err(e) = result {
                    warn!("UDP request task failed: {}", e);
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    drain(&mut requests, grace, Protocol::Udp).await;
}
