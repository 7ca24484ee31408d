//! TCP transport for DNS requests.
//!
//! Each client connection is handled independently and may carry
//! several requests. TCP DNS messages are prefixed with a 2-byte length.
//! Zone transfers are only ever served here.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use super::{Protocol, RequestHandler, ResponseSink, drain};

/// How long an idle client connection is kept open.
pub const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(8);

/// TCP transport for DNS proxy.
///
/// Binds to a local address and accepts connections from clients.
/// Each connection is handled in a separate task.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind a TCP listener for the transport.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the TCP transport.
    ///
    /// Spawns an accept loop that handles each connection in a separate
    /// task. The loop stops accepting once `shutdown` changes, then gives
    /// open connections up to `grace` to finish.
    pub fn start(
        self,
        handler: Arc<RequestHandler>,
        shutdown: watch::Receiver<bool>,
        grace: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(run_accept_loop(self.listener, handler, shutdown, grace))
    }
}

/// Accept loop - spawns a handler task for each incoming connection.
async fn run_accept_loop(
    listener: TcpListener,
    handler: Arc<RequestHandler>,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((client, peer)) => {
                    connections.spawn(handle_connection(
                        client,
                        peer,
                        handler.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!("TCP accept error: {}", e);
                }
            },
            Some(result) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = result {
                    warn!("TCP connection task failed: {}", e);
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    drop(listener);
    drain(&mut connections, grace, Protocol::Tcp).await;
}

/// Handle a single TCP connection: read requests until the client goes
/// away, goes idle, or the proxy shuts down.
async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    handler: Arc<RequestHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let message = tokio::select! {
            result = tokio::time::timeout(TCP_IDLE_TIMEOUT, read_framed(&mut client)) => match result {
                Ok(Ok(message)) => message,
                Ok(Err(e)) => {
                    if e.kind() != io::ErrorKind::UnexpectedEof {
                        debug!("TCP read error from {}: {}", peer, e);
                    }
                    return;
                }
                Err(_) => {
                    debug!("closing idle TCP connection from {}", peer);
                    return;
                }
            },
            _ = shutdown.changed() => return,
        };

        handler
            .handle(message, peer, Protocol::Tcp, &mut client)
            .await;
    }
}

impl ResponseSink for TcpStream {
    async fn write_message(&mut self, message: &[u8]) -> io::Result<()> {
        write_framed(self, message).await
    }
}

/// Read one length-prefixed DNS message, returned without its prefix.
pub async fn read_framed<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<Vec<u8>> {
    let len = stream.read_u16().await? as usize;
    let mut message = vec![0u8; len];
    stream.read_exact(&mut message).await?;

    Ok(message)
}

/// Write `message` with its 2-byte length prefix.
pub async fn write_framed<W: AsyncWrite + Unpin>(stream: &mut W, message: &[u8]) -> io::Result<()> {
    let len = u16::try_from(message.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "DNS message too large for TCP framing",
        )
    })?;

    let mut framed = Vec::with_capacity(2 + message.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);
    stream.write_all(&framed).await
}
