//! DNS proxy orchestration.
//!
//! Binds transports, reacts to reload and shutdown requests and drains
//! the listeners on the way out.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::{mpsc, watch};

use crate::config::{ConfigStore, RoutingConfig};
use crate::error::ProxyError;
use crate::forward::Forwarder;
use crate::resolver::Resolver;
use crate::transport::RequestHandler;
use crate::transport::{tcp::TcpTransport, udp::UdpTransport};

/// Configuration for the DNS proxy.
pub struct ProxyConfig {
    /// Local address to bind for both UDP and TCP (e.g., 127.0.0.1:53)
    pub bind_addr: SocketAddr,
    /// Routing configuration file, re-read on every reload
    pub config_path: PathBuf,
    /// Bound on each upstream I/O step
    pub upstream_timeout: Duration,
    /// How long in-flight requests may run after shutdown starts
    pub shutdown_grace: Duration,
}

/// Commands driving the proxy's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Re-read the routing configuration.
    Reload,
    /// Stop accepting requests, drain and exit.
    Shutdown,
}

/// A bound, not yet running proxy.
pub struct Proxy {
    config: ProxyConfig,
    store: Arc<ConfigStore>,
    udp: UdpTransport,
    tcp: TcpTransport,
    local_addr: SocketAddr,
}

impl Proxy {
    /// Load the routing configuration and bind both transports.
    ///
    /// Fails if the configuration cannot be loaded or either transport
    /// cannot bind. With port 0, UDP binds to the port TCP was given.
    pub async fn bind(config: ProxyConfig) -> Result<Self, ProxyError> {
        info!(
            "Loading the configuration from {}",
            config.config_path.display()
        );
        let routing = RoutingConfig::load(&config.config_path)?;
        log_routing_summary(&routing);

        let tcp = TcpTransport::bind(config.bind_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                protocol: "TCP",
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = tcp.local_addr().map_err(|source| ProxyError::Bind {
            protocol: "TCP",
            addr: config.bind_addr,
            source,
        })?;
        let udp = UdpTransport::bind(local_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                protocol: "UDP",
                addr: local_addr,
                source,
            })?;

        Ok(Self {
            config,
            store: Arc::new(ConfigStore::new(routing)),
            udp,
            tcp,
            local_addr,
        })
    }

    /// Address both transports listen on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The store holding the active routing configuration.
    pub fn config_store(&self) -> Arc<ConfigStore> {
        self.store.clone()
    }

    /// Serve until `control` asks for shutdown or closes.
    ///
    /// A reload that fails to load is returned as an error right away;
    /// the proxy never keeps serving a configuration it could not reload.
    pub async fn run(self, mut control: mpsc::Receiver<Control>) -> Result<(), ProxyError> {
        let handler = Arc::new(RequestHandler::new(
            Resolver::new(self.store.clone()),
            Forwarder::new(self.config.upstream_timeout),
        ));
        let grace = self.config.shutdown_grace;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let udp = self.udp.start(handler.clone(), shutdown_rx.clone(), grace);
        let tcp = self.tcp.start(handler, shutdown_rx, grace);
        info!("DNS proxy listening on {} (UDP and TCP)", self.local_addr);

        loop {
            match control.recv().await {
                Some(Control::Reload) => {
                    info!(
                        "Reloading the configuration from {}",
                        self.config.config_path.display()
                    );
                    self.store.reload(&self.config.config_path)?;
                    log_routing_summary(&self.store.snapshot());
                }
                Some(Control::Shutdown) | None => {
                    info!("Shutting down");
                    break;
                }
            }
        }

        let _ = shutdown_tx.send(true);
        let (udp, tcp) = futures::future::join(udp, tcp).await;
        for result in [udp, tcp] {
            if let Err(e) = result {
                warn!("Listener task failed: {}", e);
            }
        }
        info!("Shutdown complete");

        Ok(())
    }
}

fn log_routing_summary(config: &RoutingConfig) {
    info!(
        "Routing {} names, {} transfer zones, default server {}",
        config.routes_len(),
        config.transfers_len(),
        config.default_server()
    );
}

/// Translate process signals into [`Control`] commands.
///
/// SIGHUP reloads; SIGINT and SIGTERM shut down.
#[cfg(unix)]
pub fn signal_events() -> Result<mpsc::Receiver<Control>, ProxyError> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).map_err(ProxyError::Signal)?;
    let mut interrupt = signal(SignalKind::interrupt()).map_err(ProxyError::Signal)?;
    let mut terminate = signal(SignalKind::terminate()).map_err(ProxyError::Signal)?;
    let (tx, rx) = mpsc::channel(4);

    tokio::spawn(async move {
        loop {
            let command = tokio::select! {
                _ = hangup.recv() => {
                    info!("Received SIGHUP");
                    Control::Reload
                }
                _ = interrupt.recv() => {
                    info!("Received SIGINT");
                    Control::Shutdown
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM");
                    Control::Shutdown
                }
            };
            if tx.send(command).await.is_err() {
                break;
            }
        }
    });

    Ok(rx)
}

/// Translate Ctrl-C into [`Control::Shutdown`].
#[cfg(not(unix))]
pub fn signal_events() -> Result<mpsc::Receiver<Control>, ProxyError> {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C");
            let _ = tx.send(Control::Shutdown).await;
        }
    });

    Ok(rx)
}
