//! Error types for the proxy.
//!
//! Configuration errors are the only kind allowed to stop the process.
//! Everything in [`RequestError`] is scoped to a single request and ends
//! up as the same generic failure reply.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors loading the routing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configuration file is not a valid routing document.
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Errors that end the handling of one request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request carries no questions")]
    NoQuestions,

    /// Zone transfer from an address missing on the zone's allow-list.
    #[error("transfer of {zone} not allowed for {requester}")]
    AuthorizationDenied { zone: String, requester: String },

    #[error("zone transfers are only supported over TCP")]
    UnsupportedTransport,

    /// Single query/response exchange failed.
    #[error("exchange with {upstream} failed: {source}")]
    UpstreamExchange {
        upstream: String,
        #[source]
        source: io::Error,
    },

    /// Zone transfer session failed to open or broke mid-stream.
    #[error("transfer from {upstream} failed: {source}")]
    Transfer {
        upstream: String,
        #[source]
        source: io::Error,
    },

    /// The upstream answered but the reply could not be written back.
    #[error("failed to write reply to requester: {0}")]
    Reply(#[source] io::Error),
}

/// Errors that stop the proxy as a whole.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {protocol} listener on {addr}: {source}")]
    Bind {
        protocol: &'static str,
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to set up signal handling: {0}")]
    Signal(#[source] io::Error),
}
