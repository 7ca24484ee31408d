//! Routing configuration and the store holding the active snapshot.
//!
//! A [`RoutingConfig`] is never mutated once built. Reloading parses a
//! brand-new one outside of any lock and [`ConfigStore::replace`] swaps
//! the shared reference, so readers see either the old or the new
//! configuration in full.

use std::fs;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use log::Level::Debug;
use log::{debug, log_enabled};
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::error::ConfigError;

/// Immutable routing table: where queries go and who may transfer zones.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "RawRoutingConfig")]
pub struct RoutingConfig {
    routes: FxHashMap<String, String>,
    transfers: FxHashMap<String, Vec<String>>,
    default_server: String,
}

/// The configuration document as written on disk.
#[derive(Deserialize)]
struct RawRoutingConfig {
    #[serde(default)]
    routes: FxHashMap<String, String>,
    #[serde(default)]
    transfers: FxHashMap<String, Vec<String>>,
    #[serde(default, rename = "defaultServer", alias = "defaultserver")]
    default_server: String,
}

impl From<RawRoutingConfig> for RoutingConfig {
    fn from(raw: RawRoutingConfig) -> Self {
        Self {
            routes: raw
                .routes
                .into_iter()
                .map(|(name, addr)| (normalize_name(&name), addr))
                .collect(),
            transfers: raw
                .transfers
                .into_iter()
                .map(|(name, allowed)| (normalize_name(&name), allowed))
                .collect(),
            default_server: raw.default_server,
        }
    }
}

impl RoutingConfig {
    /// Create an empty configuration sending everything to `default_server`.
    pub fn new(default_server: impl Into<String>) -> Self {
        Self {
            default_server: default_server.into(),
            ..Self::default()
        }
    }

    /// Add a route for `name`.
    pub fn with_route(mut self, name: &str, upstream: impl Into<String>) -> Self {
        self.routes.insert(normalize_name(name), upstream.into());
        self
    }

    /// Allow the given requester addresses to transfer `zone`.
    pub fn with_transfer<I, S>(mut self, zone: &str, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transfers.insert(
            normalize_name(zone),
            allowed.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Parse a configuration document.
    pub fn from_yaml(document: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(document)
    }

    /// Read and parse the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.log_summary();
        Ok(config)
    }

    /// Upstream routed for exactly `name`, if any.
    pub fn route(&self, name: &str) -> Option<&str> {
        self.routes.get(name).map(String::as_str)
    }

    /// Requester addresses allowed to transfer `zone`, if the zone is listed.
    pub fn transfer_allowlist(&self, zone: &str) -> Option<&[String]> {
        self.transfers.get(zone).map(Vec::as_slice)
    }

    pub fn default_server(&self) -> &str {
        &self.default_server
    }

    pub fn routes_len(&self) -> usize {
        self.routes.len()
    }

    pub fn transfers_len(&self) -> usize {
        self.transfers.len()
    }

    fn log_summary(&self) {
        if !log_enabled!(Debug) {
            return;
        }
        debug!(
            "Configuration: {} routes, {} transfer zones, default server {:?}",
            self.routes.len(),
            self.transfers.len(),
            self.default_server
        );
        for (name, upstream) in &self.routes {
            debug!("  route {} -> {}", name, upstream);
        }
        for (zone, allowed) in &self.transfers {
            debug!("  transfer {} <- [{}]", zone, allowed.join(", "));
        }
    }
}

/// Normalize a domain name for table lookups: lowercase, fully qualified.
pub fn normalize_name(name: &str) -> String {
    let mut name = name.trim().to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}

/// Holds the active [`RoutingConfig`].
///
/// Readers take a snapshot (a cloned `Arc`) and release the lock right
/// away; the write lock is only held for the pointer swap.
pub struct ConfigStore {
    active: RwLock<Arc<RoutingConfig>>,
}

impl ConfigStore {
    pub fn new(config: RoutingConfig) -> Self {
        Self {
            active: RwLock::new(Arc::new(config)),
        }
    }

    /// Current configuration. Stays valid after a later [`replace`](Self::replace).
    pub fn snapshot(&self) -> Arc<RoutingConfig> {
        // The slot always holds a complete snapshot, so a poisoned lock
        // is still safe to read.
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install `config` as the active configuration.
    pub fn replace(&self, config: RoutingConfig) {
        let config = Arc::new(config);
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Load `path` and install it. The old configuration stays active if
    /// loading fails.
    pub fn reload(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let config = RoutingConfig::load(path)?;
        self.replace(config);
        Ok(())
    }
}
