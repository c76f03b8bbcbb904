//! Plugin registry
//!
//! Transports and NIC sources register factories under a name so the
//! daemon can build them from configuration without hard-coded branching.
//!
//! ## Registration
//!
//! Plugin crates expose a `register` function:
//!
//! ```rust,ignore
//! // In smb-mc-transport-tcp
//! pub fn register(registry: &PluginRegistry) {
//!     registry.register_transport("tcp", Box::new(TcpTransportFactory));
//! }
//! ```

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::nic::NicAdvertisement;
use crate::source::StaticNicSourceFactory;
use crate::traits::{NicSource, NicSourceFactory, Transport, TransportFactory};

/// Name → factory registry for transports and NIC sources
///
/// ## Thread Safety
///
/// The registry uses interior mutability with RwLock, allowing concurrent
/// reads and exclusive writes.
#[derive(Default)]
pub struct PluginRegistry {
    transports: RwLock<HashMap<String, Box<dyn TransportFactory>>>,
    nic_sources: RwLock<HashMap<String, Box<dyn NicSourceFactory>>>,
}

impl PluginRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `static` NIC source
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_nic_source("static", Box::new(StaticNicSourceFactory));
        registry
    }

    /// Register a transport factory under `name` (e.g. "tcp")
    pub fn register_transport(&self, name: impl Into<String>, factory: Box<dyn TransportFactory>) {
        let mut transports = self
            .transports
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        transports.insert(name.into(), factory);
    }

    /// Register a NIC source factory under `name` (e.g. "static")
    pub fn register_nic_source(&self, name: impl Into<String>, factory: Box<dyn NicSourceFactory>) {
        let mut sources = self
            .nic_sources
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        sources.insert(name.into(), factory);
    }

    /// Create a transport from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn Transport>)`: Created transport instance
    /// - `Err(Error)`: If the transport type is not registered or creation fails
    pub fn create_transport(&self, config: &TransportConfig) -> Result<Box<dyn Transport>> {
        let transport_type = config.type_name();
        let transports = self
            .transports
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let factory = transports
            .get(transport_type)
            .ok_or_else(|| Error::config(format!("Unknown transport type: {}", transport_type)))?;

        factory.create(config)
    }

    /// Create a NIC source of type `name` serving `nics`
    pub fn create_nic_source(
        &self,
        name: &str,
        nics: &[NicAdvertisement],
    ) -> Result<Box<dyn NicSource>> {
        let sources = self
            .nic_sources
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let factory = sources
            .get(name)
            .ok_or_else(|| Error::config(format!("Unknown NIC source type: {}", name)))?;

        factory.create(nics)
    }

    /// Registered transport names, sorted
    pub fn list_transports(&self) -> Vec<String> {
        let transports = self
            .transports
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = transports.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered NIC source names, sorted
    pub fn list_nic_sources(&self) -> Vec<String> {
        let sources = self
            .nic_sources
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = sources.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_transport(&self, name: &str) -> bool {
        self.transports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn has_nic_source(&self, name: &str) -> bool {
        self.nic_sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}
