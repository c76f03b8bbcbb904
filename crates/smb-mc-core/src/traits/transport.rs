// # Transport Trait
//
// Defines the boundary to the per-connection I/O layer.
//
// ## Implementations
//
// - TCP: `smb-mc-transport-tcp` crate
// - Future: RDMA (SMB Direct), QUIC
//
// ## Usage
//
// ```rust,ignore
// use smb_mc_core::traits::{ConnectRequest, Transport};
//
// let handle = transport.connect(&request).await?;
// // ... channel is used by the session layer ...
// transport.disconnect(handle).await?;
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

use crate::nic::NicIndex;
use crate::registry::PairKey;

/// Opaque reference to a live transport object owned by the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportHandle(u64);

impl TransportHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport#{}", self.0)
    }
}

/// Everything the transport needs to open one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Pairing being attempted
    pub pair: PairKey,
    /// Local interface to bind to
    pub client_nic: NicIndex,
    /// Local address of the client NIC in the chosen family, if known
    pub local_address: Option<SocketAddr>,
    /// Server address to connect to
    pub server_address: SocketAddr,
}

/// Trait for transport implementations
///
/// The transport opens and closes channels. It never decides which
/// channels should exist; that is owned by the selector.
///
/// # Forbidden
///
/// - Retrying a failed connect (the selector re-promotes the pairing)
/// - Calling back into the coordinator directly (the engine funnels results)
/// - Blocking the caller's thread
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a channel. One attempt, no retry.
    async fn connect(&self, request: &ConnectRequest) -> Result<TransportHandle, crate::Error>;

    /// Tear a channel down. Must succeed for handles that are already gone.
    async fn disconnect(&self, handle: TransportHandle) -> Result<(), crate::Error>;

    /// Transport name (for logging)
    fn transport_name(&self) -> &'static str;
}

/// Helper trait for constructing transports from configuration
pub trait TransportFactory: Send + Sync {
    /// Create a Transport instance from configuration
    fn create(
        &self,
        config: &crate::config::TransportConfig,
    ) -> Result<Box<dyn Transport>, crate::Error>;
}
