// # NIC Source Trait
//
// Defines the boundary to the NIC discovery layer.
//
// A source reports the interfaces of ONE peer: either the local host
// (client) or the connected file server. The engine takes one source per
// peer and merges their event streams.
//
// ## Implementations
//
// - In-memory / configuration-driven: `StaticNicSource` (this crate)
// - Future: netlink/route-socket discovery for the client side,
//   periodic FSCTL queries for the server side

use async_trait::async_trait;
use std::pin::Pin;
use tokio_stream::Stream;

use crate::nic::{NicAdvertisement, NicIndex};

/// A single inventory delta
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NicChange {
    /// NIC appeared or was re-advertised
    Added(NicAdvertisement),
    /// NIC vanished
    Removed(NicIndex),
    /// Link speed changed
    LinkSpeed {
        index: NicIndex,
        /// Bits per second
        speed: u64,
    },
}

impl NicChange {
    /// Interface the change applies to
    pub fn index(&self) -> NicIndex {
        match self {
            NicChange::Added(adv) => adv.index,
            NicChange::Removed(index) => *index,
            NicChange::LinkSpeed { index, .. } => *index,
        }
    }
}

/// Trait for NIC discovery implementations
///
/// Sources are observers: they report what exists, never which channels
/// to open.
#[async_trait]
pub trait NicSource: Send + Sync {
    /// Current interfaces, returned without waiting for changes
    async fn snapshot(&self) -> Result<Vec<NicAdvertisement>, crate::Error>;

    /// Stream of inventory deltas.
    ///
    /// Must be cancellation-safe. The stream may end; the engine keeps
    /// running on the other source.
    fn watch(&self) -> Pin<Box<dyn Stream<Item = NicChange> + Send + 'static>>;

    /// Source name (for logging)
    fn source_name(&self) -> &'static str;
}

/// Helper trait for constructing NIC sources from configuration
pub trait NicSourceFactory: Send + Sync {
    /// Create a NicSource from the advertisements listed in configuration
    fn create(
        &self,
        nics: &[NicAdvertisement],
    ) -> Result<Box<dyn NicSource>, crate::Error>;
}
