// # Static NIC Source
//
// In-memory implementation of NicSource.
//
// ## Purpose
//
// Serves a NIC list taken from configuration and lets the embedding
// application push changes through a [`StaticNicHandle`]. The daemon uses
// it for both peers when no discovery plugin is configured; tests use it to
// script inventory changes.
//
// ## Ordering
//
// Changes pushed through a handle are queued until the engine calls
// `watch()`, so nothing is lost between `snapshot()` and `watch()`.
// Re-applying a queued change that the snapshot already reflects is a
// no-op for the inventory.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::warn;

use crate::Error;
use crate::nic::{NicAdvertisement, NicIndex};
use crate::traits::{NicChange, NicSource, NicSourceFactory};

type Inventory = Arc<RwLock<BTreeMap<NicIndex, NicAdvertisement>>>;

/// In-memory NIC source
///
/// # Example
///
/// ```rust,no_run
/// use smb_mc_core::nic::NicAdvertisement;
/// use smb_mc_core::source::StaticNicSource;
/// use smb_mc_core::traits::NicSource;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let source = StaticNicSource::new(vec![NicAdvertisement::new(
///         1,
///         1_000_000_000,
///         vec!["10.0.0.1:0".parse()?],
///     )]);
///     let handle = source.handle();
///
///     handle.remove(1).await;
///     assert!(source.snapshot().await?.is_empty());
///
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct StaticNicSource {
    inner: Inventory,
    tx: mpsc::UnboundedSender<NicChange>,
    rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<NicChange>>>,
}

impl StaticNicSource {
    /// Create a source serving `nics`
    pub fn new(nics: Vec<NicAdvertisement>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = nics.into_iter().map(|adv| (adv.index, adv)).collect();
        Self {
            inner: Arc::new(RwLock::new(inner)),
            tx,
            rx: std::sync::Mutex::new(Some(rx)),
        }
    }

    /// Handle for pushing inventory changes
    pub fn handle(&self) -> StaticNicHandle {
        StaticNicHandle {
            inner: Arc::clone(&self.inner),
            tx: self.tx.clone(),
        }
    }

    /// Number of NICs currently served
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

impl Default for StaticNicSource {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl NicSource for StaticNicSource {
    async fn snapshot(&self) -> Result<Vec<NicAdvertisement>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.values().cloned().collect())
    }

    fn watch(&self) -> Pin<Box<dyn Stream<Item = NicChange> + Send + 'static>> {
        let rx = match self.rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        match rx {
            Some(rx) => Box::pin(UnboundedReceiverStream::new(rx)),
            None => {
                warn!("StaticNicSource watched twice, second stream is empty");
                Box::pin(tokio_stream::empty())
            }
        }
    }

    fn source_name(&self) -> &'static str {
        "static"
    }
}

/// Pushes changes into a [`StaticNicSource`]
#[derive(Debug, Clone)]
pub struct StaticNicHandle {
    inner: Inventory,
    tx: mpsc::UnboundedSender<NicChange>,
}

impl StaticNicHandle {
    /// Advertise a new NIC or re-advertise a known one
    pub async fn add(&self, adv: NicAdvertisement) {
        self.inner.write().await.insert(adv.index, adv.clone());
        self.send(NicChange::Added(adv));
    }

    /// Withdraw a NIC
    pub async fn remove(&self, index: NicIndex) {
        self.inner.write().await.remove(&index);
        self.send(NicChange::Removed(index));
    }

    /// Change the link speed of a NIC
    pub async fn set_link_speed(&self, index: NicIndex, speed: u64) {
        if let Some(adv) = self.inner.write().await.get_mut(&index) {
            adv.speed = speed;
        }
        self.send(NicChange::LinkSpeed { index, speed });
    }

    fn send(&self, change: NicChange) {
        // Receiver only goes away with the source
        let _ = self.tx.send(change);
    }
}

/// Builds [`StaticNicSource`]s from configured NIC lists
pub struct StaticNicSourceFactory;

impl NicSourceFactory for StaticNicSourceFactory {
    fn create(&self, nics: &[NicAdvertisement]) -> Result<Box<dyn NicSource>, Error> {
        Ok(Box::new(StaticNicSource::new(nics.to_vec())))
    }
}
