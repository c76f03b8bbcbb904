//! Multichannel engine
//!
//! The MultichannelEngine is responsible for:
//! - Seeding both NIC inventories from their sources
//! - Funnelling inventory changes and connect results into the coordinator
//! - Dispatching connect/disconnect work to the transport
//! - Tearing every channel down on shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │ client NICs  │   │ server NICs  │
//! └──────┬───────┘   └──────┬───────┘
//!        └──── NicChange ───┤
//!                           ▼
//!              ┌─────────────────────────┐
//!              │ Mutex<Coordinator>      │◀──── Completion ─────┐
//!              └────────────┬────────────┘                      │
//!                           │ Vec<Action> (lock released)       │
//!                           ▼                                   │
//!              ┌─────────────────────────┐                      │
//!              │ spawned transport tasks │──────────────────────┘
//!              └─────────────────────────┘
//! ```
//!
//! ## Exclusive section
//!
//! Every coordinator call happens under one `tokio::sync::Mutex`. The
//! guard is always dropped before a transport call is made; results come
//! back as [`Completion`]s on an internal channel and re-enter the
//! coordinator under the lock.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::config::MultichannelConfig;
use crate::coordinator::{Action, Coordinator};
use crate::error::{Error, Result};
use crate::nic::{NicIndex, Peer};
use crate::registry::{ChannelStatus, ConnectOutcome, PairKey};
use crate::traits::{NicChange, NicSource, Transport, TransportHandle};

/// Events emitted by the MultichannelEngine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Engine started with the given inventory sizes
    Started {
        client_nics: usize,
        server_nics: usize,
    },

    /// A NIC source reported a change
    NicChanged { peer: Peer, index: NicIndex },

    /// Connect attempt dispatched
    ConnectStarted { pair: PairKey },

    /// Channel established
    ChannelUp {
        pair: PairKey,
        handle: TransportHandle,
    },

    /// Connect attempt failed
    ConnectFailed { pair: PairKey, error: String },

    /// Channel torn down
    ChannelDown { pair: PairKey },

    /// Reconciliation rolled back
    ReconcileFailed { error: String },

    /// Engine stopped
    Stopped { reason: String },
}

/// Work reported back to the engine loop
#[derive(Debug)]
enum Completion {
    Connect {
        pair: PairKey,
        outcome: ConnectOutcome,
        error: Option<String>,
    },
    Closed {
        pair: PairKey,
    },
    Lost {
        pair: PairKey,
    },
}

/// Core multichannel engine
///
/// ## Lifecycle
///
/// 1. Create with [`MultichannelEngine::new()`]
/// 2. Start with [`MultichannelEngine::run()`]
/// 3. Engine runs until shutdown signal received
/// 4. Every channel is torn down before `run()` returns
pub struct MultichannelEngine {
    client_source: Box<dyn NicSource>,
    server_source: Box<dyn NicSource>,
    transport: Arc<dyn Transport>,
    coordinator: Arc<Mutex<Coordinator>>,
    event_tx: mpsc::Sender<EngineEvent>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: Mutex<Option<mpsc::UnboundedReceiver<Completion>>>,
    /// Spawned transport operations not yet reported back
    in_flight: AtomicUsize,
    shutdown_grace: Duration,
}

impl MultichannelEngine {
    /// Create a new engine
    ///
    /// # Returns
    ///
    /// A tuple of (engine, event_receiver) where event_receiver yields engine events
    pub fn new(
        client_source: Box<dyn NicSource>,
        server_source: Box<dyn NicSource>,
        transport: Box<dyn Transport>,
        config: MultichannelConfig,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.engine.event_channel_capacity);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        if !config.engine.metadata.is_empty() {
            debug!("Engine metadata: {:?}", config.engine.metadata);
        }

        let engine = Self {
            client_source,
            server_source,
            transport: Arc::from(transport),
            coordinator: Arc::new(Mutex::new(Coordinator::new(&config))),
            event_tx: tx,
            completion_tx,
            completion_rx: Mutex::new(Some(completion_rx)),
            in_flight: AtomicUsize::new(0),
            shutdown_grace: Duration::from_millis(config.engine.shutdown_grace_ms),
        };

        Ok((engine, rx))
    }

    /// Run the engine until SIGINT/SIGTERM
    pub async fn run(&self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run the engine until `shutdown_rx` fires
    ///
    /// Used by embedders and tests that own the shutdown decision.
    pub async fn run_with_shutdown(
        &self,
        shutdown_rx: Option<tokio::sync::oneshot::Receiver<()>>,
    ) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(
        &self,
        shutdown_rx: Option<tokio::sync::oneshot::Receiver<()>>,
    ) -> Result<()> {
        let mut completions = self
            .completion_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Other("Engine is already running".to_string()))?;

        let client_nics = self.client_source.snapshot().await?;
        let server_nics = self.server_source.snapshot().await?;
        info!(
            "Initial inventories: {} client NIC(s) from {}, {} server NIC(s) from {}",
            client_nics.len(),
            self.client_source.source_name(),
            server_nics.len(),
            self.server_source.source_name()
        );
        self.emit_event(EngineEvent::Started {
            client_nics: client_nics.len(),
            server_nics: server_nics.len(),
        });

        let seed = client_nics
            .into_iter()
            .map(|adv| (Peer::Client, NicChange::Added(adv)))
            .chain(
                server_nics
                    .into_iter()
                    .map(|adv| (Peer::Server, NicChange::Added(adv))),
            );
        let actions = self.coordinator.lock().await.apply_all(seed, Utc::now());
        self.after_reconcile(actions);

        let client_stream = self.client_source.watch().map(|c| (Peer::Client, c));
        let server_stream = self.server_source.watch().map(|c| (Peer::Server, c));
        let mut nic_events = client_stream.merge(server_stream);

        let shutdown = async move {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        };
        tokio::pin!(shutdown);

        loop {
            let retry_in = self
                .coordinator
                .lock()
                .await
                .next_retry_at(Utc::now())
                .map(|at| (at - Utc::now()).to_std().unwrap_or_default());

            tokio::select! {
                Some((peer, change)) = nic_events.next() => {
                    self.emit_event(EngineEvent::NicChanged { peer, index: change.index() });
                    let actions = self
                        .coordinator
                        .lock()
                        .await
                        .apply(peer, change, Utc::now());
                    self.after_reconcile(actions);
                }

                Some(done) = completions.recv() => {
                    let actions = self.handle_completion(done).await;
                    self.after_reconcile(actions);
                }

                _ = tokio::time::sleep(retry_in.unwrap_or_default()), if retry_in.is_some() => {
                    debug!("Retry backoff elapsed");
                    let actions = self.coordinator.lock().await.reconcile(Utc::now());
                    self.after_reconcile(actions);
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        let actions = self.coordinator.lock().await.shutdown();
        self.dispatch(actions);

        let drained =
            tokio::time::timeout(self.shutdown_grace, self.drain(&mut completions)).await;
        if drained.is_err() {
            warn!(
                "{} transport operation(s) still pending after {:?}",
                self.in_flight.load(Ordering::SeqCst),
                self.shutdown_grace
            );
        }

        self.emit_event(EngineEvent::Stopped {
            reason: "Shutdown signal".to_string(),
        });
        info!("All channels released, engine stopped");

        Ok(())
    }

    async fn drain(&self, completions: &mut mpsc::UnboundedReceiver<Completion>) {
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            let Some(done) = completions.recv().await else {
                break;
            };
            let actions = self.handle_completion(done).await;
            self.after_reconcile(actions);
        }
    }

    async fn handle_completion(&self, done: Completion) -> Result<Vec<Action>> {
        if !matches!(done, Completion::Lost { .. }) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        let now = Utc::now();
        let (actions, undelivered) = {
            let mut co = self.coordinator.lock().await;
            let actions = self.complete(&mut co, done, now);
            (actions, co.take_undelivered())
        };

        // Owed teardowns go out even when the cycle rolled back
        self.dispatch(undelivered);
        actions
    }

    fn complete(
        &self,
        co: &mut Coordinator,
        done: Completion,
        now: DateTime<Utc>,
    ) -> Result<Vec<Action>> {
        match done {
            Completion::Connect {
                pair,
                outcome,
                error,
            } => {
                let actions = co.connection_result(pair, outcome, now);
                match outcome {
                    ConnectOutcome::Connected(handle) => {
                        let up = co.registry().get_by_pair(pair).is_some_and(|e| {
                            e.transport() == Some(handle) && e.state().is_connected()
                        });
                        if up {
                            self.emit_event(EngineEvent::ChannelUp { pair, handle });
                        }
                    }
                    ConnectOutcome::Failed => {
                        self.emit_event(EngineEvent::ConnectFailed {
                            pair,
                            error: error.unwrap_or_else(|| "connect failed".to_string()),
                        });
                    }
                }
                actions
            }
            Completion::Closed { pair } => match co.transport_closed(pair, now) {
                Ok(actions) => {
                    self.emit_event(EngineEvent::ChannelDown { pair });
                    Ok(actions)
                }
                Err(Error::NotFound(_)) | Err(Error::InvalidInput(_)) => {
                    // Stale result teardown, no entry owned the handle
                    debug!("Closed transport for {} had no pending removal", pair);
                    Ok(Vec::new())
                }
                Err(e) => Err(e),
            },
            // Reported as down once the transport is released
            Completion::Lost { pair } => match co.transport_lost(pair, now) {
                Err(Error::NotFound(_)) => {
                    debug!("Loss reported for unknown channel {}", pair);
                    Ok(Vec::new())
                }
                other => other,
            },
        }
    }

    /// Dispatch reconciliation output, or report the rollback
    fn after_reconcile(&self, actions: Result<Vec<Action>>) {
        match actions {
            Ok(actions) => self.dispatch(actions),
            Err(e) => {
                error!("Reconciliation failed: {}", e);
                self.emit_event(EngineEvent::ReconcileFailed {
                    error: e.to_string(),
                });
            }
        }
    }

    /// Hand actions to the transport. Never called with the lock held.
    fn dispatch(&self, actions: Vec<Action>) {
        for action in actions {
            let transport = Arc::clone(&self.transport);
            let tx = self.completion_tx.clone();
            self.in_flight.fetch_add(1, Ordering::SeqCst);

            match action {
                Action::Connect(request) => {
                    debug!(
                        "Connecting {} via {} to {}",
                        request.pair,
                        transport.transport_name(),
                        request.server_address
                    );
                    self.emit_event(EngineEvent::ConnectStarted { pair: request.pair });
                    tokio::spawn(async move {
                        let (outcome, error) = match transport.connect(&request).await {
                            Ok(handle) => (ConnectOutcome::Connected(handle), None),
                            Err(e) => {
                                warn!("Connect {} failed: {}", request.pair, e);
                                (ConnectOutcome::Failed, Some(e.to_string()))
                            }
                        };
                        let _ = tx.send(Completion::Connect {
                            pair: request.pair,
                            outcome,
                            error,
                        });
                    });
                }
                Action::Disconnect { pair, handle } => {
                    debug!("Disconnecting {} ({})", pair, handle);
                    tokio::spawn(async move {
                        if let Err(e) = transport.disconnect(handle).await {
                            warn!("Disconnect of {} ({}) failed: {}", pair, handle, e);
                        }
                        let _ = tx.send(Completion::Closed { pair });
                    });
                }
            }
        }
    }

    /// Report that a connected channel dropped on its own
    ///
    /// Called by the session layer when it notices a dead channel. Takes
    /// effect on the engine loop.
    pub fn report_channel_lost(&self, pair: PairKey) {
        if self.completion_tx.send(Completion::Lost { pair }).is_err() {
            warn!("Engine loop gone, dropping loss report for {}", pair);
        }
    }

    /// Status of every connection entry
    pub async fn channels(&self) -> Vec<ChannelStatus> {
        self.coordinator.lock().await.all_channels()
    }

    /// Status of every connected channel
    pub async fn successful_channels(&self) -> Vec<ChannelStatus> {
        self.coordinator.lock().await.successful_channels()
    }

    /// Status of every entry whose client side is `nic`
    pub async fn channels_for_client_nic(&self, nic: NicIndex) -> Vec<ChannelStatus> {
        self.coordinator.lock().await.channels_for_client_nic(nic)
    }

    /// Set or clear the blacklist flag of a client NIC
    pub async fn set_blacklisted(&self, index: NicIndex, blacklisted: bool) -> Result<()> {
        let actions = self
            .coordinator
            .lock()
            .await
            .set_blacklisted(index, blacklisted, Utc::now())?;
        self.dispatch(actions);
        Ok(())
    }

    fn emit_event(&self, event: EngineEvent) {
        if self.event_tx.try_send(event).is_err() {
            warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
        }
    }
}
