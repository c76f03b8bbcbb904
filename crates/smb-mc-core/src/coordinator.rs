//! Update coordinator
//!
//! Single entry point for everything that changes multichannel state:
//! inventory deltas, administrative blacklist toggles, connect results
//! and transport teardown confirmations. Each entry point runs one
//! reconciliation cycle:
//!
//! ```text
//!   delta ──▶ inventory ──▶ candidate::generate ──▶ registry.upsert ──▶ selector.converge
//!                                                                            │
//!                                     purge vanished NICs ◀──────────────────┘
//!                                             │
//!                                             ▼
//!                                       Vec<Action>
//! ```
//!
//! The coordinator never performs I/O. It returns the [`Action`]s the
//! caller must dispatch to the transport once the exclusive section has
//! been released.
//!
//! If the selector fails to converge, the state is restored to the
//! checkpoint taken at the start of the operation and the error is
//! returned.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use tracing::{debug, info, warn};

use crate::candidate;
use crate::config::MultichannelConfig;
use crate::error::{Error, Result};
use crate::nic::{AddressFamily, NicIndex, NicInventory, Peer};
use crate::registry::{
    ChannelStatus, ConnectOutcome, ConnectionId, ConnectionRegistry, ConnectionState, PairKey,
    RemovalOutcome, ResultDisposition,
};
use crate::selector::{self, Selector, SelectorState};
use crate::traits::{ConnectRequest, NicChange, TransportHandle};

/// Transport work produced by a reconciliation cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open a channel and report the outcome via
    /// [`Coordinator::connection_result`]
    Connect(ConnectRequest),
    /// Close a channel and confirm via [`Coordinator::transport_closed`]
    Disconnect {
        pair: PairKey,
        handle: TransportHandle,
    },
}

impl Action {
    pub fn pair(&self) -> PairKey {
        match self {
            Action::Connect(request) => request.pair,
            Action::Disconnect { pair, .. } => *pair,
        }
    }
}

struct Checkpoint {
    client: NicInventory,
    server: NicInventory,
    registry: ConnectionRegistry,
    reconciled: Option<(u64, u64)>,
}

/// Per-entry facts compared across a cycle to derive actions
#[derive(Clone, Copy)]
struct Observed {
    state: ConnectionState,
    in_flight: bool,
}

/// Owner of both inventories and the connection registry
#[derive(Debug, Clone)]
pub struct Coordinator {
    client: NicInventory,
    server: NicInventory,
    registry: ConnectionRegistry,
    selector: Selector,
    blacklist: BTreeSet<NicIndex>,
    default_port: u16,
    /// Inventory generations the registry was last reconciled against
    reconciled: Option<(u64, u64)>,
    /// Set by [`Coordinator::shutdown`]; no further promotion
    draining: bool,
    /// Teardowns owed to the transport whose cycle failed to reconcile
    undelivered: Vec<Action>,
}

impl Coordinator {
    /// Create an empty coordinator from configuration.
    ///
    /// The static NIC lists of the configuration are not applied here; they
    /// reach the coordinator through a NIC source.
    pub fn new(config: &MultichannelConfig) -> Self {
        Self {
            client: NicInventory::new(Peer::Client),
            server: NicInventory::new(Peer::Server),
            registry: ConnectionRegistry::new(),
            selector: Selector::new(config.selector.clone()),
            blacklist: config
                .selector
                .blacklisted_client_nics
                .iter()
                .copied()
                .collect(),
            default_port: config.transport.default_port(),
            reconciled: None,
            draining: false,
            undelivered: Vec::new(),
        }
    }

    pub fn client_inventory(&self) -> &NicInventory {
        &self.client
    }

    pub fn server_inventory(&self) -> &NicInventory {
        &self.server
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Apply one inventory delta and reconcile
    pub fn apply(
        &mut self,
        peer: Peer,
        change: NicChange,
        now: DateTime<Utc>,
    ) -> Result<Vec<Action>> {
        self.guarded(now, |this| {
            this.apply_change(peer, &change);
            Ok(())
        })
    }

    /// Apply a batch of deltas with a single reconciliation
    pub fn apply_all(
        &mut self,
        changes: impl IntoIterator<Item = (Peer, NicChange)>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Action>> {
        let changes: Vec<(Peer, NicChange)> = changes.into_iter().collect();
        self.guarded(now, |this| {
            for (peer, change) in &changes {
                this.apply_change(*peer, change);
            }
            Ok(())
        })
    }

    fn apply_change(&mut self, peer: Peer, change: &NicChange) {
        let inventory = match peer {
            Peer::Client => &mut self.client,
            Peer::Server => &mut self.server,
        };

        match change {
            NicChange::Added(adv) => {
                inventory.add_nic(adv);
                if peer == Peer::Client
                    && self.blacklist.contains(&adv.index)
                    && let Err(e) = inventory.set_blacklisted(adv.index, true)
                {
                    warn!("Ignoring configured blacklist for NIC {}: {}", adv.index, e);
                }
            }
            NicChange::Removed(index) => {
                if let Err(e) = inventory.remove_nic(*index) {
                    warn!("Ignoring removal: {}", e);
                }
            }
            NicChange::LinkSpeed { index, speed } => {
                if let Err(e) = inventory.set_link_speed(*index, *speed) {
                    warn!("Ignoring link speed change: {}", e);
                }
            }
        }
    }

    /// Set or clear the administrative blacklist flag of a client NIC.
    ///
    /// The setting is remembered for NICs that are not currently known.
    pub fn set_blacklisted(
        &mut self,
        index: NicIndex,
        blacklisted: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<Action>> {
        self.guarded(now, |this| {
            if blacklisted {
                this.blacklist.insert(index);
            } else {
                this.blacklist.remove(&index);
            }
            if this.client.get(index).is_some() {
                this.client.set_blacklisted(index, blacklisted)?;
            }
            Ok(())
        })
    }

    /// Record the outcome of a dispatched connect attempt and reconcile.
    ///
    /// The outcome is kept even if the following reconciliation fails, so
    /// an established transport is never forgotten. A teardown owed for it
    /// is then held for [`Coordinator::take_undelivered`].
    pub fn connection_result(
        &mut self,
        pair: PairKey,
        outcome: ConnectOutcome,
        now: DateTime<Utc>,
    ) -> Result<Vec<Action>> {
        let disposition = self.registry.mark_result(pair, outcome, now);
        self.sync_nic_states();

        let mut actions = Vec::new();
        match disposition {
            ResultDisposition::TearDown(_, handle) | ResultDisposition::Stale(Some(handle)) => {
                actions.push(Action::Disconnect { pair, handle });
            }
            ResultDisposition::Connected(_)
            | ResultDisposition::Failed(_)
            | ResultDisposition::Finalized(_)
            | ResultDisposition::Stale(None) => {}
        }

        match self.guarded(now, |_| Ok(())) {
            Ok(follow_up) => {
                actions.extend(follow_up);
                Ok(actions)
            }
            Err(e) => {
                self.undelivered.extend(actions);
                Err(e)
            }
        }
    }

    /// Drain teardowns that a failed reconciliation could not return
    pub fn take_undelivered(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.undelivered)
    }

    /// Confirm that the transport of an entry in removal is gone
    pub fn transport_closed(&mut self, pair: PairKey, now: DateTime<Utc>) -> Result<Vec<Action>> {
        self.guarded(now, |this| {
            let id = this.registry.finalize_removal(pair)?;
            debug!("{} ({}) removal finalized", id, pair);
            this.sync_nic_states();
            Ok(())
        })
    }

    /// A connected channel dropped without being asked to.
    ///
    /// The entry moves to `in_removal` and its transport is handed back for
    /// release; [`Coordinator::transport_closed`] returns it to `potential`.
    /// The redundancy pass re-activates the best surviving channel meanwhile.
    pub fn transport_lost(&mut self, pair: PairKey, now: DateTime<Utc>) -> Result<Vec<Action>> {
        let mut release = None;
        let mut actions = self.guarded(now, |this| {
            let entry = this
                .registry
                .get_by_pair(pair)
                .ok_or_else(|| Error::not_found(format!("connection for {}", pair)))?;
            if !entry.state().is_connected() {
                warn!("Ignoring loss of {} in state {:?}", pair, entry.state());
                return Ok(());
            }

            let id = entry.id();
            info!("Channel {} lost", pair);
            if let RemovalOutcome::TearDown(handle) = this.registry.mark_for_removal(id) {
                release = Some(Action::Disconnect { pair, handle });
            }
            this.sync_nic_states();
            Ok(())
        })?;

        if let Some(action) = release {
            actions.insert(0, action);
        }
        Ok(actions)
    }

    /// Move every live entry to removal and return the teardowns needed.
    ///
    /// No new attempts are promoted afterwards; attempts still in flight
    /// are torn down when their result arrives.
    pub fn shutdown(&mut self) -> Vec<Action> {
        self.draining = true;
        let live: Vec<_> = self
            .registry
            .iter()
            .filter(|e| e.state().is_live() || e.state() == ConnectionState::FailedToConnect)
            .map(|e| (e.id(), e.pair()))
            .collect();

        let mut actions = Vec::new();
        for (id, pair) in live {
            if let RemovalOutcome::TearDown(handle) = self.registry.mark_for_removal(id) {
                actions.push(Action::Disconnect { pair, handle });
            }
        }
        self.sync_nic_states();
        info!("Shutdown: {} channel(s) to tear down", actions.len());
        actions
    }

    /// Run one reconciliation cycle without any new input
    pub fn reconcile(&mut self, now: DateTime<Utc>) -> Result<Vec<Action>> {
        self.guarded(now, |_| Ok(()))
    }

    /// Earliest future time at which a backed-off entry becomes promotable
    pub fn next_retry_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.registry
            .iter()
            .filter(|e| e.state() == ConnectionState::Potential)
            .filter_map(|e| e.retry_after())
            .filter(|at| *at > now)
            .min()
    }

    /// Status of every entry whose client side is `nic`
    pub fn channels_for_client_nic(&self, nic: NicIndex) -> Vec<ChannelStatus> {
        self.registry
            .all_for_client_nic(nic)
            .map(ChannelStatus::from)
            .collect()
    }

    /// Status of every connected entry
    pub fn successful_channels(&self) -> Vec<ChannelStatus> {
        self.registry.all_successful().map(ChannelStatus::from).collect()
    }

    /// Status of every entry
    pub fn all_channels(&self) -> Vec<ChannelStatus> {
        self.registry.iter().map(ChannelStatus::from).collect()
    }

    /// Run `mutate` then reconcile; restore everything on failure
    fn guarded<F>(&mut self, now: DateTime<Utc>, mutate: F) -> Result<Vec<Action>>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let checkpoint = self.checkpoint();
        let result = match mutate(self) {
            Ok(()) => self.run_cycle(now),
            Err(e) => Err(e),
        };

        if result.is_err() {
            self.restore(checkpoint);
        }
        result
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            client: self.client.clone(),
            server: self.server.clone(),
            registry: self.registry.clone(),
            reconciled: self.reconciled,
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        warn!("Restoring last stable multichannel state");
        self.client = checkpoint.client;
        self.server = checkpoint.server;
        self.registry = checkpoint.registry;
        self.reconciled = checkpoint.reconciled;
    }

    fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<Vec<Action>> {
        let before: BTreeMap<_, Observed> = self
            .registry
            .iter()
            .map(|e| {
                (
                    e.id(),
                    Observed {
                        state: e.state(),
                        in_flight: e.attempt_in_flight(),
                    },
                )
            })
            .collect();

        if self.draining {
            return Ok(self.derive_actions(&before, now));
        }

        if self.reconciled != Some(self.generations()) {
            self.regenerate();
        }

        let mut state = SelectorState {
            client: &mut self.client,
            server: &mut self.server,
            registry: &mut self.registry,
        };
        self.selector.converge(&mut state, now)?;

        self.purge_vanished();
        self.reconciled = Some(self.generations());

        Ok(self.derive_actions(&before, now))
    }

    fn generations(&self) -> (u64, u64) {
        (self.client.generation(), self.server.generation())
    }

    fn regenerate(&mut self) {
        let candidates = candidate::generate(&self.client, &self.server, &self.registry);
        let mut changed = 0;
        for cand in &candidates {
            if self
                .registry
                .upsert(cand.pair, cand.speed, cand.feasibility)
                .changed()
            {
                changed += 1;
            }
        }
        debug!(
            "Regenerated {} candidate(s), {} registry change(s)",
            candidates.len(),
            changed
        );
    }

    /// Drop disconnected NICs that no live entry references any more
    fn purge_vanished(&mut self) {
        for peer in [Peer::Client, Peer::Server] {
            let inventory = match peer {
                Peer::Client => &self.client,
                Peer::Server => &self.server,
            };
            let vanished: Vec<NicIndex> = inventory
                .iter()
                .filter(|nic| nic.is_disconnected())
                .map(|nic| nic.index())
                .collect();

            for index in vanished {
                let (client, server) = match peer {
                    Peer::Client => (Some(index), None),
                    Peer::Server => (None, Some(index)),
                };
                let still_live = self
                    .registry
                    .iter()
                    .any(|e| e.touches(client, server) && e.state().is_live());
                if still_live {
                    continue;
                }

                let dropped = self.registry.purge_nic(client, server);
                match peer {
                    Peer::Client => self.client.purge(index),
                    Peer::Server => self.server.purge(index),
                };
                info!("{} NIC {} forgotten, {} entries dropped", peer, index, dropped);
            }
        }
    }

    fn derive_actions(
        &mut self,
        before: &BTreeMap<ConnectionId, Observed>,
        now: DateTime<Utc>,
    ) -> Vec<Action> {
        let mut connects = Vec::new();
        let mut actions = Vec::new();

        for entry in self.registry.iter() {
            let prior = before.get(&entry.id());

            if entry.attempt_in_flight() && !prior.is_some_and(|p| p.in_flight) {
                connects.push(entry.pair());
            }

            if entry.state() == ConnectionState::InRemoval
                && !prior.is_some_and(|p| p.state == ConnectionState::InRemoval)
            {
                if let Some(handle) = entry.transport() {
                    actions.push(Action::Disconnect {
                        pair: entry.pair(),
                        handle,
                    });
                }
            }
        }

        let mut unroutable = 0;
        for pair in connects {
            match self.connect_request(pair) {
                Some(request) => actions.push(Action::Connect(request)),
                None => {
                    warn!("No usable address for {}, failing attempt", pair);
                    self.registry.mark_result(pair, ConnectOutcome::Failed, now);
                    unroutable += 1;
                }
            }
        }
        if unroutable > 0 {
            self.sync_nic_states();
        }

        actions
    }

    /// Pick the addresses for a promoted pairing.
    ///
    /// Preferred shared family first, lowest address of that family,
    /// advertised port 0 replaced by the default port.
    pub fn connect_request(&self, pair: PairKey) -> Option<ConnectRequest> {
        let client = self.client.get(pair.client)?;
        let server = self.server.get(pair.server)?;
        let shared = client.families().intersection(server.families());

        let family = if self.selector.config().prefer_ipv6 && shared.contains(AddressFamily::V6) {
            AddressFamily::V6
        } else if shared.contains(AddressFamily::V4) {
            AddressFamily::V4
        } else if shared.contains(AddressFamily::V6) {
            AddressFamily::V6
        } else {
            return None;
        };

        let mut server_address: SocketAddr = server.first_address(family)?;
        if server_address.port() == 0 {
            server_address.set_port(self.default_port);
        }
        let local_address = client.first_address(family).map(|mut addr| {
            addr.set_port(0);
            addr
        });

        Some(ConnectRequest {
            pair,
            client_nic: pair.client,
            local_address,
            server_address,
        })
    }

    fn sync_nic_states(&mut self) {
        let mut state = SelectorState {
            client: &mut self.client,
            server: &mut self.server,
            registry: &mut self.registry,
        };
        selector::sync_nic_states(&mut state);
    }
}
