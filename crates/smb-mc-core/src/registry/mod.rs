//! Connection registry
//!
//! Authoritative storage for connection entries, one per (client NIC,
//! server NIC) pairing ever found feasible. Entries are never destroyed by
//! a removal cycle: a torn-down channel returns to `Potential` so the
//! registry stays stable across reconnects. Entries are only dropped when
//! one of their NICs is purged from its inventory.
//!
//! ## Storage
//!
//! ```text
//!   entries     ConnectionId -> ConnectionEntry      (owning arena)
//!   by_pair     PairKey      -> ConnectionId         (uniqueness)
//!   by_client   NicIndex     -> {ConnectionId}       (per client NIC)
//!   successful  {ConnectionId}                       (connected entries)
//! ```
//!
//! The three indices are non-owning and only hold ids.
//!
//! ## Entry lifecycle
//!
//! ```text
//!   potential ──promote──▶ in_trial ──ok──▶ connected(inactive|active|inactive_redundant)
//!       ▲  │                  │
//!       │  └─infeasible─▶ no_potential
//!       │                     └─fail─▶ failed_to_connect ──recycle──▶ potential
//!       │
//!       └──finalize── in_removal ◀──removal── (in_trial | connected | failed_to_connect)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

use crate::candidate::Feasibility;
use crate::error::{Error, Result};
use crate::nic::NicIndex;
use crate::traits::TransportHandle;

/// Stable identity of a registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// (client NIC, server NIC) pairing
///
/// Ordering is by client index, then server index; the selector uses it
/// as the deterministic tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    pub client: NicIndex,
    pub server: NicIndex,
}

impl PairKey {
    pub const fn new(client: NicIndex, server: NicIndex) -> Self {
        Self { client, server }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client {} <-> server {}", self.client, self.server)
    }
}

/// Sub-state of a connected entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveState {
    /// Carrying traffic
    Active,
    /// Connected, not yet classified by the selector
    Inactive,
    /// Superseded by a faster channel sharing one of its NICs
    InactiveRedundant,
}

/// Lifecycle state of a connection entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Feasible, not attempted
    Potential,
    /// Infeasible until inventories change
    NoPotential,
    /// Connect attempt dispatched
    InTrial,
    /// Established
    Connected(ActiveState),
    /// Last attempt failed
    FailedToConnect,
    /// Being torn down
    InRemoval,
}

impl ConnectionState {
    /// States that still own (or are about to own) a transport
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ConnectionState::InTrial | ConnectionState::Connected(_) | ConnectionState::InRemoval
        )
    }

    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }
}

/// Outcome of a connect attempt as reported by the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Channel established
    Connected(TransportHandle),
    /// Attempt failed
    Failed,
}

/// One pairing tracked by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEntry {
    id: ConnectionId,
    pair: PairKey,
    speed: u64,
    feasibility: Feasibility,
    state: ConnectionState,
    transport: Option<TransportHandle>,
    attempt_in_flight: bool,
    last_attempt: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    retry_after: Option<DateTime<Utc>>,
}

impl ConnectionEntry {
    fn new(id: ConnectionId, pair: PairKey, speed: u64) -> Self {
        Self {
            id,
            pair,
            speed,
            feasibility: Feasibility::Feasible,
            state: ConnectionState::Potential,
            transport: None,
            attempt_in_flight: false,
            last_attempt: None,
            consecutive_failures: 0,
            retry_after: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn pair(&self) -> PairKey {
        self.pair
    }

    /// min(client NIC speed, server NIC speed)
    pub fn speed(&self) -> u64 {
        self.speed
    }

    pub fn feasibility(&self) -> Feasibility {
        self.feasibility
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Live transport, if established
    pub fn transport(&self) -> Option<TransportHandle> {
        self.transport
    }

    /// A connect attempt has been dispatched and not yet reported
    pub fn attempt_in_flight(&self) -> bool {
        self.attempt_in_flight
    }

    /// When the last connect attempt was dispatched
    pub fn last_attempt(&self) -> Option<DateTime<Utc>> {
        self.last_attempt
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Earliest time this entry may be promoted again
    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        self.retry_after
    }

    /// Whether `nic` is the client or server endpoint of this entry
    pub fn touches(&self, client: Option<NicIndex>, server: Option<NicIndex>) -> bool {
        client == Some(self.pair.client) || server == Some(self.pair.server)
    }

    fn transition(&mut self, state: ConnectionState) -> bool {
        if self.state == state {
            return false;
        }
        debug!("{} ({}): {:?} -> {:?}", self.id, self.pair, self.state, state);
        self.state = state;
        true
    }
}

/// Result of [`ConnectionRegistry::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New entry in `Potential`
    Created(ConnectionId),
    /// Speed, feasibility or state changed
    Updated(ConnectionId),
    /// Nothing changed
    Unchanged(ConnectionId),
    /// Entry became infeasible while live and was handed to the removal path
    RemovalRequested(ConnectionId),
    /// No entry exists and the pairing is infeasible
    Skipped,
}

impl UpsertOutcome {
    pub fn id(self) -> Option<ConnectionId> {
        match self {
            UpsertOutcome::Created(id)
            | UpsertOutcome::Updated(id)
            | UpsertOutcome::Unchanged(id)
            | UpsertOutcome::RemovalRequested(id) => Some(id),
            UpsertOutcome::Skipped => None,
        }
    }

    /// Whether the registry was modified
    pub fn changed(self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged(_) | UpsertOutcome::Skipped)
    }
}

/// Result of [`ConnectionRegistry::mark_for_removal`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// Already `InRemoval`
    AlreadyPending,
    /// Moved to `InRemoval`; the transport must be torn down
    TearDown(TransportHandle),
    /// Moved to `InRemoval`; waiting for an in-flight attempt to report
    AwaitingResult,
    /// Nothing to tear down; entry reset to `Potential` immediately
    Finalized,
    /// Entry holds no channel (`Potential`/`NoPotential`)
    NotApplicable,
}

/// Result of [`ConnectionRegistry::mark_result`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultDisposition {
    /// `InTrial -> Connected(Inactive)`
    Connected(ConnectionId),
    /// `InTrial -> FailedToConnect`
    Failed(ConnectionId),
    /// Channel came up for an entry already in removal; tear it down
    TearDown(ConnectionId, TransportHandle),
    /// Failed attempt for an entry in removal; entry reset to `Potential`
    Finalized(ConnectionId),
    /// No matching attempt; any established transport must be closed
    Stale(Option<TransportHandle>),
}

/// Connection registry
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    entries: BTreeMap<ConnectionId, ConnectionEntry>,
    by_pair: BTreeMap<PairKey, ConnectionId>,
    by_client: BTreeMap<NicIndex, BTreeSet<ConnectionId>>,
    successful: BTreeSet<ConnectionId>,
    next_id: u64,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile one candidate pairing
    pub fn upsert(&mut self, pair: PairKey, speed: u64, feasibility: Feasibility) -> UpsertOutcome {
        let existing = self.lookup(pair);
        let Some((id, entry)) = existing.and_then(|id| self.entries.get_mut(&id).map(|e| (id, e)))
        else {
            if !feasibility.is_feasible() {
                return UpsertOutcome::Skipped;
            }
            return UpsertOutcome::Created(self.create(pair, speed));
        };

        let mut changed = entry.speed != speed || entry.feasibility != feasibility;
        entry.speed = speed;
        entry.feasibility = feasibility;

        if feasibility.is_feasible() {
            if entry.state == ConnectionState::NoPotential {
                changed |= entry.transition(ConnectionState::Potential);
            }
        } else {
            let state = entry.state;
            match state {
                ConnectionState::Potential | ConnectionState::FailedToConnect => {
                    changed |= entry.transition(ConnectionState::NoPotential);
                }
                ConnectionState::InTrial | ConnectionState::Connected(_) => {
                    self.mark_for_removal(id);
                    return UpsertOutcome::RemovalRequested(id);
                }
                ConnectionState::NoPotential | ConnectionState::InRemoval => {}
            }
        }

        if changed {
            UpsertOutcome::Updated(id)
        } else {
            UpsertOutcome::Unchanged(id)
        }
    }

    fn create(&mut self, pair: PairKey, speed: u64) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        self.entries.insert(id, ConnectionEntry::new(id, pair, speed));
        self.by_pair.insert(pair, id);
        self.by_client.entry(pair.client).or_default().insert(id);
        debug!("{} created for {} ({} bps)", id, pair, speed);
        id
    }

    /// Id of the entry for `pair`, if any
    pub fn lookup(&self, pair: PairKey) -> Option<ConnectionId> {
        self.by_pair.get(&pair).copied()
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionEntry> {
        self.entries.get(&id)
    }

    pub fn get_by_pair(&self, pair: PairKey) -> Option<&ConnectionEntry> {
        self.lookup(pair).and_then(|id| self.entries.get(&id))
    }

    /// Entries whose client side is `nic`
    pub fn all_for_client_nic(&self, nic: NicIndex) -> impl Iterator<Item = &ConnectionEntry> {
        self.by_client
            .get(&nic)
            .into_iter()
            .flatten()
            .filter_map(|id| self.entries.get(id))
    }

    /// Connected entries
    pub fn all_successful(&self) -> impl Iterator<Item = &ConnectionEntry> {
        self.successful.iter().filter_map(|id| self.entries.get(id))
    }

    /// All entries in id order
    pub fn iter(&self) -> impl Iterator<Item = &ConnectionEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `Potential -> InTrial`
    pub(crate) fn begin_trial(&mut self, id: ConnectionId, now: DateTime<Utc>) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        if entry.state != ConnectionState::Potential {
            return false;
        }
        entry.transition(ConnectionState::InTrial);
        entry.attempt_in_flight = true;
        entry.last_attempt = Some(now);
        true
    }

    /// Record the outcome of a connect attempt
    pub fn mark_result(
        &mut self,
        pair: PairKey,
        outcome: ConnectOutcome,
        now: DateTime<Utc>,
    ) -> ResultDisposition {
        let handle = match outcome {
            ConnectOutcome::Connected(handle) => Some(handle),
            ConnectOutcome::Failed => None,
        };

        let Some(id) = self.lookup(pair) else {
            warn!("Connect result for unknown pairing {}", pair);
            return ResultDisposition::Stale(handle);
        };
        let Some(entry) = self.entries.get_mut(&id) else {
            return ResultDisposition::Stale(handle);
        };

        if !entry.attempt_in_flight {
            warn!("{} ({}): connect result with no attempt in flight", id, pair);
            return ResultDisposition::Stale(handle);
        }
        entry.attempt_in_flight = false;

        match (entry.state, outcome) {
            (ConnectionState::InTrial, ConnectOutcome::Connected(handle)) => {
                entry.transition(ConnectionState::Connected(ActiveState::Inactive));
                entry.transport = Some(handle);
                entry.consecutive_failures = 0;
                entry.retry_after = None;
                self.successful.insert(id);
                info!("Channel {} up ({})", pair, handle);
                ResultDisposition::Connected(id)
            }
            (ConnectionState::InTrial, ConnectOutcome::Failed) => {
                entry.transition(ConnectionState::FailedToConnect);
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                entry.last_attempt = Some(now);
                info!(
                    "Channel {} failed to connect ({} consecutive)",
                    pair, entry.consecutive_failures
                );
                ResultDisposition::Failed(id)
            }
            (ConnectionState::InRemoval, ConnectOutcome::Connected(handle)) => {
                entry.transport = Some(handle);
                warn!("Channel {} came up after removal, tearing down {}", pair, handle);
                ResultDisposition::TearDown(id, handle)
            }
            (ConnectionState::InRemoval, ConnectOutcome::Failed) => {
                entry.last_attempt = Some(now);
                self.reset(id);
                ResultDisposition::Finalized(id)
            }
            (state, _) => {
                warn!("{} ({}): connect result in unexpected state {:?}", id, pair, state);
                ResultDisposition::Stale(handle)
            }
        }
    }

    /// Move an entry to `InRemoval`. Idempotent.
    pub fn mark_for_removal(&mut self, id: ConnectionId) -> RemovalOutcome {
        let Some(entry) = self.entries.get_mut(&id) else {
            return RemovalOutcome::NotApplicable;
        };

        let state = entry.state;
        match state {
            ConnectionState::InRemoval => RemovalOutcome::AlreadyPending,
            ConnectionState::Potential | ConnectionState::NoPotential => {
                RemovalOutcome::NotApplicable
            }
            ConnectionState::InTrial
            | ConnectionState::Connected(_)
            | ConnectionState::FailedToConnect => {
                entry.transition(ConnectionState::InRemoval);
                self.successful.remove(&id);

                if let Some(handle) = entry.transport {
                    info!("Channel {} scheduled for removal", entry.pair);
                    RemovalOutcome::TearDown(handle)
                } else if entry.attempt_in_flight {
                    RemovalOutcome::AwaitingResult
                } else {
                    self.reset(id);
                    RemovalOutcome::Finalized
                }
            }
        }
    }

    /// `InRemoval -> Potential` once the transport is confirmed torn down
    pub fn finalize_removal(&mut self, pair: PairKey) -> Result<ConnectionId> {
        let id = self
            .lookup(pair)
            .ok_or_else(|| Error::not_found(format!("connection for {}", pair)))?;
        let entry = self
            .entries
            .get(&id)
            .ok_or_else(|| Error::not_found(format!("{} for {}", id, pair)))?;

        if entry.state != ConnectionState::InRemoval {
            return Err(Error::invalid_input(format!(
                "{} ({}) is {:?}, not in removal",
                id, pair, entry.state
            )));
        }
        if entry.attempt_in_flight {
            return Err(Error::invalid_input(format!(
                "{} ({}) still has a connect attempt in flight",
                id, pair
            )));
        }

        self.reset(id);
        Ok(id)
    }

    fn reset(&mut self, id: ConnectionId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.transition(ConnectionState::Potential);
            entry.transport = None;
            self.successful.remove(&id);
        }
    }

    /// Assign the sub-state of a connected entry
    pub(crate) fn set_active_state(&mut self, id: ConnectionId, active: ActiveState) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.state.is_connected() => {
                entry.transition(ConnectionState::Connected(active))
            }
            _ => false,
        }
    }

    /// `Potential | FailedToConnect -> NoPotential`
    pub(crate) fn mark_no_potential(&mut self, id: ConnectionId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry)
                if matches!(
                    entry.state,
                    ConnectionState::Potential | ConnectionState::FailedToConnect
                ) =>
            {
                entry.transition(ConnectionState::NoPotential)
            }
            _ => false,
        }
    }

    /// `FailedToConnect -> Potential`, not promotable before `retry_after`
    pub(crate) fn recycle_failed(
        &mut self,
        id: ConnectionId,
        retry_after: Option<DateTime<Utc>>,
    ) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.state == ConnectionState::FailedToConnect => {
                entry.retry_after = retry_after;
                entry.transition(ConnectionState::Potential)
            }
            _ => false,
        }
    }

    /// Drop every entry whose client or server NIC is `client`/`server`.
    ///
    /// Callers must ensure none of them is live.
    pub(crate) fn purge_nic(&mut self, client: Option<NicIndex>, server: Option<NicIndex>) -> usize {
        let doomed: Vec<ConnectionId> = self
            .entries
            .values()
            .filter(|e| e.touches(client, server))
            .map(|e| e.id)
            .collect();

        for id in &doomed {
            if let Some(entry) = self.entries.remove(id) {
                debug_assert!(!entry.state.is_live());
                self.by_pair.remove(&entry.pair);
                if let Some(set) = self.by_client.get_mut(&entry.pair.client) {
                    set.remove(id);
                    if set.is_empty() {
                        self.by_client.remove(&entry.pair.client);
                    }
                }
                self.successful.remove(id);
                debug!("{} ({}) dropped", id, entry.pair);
            }
        }
        doomed.len()
    }
}

/// Read-only view of one entry for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub id: ConnectionId,
    pub client_nic: NicIndex,
    pub server_nic: NicIndex,
    /// Bits per second
    pub speed: u64,
    pub state: ConnectionState,
    pub transport: Option<TransportHandle>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl From<&ConnectionEntry> for ChannelStatus {
    fn from(entry: &ConnectionEntry) -> Self {
        Self {
            id: entry.id,
            client_nic: entry.pair.client,
            server_nic: entry.pair.server,
            speed: entry.speed,
            state: entry.state,
            transport: entry.transport,
            last_attempt: entry.last_attempt,
            consecutive_failures: entry.consecutive_failures,
        }
    }
}
