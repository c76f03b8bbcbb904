//! Selector / balancer
//!
//! Policy engine run after every inventory change and every connect
//! result. One pass performs, in order:
//!
//! 0. **Recycling**: `failed_to_connect` entries return to `potential`,
//!    stamped with a retry time when backoff is configured.
//! 1. **Redundancy detection**: connected entries are ranked by speed
//!    (descending) then pair identity (ascending). Walking that order, an
//!    entry whose NICs are both unclaimed becomes `active` and claims
//!    them; any other becomes `inactive_redundant`.
//! 2. **Promotion**: the best `potential` entries are moved to
//!    `in_trial`, at most `max_channels` live channels overall and never
//!    two picks sharing a NIC in the same pass.
//! 3. **Demotion**: entries touching a disconnected NIC, or classified
//!    infeasible, leave service: live ones go to removal, idle ones to
//!    `no_potential`.
//!
//! NIC lifecycle states are then re-derived from the entries. Passes
//! repeat until one makes no change, up to `max_passes`.

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error};

use crate::config::SelectorConfig;
use crate::error::{Error, Result};
use crate::nic::{NicIndex, NicInventory, NicState};
use crate::registry::{
    ActiveState, ConnectionId, ConnectionRegistry, ConnectionState, PairKey, RemovalOutcome,
};

/// Mutable view of everything a pass touches
pub struct SelectorState<'a> {
    pub client: &'a mut NicInventory,
    pub server: &'a mut NicInventory,
    pub registry: &'a mut ConnectionRegistry,
}

/// Selection policy engine
#[derive(Debug, Clone)]
pub struct Selector {
    config: SelectorConfig,
}

impl Selector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Run passes until stable.
    ///
    /// Returns the number of passes that made changes. Exceeding
    /// `max_passes` is reported as [`Error::NonConvergence`]; the caller
    /// owns rollback.
    pub fn converge(&self, state: &mut SelectorState<'_>, now: DateTime<Utc>) -> Result<usize> {
        for pass in 0..self.config.max_passes {
            let changes = self.run_pass(state, now);
            debug!("Selector pass {} made {} change(s)", pass + 1, changes);
            if changes == 0 {
                return Ok(pass);
            }
        }

        error!(
            "Selector failed to stabilize within {} passes",
            self.config.max_passes
        );
        Err(Error::NonConvergence {
            passes: self.config.max_passes,
        })
    }

    /// One full pass. Returns the number of state changes.
    pub fn run_pass(&self, state: &mut SelectorState<'_>, now: DateTime<Utc>) -> usize {
        let mut changes = self.recycle_failures(state);
        changes += self.detect_redundancy(state);
        changes += self.promote(state, now);
        changes += self.demote_lost(state);
        changes += sync_nic_states(state);
        changes
    }

    fn recycle_failures(&self, state: &mut SelectorState<'_>) -> usize {
        let failed: Vec<(ConnectionId, u32, Option<DateTime<Utc>>)> = state
            .registry
            .iter()
            .filter(|e| e.state() == ConnectionState::FailedToConnect)
            .map(|e| (e.id(), e.consecutive_failures(), e.last_attempt()))
            .collect();

        let mut changes = 0;
        for (id, failures, last_attempt) in failed {
            let retry_after = match (self.config.retry_backoff(failures), last_attempt) {
                (Some(delay), Some(at)) => Some(at + delay),
                _ => None,
            };
            if state.registry.recycle_failed(id, retry_after) {
                changes += 1;
            }
        }
        changes
    }

    /// Step 1. Deterministic for identical input regardless of arrival order.
    pub fn detect_redundancy(&self, state: &mut SelectorState<'_>) -> usize {
        let (client, server) = (&*state.client, &*state.server);
        let mut connected: Vec<(ConnectionId, PairKey, u64)> = state
            .registry
            .all_successful()
            .filter(|e| nic_in_service(client, e.pair().client))
            .filter(|e| nic_in_service(server, e.pair().server))
            .map(|e| (e.id(), e.pair(), e.speed()))
            .collect();
        connected.sort_by_key(|&(_, pair, speed)| (Reverse(speed), pair));

        let mut claimed_client = BTreeSet::new();
        let mut claimed_server = BTreeSet::new();
        let mut changes = 0;

        for (id, pair, _) in connected {
            let active = if claimed_client.contains(&pair.client)
                || claimed_server.contains(&pair.server)
            {
                ActiveState::InactiveRedundant
            } else {
                claimed_client.insert(pair.client);
                claimed_server.insert(pair.server);
                ActiveState::Active
            };
            if state.registry.set_active_state(id, active) {
                changes += 1;
            }
        }
        changes
    }

    /// Step 2
    fn promote(&self, state: &mut SelectorState<'_>, now: DateTime<Utc>) -> usize {
        let live = state
            .registry
            .iter()
            .filter(|e| matches!(e.state(), ConnectionState::InTrial | ConnectionState::Connected(_)))
            .count();
        let mut budget = self.config.max_channels.saturating_sub(live);
        if budget == 0 {
            return 0;
        }

        // Fastest active channel on each NIC; a candidate strictly slower
        // than one of these would come up redundant.
        let mut best_client: BTreeMap<NicIndex, u64> = BTreeMap::new();
        let mut best_server: BTreeMap<NicIndex, u64> = BTreeMap::new();
        for e in state.registry.all_successful() {
            if e.state() == ConnectionState::Connected(ActiveState::Active) {
                let c = best_client.entry(e.pair().client).or_default();
                *c = (*c).max(e.speed());
                let s = best_server.entry(e.pair().server).or_default();
                *s = (*s).max(e.speed());
            }
        }

        let (clients, servers) = (&*state.client, &*state.server);
        let mut eligible: Vec<(ConnectionId, PairKey, u64, u32)> = state
            .registry
            .iter()
            .filter(|e| e.state() == ConnectionState::Potential)
            .filter(|e| e.feasibility().is_feasible())
            .filter(|e| e.retry_after().is_none_or(|at| at <= now))
            .filter_map(|e| {
                let pair = e.pair();
                let client = clients.get(pair.client)?;
                let server = servers.get(pair.server)?;
                if !promotable(client.state()) || !promotable(server.state()) {
                    return None;
                }
                let outclassed = best_client.get(&pair.client).is_some_and(|&s| s > e.speed())
                    || best_server.get(&pair.server).is_some_and(|&s| s > e.speed());
                if outclassed {
                    return None;
                }
                let shared = client.capabilities().intersection(server.capabilities());
                Some((e.id(), pair, e.speed(), shared.count()))
            })
            .collect();
        eligible.sort_by_key(|&(_, pair, speed, caps)| (Reverse(speed), Reverse(caps), pair));

        let mut claimed_client = BTreeSet::new();
        let mut claimed_server = BTreeSet::new();
        let mut changes = 0;

        for (id, pair, speed, _) in eligible {
            if budget == 0 {
                break;
            }
            if claimed_client.contains(&pair.client) || claimed_server.contains(&pair.server) {
                continue;
            }
            if state.registry.begin_trial(id, now) {
                debug!("Promoted {} ({} bps) to trial", pair, speed);
                claimed_client.insert(pair.client);
                claimed_server.insert(pair.server);
                budget -= 1;
                changes += 1;
            }
        }
        changes
    }

    /// Step 3
    fn demote_lost(&self, state: &mut SelectorState<'_>) -> usize {
        let (client, server) = (&*state.client, &*state.server);
        let lost: Vec<(ConnectionId, ConnectionState)> = state
            .registry
            .iter()
            .filter(|e| {
                !e.feasibility().is_feasible()
                    || !nic_in_service(client, e.pair().client)
                    || !nic_in_service(server, e.pair().server)
            })
            .map(|e| (e.id(), e.state()))
            .collect();

        let mut changes = 0;
        for (id, conn_state) in lost {
            let changed = match conn_state {
                ConnectionState::Potential | ConnectionState::FailedToConnect => {
                    state.registry.mark_no_potential(id)
                }
                ConnectionState::InTrial | ConnectionState::Connected(_) => !matches!(
                    state.registry.mark_for_removal(id),
                    RemovalOutcome::AlreadyPending | RemovalOutcome::NotApplicable
                ),
                ConnectionState::NoPotential | ConnectionState::InRemoval => false,
            };
            if changed {
                changes += 1;
            }
        }
        changes
    }
}

fn promotable(state: NicState) -> bool {
    matches!(state, NicState::Idle | NicState::Used)
}

fn nic_in_service(inventory: &NicInventory, index: NicIndex) -> bool {
    inventory.get(index).is_some_and(|nic| !nic.is_disconnected())
}

/// Derive NIC lifecycle states from the registry.
///
/// A NIC with an attempt in flight is `on_trial`, one backing a transport
/// is `used`, anything else `idle`. Disconnected NICs are left alone.
pub(crate) fn sync_nic_states(state: &mut SelectorState<'_>) -> usize {
    let mut trial_client = BTreeSet::new();
    let mut trial_server = BTreeSet::new();
    let mut used_client = BTreeSet::new();
    let mut used_server = BTreeSet::new();

    for e in state.registry.iter() {
        let pair = e.pair();
        if e.attempt_in_flight() {
            trial_client.insert(pair.client);
            trial_server.insert(pair.server);
        } else if e.transport().is_some() {
            used_client.insert(pair.client);
            used_server.insert(pair.server);
        }
    }

    let mut changes = 0;
    for (inventory, trial, used) in [
        (&mut *state.client, &trial_client, &used_client),
        (&mut *state.server, &trial_server, &used_server),
    ] {
        let indices: Vec<(NicIndex, bool)> = inventory
            .iter()
            .map(|nic| (nic.index(), nic.is_disconnected()))
            .collect();
        for (index, disconnected) in indices {
            if disconnected {
                continue;
            }
            let target = if trial.contains(&index) {
                NicState::OnTrial
            } else if used.contains(&index) {
                NicState::Used
            } else {
                NicState::Idle
            };
            if inventory.set_state(index, target) {
                changes += 1;
            }
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::Feasibility;
    use crate::nic::{NicAdvertisement, Peer};
    use crate::registry::ConnectOutcome;
    use crate::traits::TransportHandle;

    const GBIT: u64 = 1_000_000_000;

    struct Fixture {
        client: NicInventory,
        server: NicInventory,
        registry: ConnectionRegistry,
    }

    impl Fixture {
        fn new(client: &[(u32, u64)], server: &[(u32, u64)]) -> Self {
            let mut c = NicInventory::new(Peer::Client);
            let mut s = NicInventory::new(Peer::Server);
            for (i, speed) in client {
                c.add_nic(&NicAdvertisement::new(*i, *speed, vec!["10.0.0.1:0".parse().unwrap()]));
            }
            for (i, speed) in server {
                s.add_nic(&NicAdvertisement::new(*i, *speed, vec!["10.0.1.1:445".parse().unwrap()]));
            }
            let mut registry = ConnectionRegistry::new();
            for cand in crate::candidate::generate(&c, &s, &registry) {
                registry.upsert(cand.pair, cand.speed, cand.feasibility);
            }
            Self {
                client: c,
                server: s,
                registry,
            }
        }

        fn state(&mut self) -> SelectorState<'_> {
            SelectorState {
                client: &mut self.client,
                server: &mut self.server,
                registry: &mut self.registry,
            }
        }

        fn connect_all_trials(&mut self) {
            let trials: Vec<PairKey> = self
                .registry
                .iter()
                .filter(|e| e.state() == ConnectionState::InTrial)
                .map(|e| e.pair())
                .collect();
            for (n, pair) in trials.into_iter().enumerate() {
                self.registry.mark_result(
                    pair,
                    ConnectOutcome::Connected(TransportHandle::new(n as u64)),
                    Utc::now(),
                );
            }
        }

        fn state_of(&self, client: u32, server: u32) -> ConnectionState {
            self.registry
                .get_by_pair(PairKey::new(client, server))
                .unwrap()
                .state()
        }
    }

    fn selector(max_channels: usize) -> Selector {
        Selector::new(SelectorConfig {
            max_channels,
            ..SelectorConfig::default()
        })
    }

    #[test]
    fn test_promotion_never_shares_a_nic_in_one_pass() {
        let mut fx = Fixture::new(&[(1, GBIT)], &[(10, GBIT), (11, 10 * GBIT)]);
        let sel = selector(4);

        sel.run_pass(&mut fx.state(), Utc::now());

        let trials = fx
            .registry
            .iter()
            .filter(|e| e.state() == ConnectionState::InTrial)
            .count();
        assert_eq!(trials, 1);
        assert_eq!(fx.state_of(1, 10), ConnectionState::InTrial);
        assert_eq!(fx.client.get(1).unwrap().state(), NicState::OnTrial);
        assert_eq!(fx.server.get(11).unwrap().state(), NicState::Idle);
    }

    #[test]
    fn test_budget_limits_promotion() {
        let mut fx = Fixture::new(&[(1, GBIT), (2, GBIT), (3, GBIT)], &[(10, GBIT), (11, GBIT), (12, GBIT)]);
        let sel = selector(2);

        sel.converge(&mut fx.state(), Utc::now()).unwrap();
        let trials = fx
            .registry
            .iter()
            .filter(|e| e.state() == ConnectionState::InTrial)
            .count();
        assert_eq!(trials, 2);
    }

    #[test]
    fn test_fastest_pairs_promoted_first() {
        let mut fx = Fixture::new(&[(1, GBIT), (2, 10 * GBIT)], &[(10, 10 * GBIT)]);
        selector(1).converge(&mut fx.state(), Utc::now()).unwrap();

        assert_eq!(fx.state_of(2, 10), ConnectionState::InTrial);
        assert_eq!(fx.state_of(1, 10), ConnectionState::Potential);
    }

    #[test]
    fn test_redundancy_keeps_one_active_per_nic() {
        let mut fx = Fixture::new(&[(1, GBIT)], &[(10, GBIT), (11, 10 * GBIT)]);
        let sel = selector(4);
        let now = Utc::now();

        sel.converge(&mut fx.state(), now).unwrap();
        fx.connect_all_trials();
        sel.converge(&mut fx.state(), now).unwrap();
        fx.connect_all_trials();
        sel.converge(&mut fx.state(), now).unwrap();

        assert_eq!(fx.state_of(1, 10), ConnectionState::Connected(ActiveState::Active));
        assert_eq!(
            fx.state_of(1, 11),
            ConnectionState::Connected(ActiveState::InactiveRedundant)
        );
        assert_eq!(fx.client.get(1).unwrap().state(), NicState::Used);
    }

    #[test]
    fn test_redundancy_pass_is_idempotent() {
        let mut fx = Fixture::new(&[(1, GBIT), (2, GBIT)], &[(10, GBIT), (11, GBIT)]);
        let sel = selector(8);
        let now = Utc::now();
        for _ in 0..4 {
            sel.converge(&mut fx.state(), now).unwrap();
            fx.connect_all_trials();
        }
        sel.converge(&mut fx.state(), now).unwrap();

        assert_eq!(sel.detect_redundancy(&mut fx.state()), 0);
        let before: Vec<_> = fx.registry.iter().map(|e| e.state()).collect();
        assert_eq!(sel.detect_redundancy(&mut fx.state()), 0);
        let after: Vec<_> = fx.registry.iter().map(|e| e.state()).collect();
        assert_eq!(before, after);

        let active = fx
            .registry
            .iter()
            .filter(|e| e.state() == ConnectionState::Connected(ActiveState::Active))
            .count();
        assert_eq!(active, 2);
    }

    #[test]
    fn test_disconnected_nic_demotes_connected_entry() {
        let mut fx = Fixture::new(&[(1, GBIT)], &[(10, GBIT)]);
        let sel = selector(4);
        sel.converge(&mut fx.state(), Utc::now()).unwrap();
        fx.connect_all_trials();
        sel.converge(&mut fx.state(), Utc::now()).unwrap();

        fx.server.remove_nic(10).unwrap();
        sel.converge(&mut fx.state(), Utc::now()).unwrap();

        assert_eq!(fx.state_of(1, 10), ConnectionState::InRemoval);
        assert_eq!(fx.client.get(1).unwrap().state(), NicState::Used);
    }

    #[test]
    fn test_failed_entry_recycled_with_backoff() {
        let mut fx = Fixture::new(&[(1, GBIT)], &[(10, GBIT)]);
        let sel = Selector::new(SelectorConfig {
            retry_backoff_secs: 10,
            ..SelectorConfig::default()
        });
        let t0 = Utc::now();

        sel.converge(&mut fx.state(), t0).unwrap();
        fx.registry
            .mark_result(PairKey::new(1, 10), ConnectOutcome::Failed, t0);
        sel.converge(&mut fx.state(), t0).unwrap();

        assert_eq!(fx.state_of(1, 10), ConnectionState::Potential);
        assert_eq!(fx.client.get(1).unwrap().state(), NicState::Idle);

        sel.converge(&mut fx.state(), t0 + chrono::Duration::seconds(11))
            .unwrap();
        assert_eq!(fx.state_of(1, 10), ConnectionState::InTrial);
    }

    #[test]
    fn test_non_convergence_reported() {
        let mut fx = Fixture::new(&[(1, GBIT)], &[(10, GBIT)]);
        let sel = Selector::new(SelectorConfig {
            max_passes: 1,
            ..SelectorConfig::default()
        });
        let err = sel.converge(&mut fx.state(), Utc::now()).unwrap_err();
        assert!(err.is_non_convergence());
    }

    #[test]
    fn test_infeasible_potential_goes_no_potential() {
        let mut fx = Fixture::new(&[(1, GBIT)], &[(10, GBIT)]);
        fx.registry.upsert(
            PairKey::new(1, 10),
            GBIT,
            Feasibility::Infeasible(crate::candidate::InfeasibleReason::Blacklisted),
        );
        selector(4).converge(&mut fx.state(), Utc::now()).unwrap();
        assert_eq!(fx.state_of(1, 10), ConnectionState::NoPotential);
    }
}
