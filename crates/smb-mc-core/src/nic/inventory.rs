// # NIC Inventory
//
// Holds the known interfaces of one peer. Every mutation that can affect
// candidate generation bumps a generation counter; the coordinator compares
// generations to decide whether the candidate set must be rebuilt.
//
// Removal is two-phase: `remove_nic` only marks the record disconnected.
// The record is purged by the coordinator once no live connection still
// references it.

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::{NicAdvertisement, NicIndex, NicRecord, NicState, Peer};
use crate::error::{Error, Result};

/// Outcome of [`NicInventory::add_nic`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NicUpsert {
    /// NIC was unknown (or had been disconnected) and is now present
    New,
    /// Known NIC, some advertised field changed
    Refreshed,
    /// Known NIC, advertisement identical to what we had
    Unchanged,
}

/// Interfaces known for one peer, keyed by interface index
#[derive(Debug, Clone)]
pub struct NicInventory {
    peer: Peer,
    nics: BTreeMap<NicIndex, NicRecord>,
    generation: u64,
}

impl NicInventory {
    /// Create an empty inventory for `peer`
    pub fn new(peer: Peer) -> Self {
        Self {
            peer,
            nics: BTreeMap::new(),
            generation: 0,
        }
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    /// Insert or refresh a NIC by index
    pub fn add_nic(&mut self, adv: &NicAdvertisement) -> NicUpsert {
        let outcome = match self.nics.get_mut(&adv.index) {
            Some(record) if record.is_disconnected() => {
                record.merge(adv);
                record.set_state(NicState::Idle);
                info!("{} NIC {} re-advertised", self.peer, adv.index);
                NicUpsert::New
            }
            Some(record) => {
                if record.merge(adv) {
                    debug!("{} NIC {} refreshed", self.peer, adv.index);
                    NicUpsert::Refreshed
                } else {
                    NicUpsert::Unchanged
                }
            }
            None => {
                self.nics.insert(adv.index, NicRecord::from_advertisement(adv));
                info!(
                    "{} NIC {} added ({} bps, {} address(es))",
                    self.peer,
                    adv.index,
                    adv.speed,
                    adv.addresses.len()
                );
                NicUpsert::New
            }
        };

        if outcome != NicUpsert::Unchanged {
            self.bump();
        }
        outcome
    }

    /// Mark a NIC disconnected.
    ///
    /// Returns `Ok(false)` if it already was. The record stays in the
    /// inventory until [`purge`](Self::purge) is called.
    pub fn remove_nic(&mut self, index: NicIndex) -> Result<bool> {
        let peer = self.peer;
        let record = self
            .nics
            .get_mut(&index)
            .ok_or_else(|| Error::not_found(format!("{} NIC {}", peer, index)))?;

        if !record.set_state(NicState::Disconnected) {
            return Ok(false);
        }
        info!("{} NIC {} disconnected", peer, index);
        self.bump();
        Ok(true)
    }

    /// Update the link speed of a NIC
    pub fn set_link_speed(&mut self, index: NicIndex, speed: u64) -> Result<bool> {
        let changed = self.record_mut(index)?.set_speed(speed);
        if changed {
            debug!("{} NIC {} link speed now {} bps", self.peer, index, speed);
            self.bump();
        }
        Ok(changed)
    }

    /// Set or clear the administrative blacklist flag
    pub fn set_blacklisted(&mut self, index: NicIndex, blacklisted: bool) -> Result<bool> {
        let changed = self.record_mut(index)?.set_blacklisted(blacklisted);
        if changed {
            info!(
                "{} NIC {} {}",
                self.peer,
                index,
                if blacklisted { "blacklisted" } else { "un-blacklisted" }
            );
            self.bump();
        }
        Ok(changed)
    }

    /// Drop a record for good
    pub(crate) fn purge(&mut self, index: NicIndex) -> Option<NicRecord> {
        let removed = self.nics.remove(&index);
        if removed.is_some() {
            debug!("{} NIC {} purged", self.peer, index);
            self.bump();
        }
        removed
    }

    /// Lifecycle transitions driven by the selector do not bump the generation
    pub(crate) fn set_state(&mut self, index: NicIndex, state: NicState) -> bool {
        match self.nics.get_mut(&index) {
            Some(record) => record.set_state(state),
            None => false,
        }
    }

    pub fn get(&self, index: NicIndex) -> Option<&NicRecord> {
        self.nics.get(&index)
    }

    /// Records in ascending index order
    pub fn iter(&self) -> impl Iterator<Item = &NicRecord> {
        self.nics.values()
    }

    pub fn len(&self) -> usize {
        self.nics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nics.is_empty()
    }

    /// Mutation counter
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn record_mut(&mut self, index: NicIndex) -> Result<&mut NicRecord> {
        let peer = self.peer;
        self.nics
            .get_mut(&index)
            .ok_or_else(|| Error::not_found(format!("{} NIC {}", peer, index)))
    }

    fn bump(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adv(index: NicIndex, speed: u64) -> NicAdvertisement {
        NicAdvertisement::new(index, speed, vec!["10.0.0.1:445".parse().unwrap()])
    }

    #[test]
    fn test_add_new_then_refresh() {
        let mut inv = NicInventory::new(Peer::Client);
        assert_eq!(inv.add_nic(&adv(1, 1_000)), NicUpsert::New);
        let gen_after_add = inv.generation();

        assert_eq!(inv.add_nic(&adv(1, 1_000)), NicUpsert::Unchanged);
        assert_eq!(inv.generation(), gen_after_add);

        assert_eq!(inv.add_nic(&adv(1, 10_000)), NicUpsert::Refreshed);
        assert!(inv.generation() > gen_after_add);
        assert_eq!(inv.get(1).unwrap().speed(), 10_000);
    }

    #[test]
    fn test_remove_is_deferred() {
        let mut inv = NicInventory::new(Peer::Server);
        inv.add_nic(&adv(7, 1_000));

        assert!(inv.remove_nic(7).unwrap());
        assert!(!inv.remove_nic(7).unwrap());
        assert_eq!(inv.get(7).unwrap().state(), NicState::Disconnected);
        assert_eq!(inv.len(), 1);

        assert!(inv.purge(7).is_some());
        assert!(inv.is_empty());
    }

    #[test]
    fn test_remove_unknown_is_not_found() {
        let mut inv = NicInventory::new(Peer::Client);
        assert!(matches!(inv.remove_nic(3), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_readvertise_revives_disconnected() {
        let mut inv = NicInventory::new(Peer::Server);
        inv.add_nic(&adv(2, 1_000));
        inv.remove_nic(2).unwrap();

        assert_eq!(inv.add_nic(&adv(2, 1_000)), NicUpsert::New);
        assert_eq!(inv.get(2).unwrap().state(), NicState::Idle);
    }

    #[test]
    fn test_selector_state_changes_do_not_bump_generation() {
        let mut inv = NicInventory::new(Peer::Client);
        inv.add_nic(&adv(1, 1_000));
        let generation = inv.generation();

        assert!(inv.set_state(1, NicState::OnTrial));
        assert_eq!(inv.generation(), generation);
    }
}
