//! NIC records and inventories
//!
//! A [`NicRecord`] describes one network interface on one peer. Records
//! live in a per-peer [`NicInventory`] keyed by interface index. The
//! inventory owns the records; everything else refers to a NIC by its
//! [`NicIndex`].
//!
//! ## Lifecycle
//!
//! ```text
//!   idle ──pick──▶ on_trial ──ok──▶ used ──torn down──▶ idle
//!    ▲                │
//!    └────failed──────┘
//!
//!   any ──removal notification──▶ disconnected
//! ```

pub mod interface_info;
pub mod inventory;

pub use interface_info::parse_network_interface_info;
pub use inventory::{NicInventory, NicUpsert};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use tracing::debug;

/// Interface index as reported by the discovery layer
pub type NicIndex = u32;

/// Which side of the session a NIC belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Peer {
    /// Local interface
    Client,
    /// Interface advertised by the file server
    Server,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Client => write!(f, "client"),
            Peer::Server => write!(f, "server"),
        }
    }
}

/// Address family of a bound address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl AddressFamily {
    /// Family of a socket address
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::V4,
            SocketAddr::V6(_) => AddressFamily::V6,
        }
    }
}

/// Set of IP families present on a NIC (or shared by two NICs)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpFamilies {
    /// Has at least one IPv4 address
    pub v4: bool,
    /// Has at least one IPv6 address
    pub v6: bool,
}

impl IpFamilies {
    /// Families present in an address set
    pub fn from_addresses<'a>(addrs: impl IntoIterator<Item = &'a SocketAddr>) -> Self {
        addrs.into_iter().fold(Self::default(), |mut acc, addr| {
            match AddressFamily::of(addr) {
                AddressFamily::V4 => acc.v4 = true,
                AddressFamily::V6 => acc.v6 = true,
            }
            acc
        })
    }

    /// Families present in both sets
    pub fn intersection(self, other: Self) -> Self {
        Self {
            v4: self.v4 && other.v4,
            v6: self.v6 && other.v6,
        }
    }

    /// True if no family is present
    pub fn is_empty(self) -> bool {
        !self.v4 && !self.v6
    }

    /// Whether `family` is in the set
    pub fn contains(self, family: AddressFamily) -> bool {
        match family {
            AddressFamily::V4 => self.v4,
            AddressFamily::V6 => self.v6,
        }
    }
}

/// Capability bits advertised for an interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NicCapabilities(u32);

impl NicCapabilities {
    /// Receive side scaling
    pub const RSS: Self = Self(0x0000_0001);
    /// RDMA capable
    pub const RDMA: Self = Self(0x0000_0002);

    /// No capabilities
    pub const fn empty() -> Self {
        Self(0)
    }

    /// From raw bits
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// All bits of `other` are set in `self`
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Bits set in both
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Number of set bits, used for ranking
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }
}

impl std::ops::BitOr for NicCapabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Lifecycle state of a NIC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NicState {
    /// Ready to be used
    Idle,
    /// Chosen by the selector, connection attempt in flight
    OnTrial,
    /// Backing an established connection
    Used,
    /// Removed by an inventory update; awaiting connection cleanup
    Disconnected,
}

/// A NIC as reported by the discovery layer, before normalization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicAdvertisement {
    /// Interface index
    pub index: NicIndex,
    /// Link speed in bits per second
    pub speed: u64,
    /// Capability bits
    #[serde(default)]
    pub capabilities: NicCapabilities,
    /// Bound socket addresses
    #[serde(default)]
    pub addresses: Vec<SocketAddr>,
}

impl NicAdvertisement {
    /// Create an advertisement without capabilities
    pub fn new(index: NicIndex, speed: u64, addresses: Vec<SocketAddr>) -> Self {
        Self {
            index,
            speed,
            capabilities: NicCapabilities::empty(),
            addresses,
        }
    }

    /// Set the capability bits
    pub fn with_capabilities(mut self, capabilities: NicCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// One interface on one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicRecord {
    index: NicIndex,
    speed: u64,
    capabilities: NicCapabilities,
    families: IpFamilies,
    blacklisted: bool,
    state: NicState,
    addresses: BTreeSet<SocketAddr>,
}

impl NicRecord {
    /// Build an idle record from an advertisement
    pub fn from_advertisement(adv: &NicAdvertisement) -> Self {
        let addresses: BTreeSet<SocketAddr> = adv.addresses.iter().copied().collect();
        Self {
            index: adv.index,
            speed: adv.speed,
            capabilities: adv.capabilities,
            families: IpFamilies::from_addresses(&addresses),
            blacklisted: false,
            state: NicState::Idle,
            addresses,
        }
    }

    /// Apply a fresh advertisement. Returns true if any field changed.
    ///
    /// The advertised address list replaces the previous one.
    pub(crate) fn merge(&mut self, adv: &NicAdvertisement) -> bool {
        let addresses: BTreeSet<SocketAddr> = adv.addresses.iter().copied().collect();
        let changed = self.speed != adv.speed
            || self.capabilities != adv.capabilities
            || self.addresses != addresses;

        self.speed = adv.speed;
        self.capabilities = adv.capabilities;
        self.families = IpFamilies::from_addresses(&addresses);
        self.addresses = addresses;
        changed
    }

    pub fn index(&self) -> NicIndex {
        self.index
    }

    /// Link speed in bits per second
    pub fn speed(&self) -> u64 {
        self.speed
    }

    pub fn capabilities(&self) -> NicCapabilities {
        self.capabilities
    }

    /// IP families bound on this NIC
    pub fn families(&self) -> IpFamilies {
        self.families
    }

    pub fn is_blacklisted(&self) -> bool {
        self.blacklisted
    }

    pub fn state(&self) -> NicState {
        self.state
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == NicState::Disconnected
    }

    /// Bound addresses in ascending order
    pub fn addresses(&self) -> impl Iterator<Item = &SocketAddr> {
        self.addresses.iter()
    }

    /// Lowest address of the given family
    pub fn first_address(&self, family: AddressFamily) -> Option<SocketAddr> {
        self.addresses
            .iter()
            .find(|addr| AddressFamily::of(addr) == family)
            .copied()
    }

    pub(crate) fn set_speed(&mut self, speed: u64) -> bool {
        let changed = self.speed != speed;
        self.speed = speed;
        changed
    }

    pub(crate) fn set_blacklisted(&mut self, blacklisted: bool) -> bool {
        let changed = self.blacklisted != blacklisted;
        self.blacklisted = blacklisted;
        changed
    }

    /// Transition the lifecycle state. Returns true on change.
    pub(crate) fn set_state(&mut self, state: NicState) -> bool {
        if self.state == state {
            return false;
        }
        debug!("NIC {}: {:?} -> {:?}", self.index, self.state, state);
        self.state = state;
        true
    }
}

/// Address families two NICs have in common
pub fn addresses_overlap_family(a: &NicRecord, b: &NicRecord) -> IpFamilies {
    a.families().intersection(b.families())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_families_from_addresses() {
        let addrs = [v4("10.0.0.1:445"), "[fe80::1]:445".parse().unwrap()];
        let fam = IpFamilies::from_addresses(&addrs);
        assert!(fam.v4 && fam.v6);
        assert!(IpFamilies::from_addresses(&[]).is_empty());
    }

    #[test]
    fn test_overlap_family() {
        let a = NicRecord::from_advertisement(&NicAdvertisement::new(
            1,
            1_000,
            vec![v4("10.0.0.1:0")],
        ));
        let b = NicRecord::from_advertisement(&NicAdvertisement::new(
            2,
            1_000,
            vec!["[2001:db8::1]:445".parse().unwrap()],
        ));
        assert!(addresses_overlap_family(&a, &b).is_empty());
        assert!(addresses_overlap_family(&a, &a).v4);
    }

    #[test]
    fn test_merge_replaces_addresses() {
        let mut rec = NicRecord::from_advertisement(&NicAdvertisement::new(
            1,
            1_000,
            vec![v4("10.0.0.1:445")],
        ));
        let changed = rec.merge(&NicAdvertisement::new(1, 1_000, vec![v4("10.0.0.2:445")]));
        assert!(changed);
        assert_eq!(rec.addresses().count(), 1);
        assert_eq!(rec.first_address(AddressFamily::V4), Some(v4("10.0.0.2:445")));
        assert!(!rec.merge(&NicAdvertisement::new(1, 1_000, vec![v4("10.0.0.2:445")])));
    }

    #[test]
    fn test_capabilities() {
        let caps = NicCapabilities::RSS | NicCapabilities::RDMA;
        assert!(caps.contains(NicCapabilities::RSS));
        assert_eq!(caps.intersection(NicCapabilities::RSS).count(), 1);
        assert_eq!(NicCapabilities::from_bits(3), caps);
    }
}
