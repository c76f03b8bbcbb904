//! Candidate generation
//!
//! Produces the cross product of client and server NICs, each pairing
//! tagged with its usable speed and a feasibility verdict. Generation is
//! pure: the registry is only read, to report the identity of an entry
//! that already exists for a pairing so the caller reconciles it instead
//! of creating a duplicate.

use crate::nic::{addresses_overlap_family, IpFamilies, NicCapabilities, NicInventory, NicRecord};
use crate::registry::{ConnectionId, ConnectionRegistry, PairKey};

/// Why a pairing cannot become a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfeasibleReason {
    /// The client NIC has been removed
    ClientDisconnected,
    /// The server NIC has been removed
    ServerDisconnected,
    /// No address family in common
    NoCommonFamily,
    /// Client NIC is administratively blacklisted
    Blacklisted,
}

/// Feasibility verdict of a pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feasibility {
    Feasible,
    Infeasible(InfeasibleReason),
}

impl Feasibility {
    pub fn is_feasible(self) -> bool {
        matches!(self, Feasibility::Feasible)
    }
}

/// One (client NIC, server NIC) pairing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Pair identity
    pub pair: PairKey,
    /// min(client speed, server speed)
    pub speed: u64,
    /// Address families both NICs carry
    pub shared_families: IpFamilies,
    /// Capability bits both NICs carry
    pub shared_capabilities: NicCapabilities,
    /// Verdict
    pub feasibility: Feasibility,
    /// Registry entry already tracking this pair, if any
    pub existing: Option<ConnectionId>,
}

/// Evaluate a single pairing
pub fn evaluate(client: &NicRecord, server: &NicRecord) -> (u64, IpFamilies, Feasibility) {
    let speed = client.speed().min(server.speed());
    let shared = addresses_overlap_family(client, server);

    let feasibility = if client.is_disconnected() {
        Feasibility::Infeasible(InfeasibleReason::ClientDisconnected)
    } else if server.is_disconnected() {
        Feasibility::Infeasible(InfeasibleReason::ServerDisconnected)
    } else if client.is_blacklisted() {
        Feasibility::Infeasible(InfeasibleReason::Blacklisted)
    } else if shared.is_empty() {
        Feasibility::Infeasible(InfeasibleReason::NoCommonFamily)
    } else {
        Feasibility::Feasible
    };

    (speed, shared, feasibility)
}

/// Generate every pairing of `client` × `server`, ordered by (client, server) index
pub fn generate(
    client: &NicInventory,
    server: &NicInventory,
    registry: &ConnectionRegistry,
) -> Vec<Candidate> {
    let mut candidates = Vec::with_capacity(client.len() * server.len());

    for c in client.iter() {
        for s in server.iter() {
            let pair = PairKey::new(c.index(), s.index());
            let (speed, shared_families, feasibility) = evaluate(c, s);
            candidates.push(Candidate {
                pair,
                speed,
                shared_families,
                shared_capabilities: c.capabilities().intersection(s.capabilities()),
                feasibility,
                existing: registry.lookup(pair),
            });
        }
    }

    candidates
}
