//! Architectural Contract Test: Deterministic Assignment
//!
//! This test verifies that channel decisions depend only on the inventories
//! and connection results, never on arrival order or hash iteration.
//!
//! Constraints verified:
//! - Same NICs in a different order produce the same assignment
//! - Reconciling a settled state changes nothing
//! - Ties are broken by pair order
//!
//! If this test fails, someone has:
//! - Introduced HashMap iteration into a decision path
//! - Made redundancy depend on when a channel came up
//! - Added state that flaps between reconciliation passes

mod common;

use chrono::Utc;
use common::*;
use smb_mc_core::registry::{ActiveState, ConnectOutcome, ConnectionState, PairKey};
use smb_mc_core::traits::{NicChange, TransportHandle};
use smb_mc_core::{Action, Coordinator, MultichannelConfig, Peer};

fn coordinator(max_channels: usize) -> Coordinator {
    Coordinator::new(&minimal_config(max_channels))
}

fn added(peer: Peer, index: u32, speed: u64, addr: &str) -> (Peer, NicChange) {
    (peer, NicChange::Added(nic(index, speed, &[addr])))
}

/// Feed every connect back as a success, lowest pair first, until quiet
fn settle(co: &mut Coordinator, mut actions: Vec<Action>) {
    let now = Utc::now();
    let mut next_handle = 0;
    loop {
        let mut pairs: Vec<PairKey> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Connect(req) => Some(req.pair),
                Action::Disconnect { .. } => None,
            })
            .collect();
        if pairs.is_empty() {
            return;
        }
        pairs.sort();

        actions = Vec::new();
        for pair in pairs {
            next_handle += 1;
            let outcome = ConnectOutcome::Connected(TransportHandle::new(next_handle));
            actions.extend(co.connection_result(pair, outcome, now).unwrap());
        }
    }
}

fn assignment(co: &Coordinator) -> Vec<(PairKey, ConnectionState)> {
    co.all_channels()
        .into_iter()
        .map(|c| (PairKey::new(c.client_nic, c.server_nic), c.state))
        .collect()
}

fn mesh() -> Vec<(Peer, NicChange)> {
    vec![
        added(Peer::Client, 1, GBIT, "10.0.0.1:0"),
        added(Peer::Client, 2, GBIT, "10.0.0.2:0"),
        added(Peer::Server, 10, GBIT, "10.0.0.10:445"),
        added(Peer::Server, 11, GBIT, "10.0.0.11:445"),
    ]
}

#[test]
fn arrival_order_does_not_change_assignment() {
    let now = Utc::now();

    let mut forward = coordinator(8);
    for change in mesh() {
        let actions = forward.apply(change.0, change.1, now).unwrap();
        settle(&mut forward, actions);
    }

    let mut backward = coordinator(8);
    for change in mesh().into_iter().rev() {
        let actions = backward.apply(change.0, change.1, now).unwrap();
        settle(&mut backward, actions);
    }

    assert_eq!(assignment(&forward), assignment(&backward));
    assert_eq!(forward.successful_channels().len(), 4);

    let active: Vec<PairKey> = assignment(&forward)
        .into_iter()
        .filter(|(_, s)| *s == ConnectionState::Connected(ActiveState::Active))
        .map(|(p, _)| p)
        .collect();
    assert_eq!(active, vec![PairKey::new(1, 10), PairKey::new(2, 11)]);
}

#[test]
fn batch_order_does_not_change_assignment() {
    let now = Utc::now();
    let changes = vec![
        added(Peer::Client, 3, 10 * GBIT, "10.0.0.3:0"),
        added(Peer::Client, 1, GBIT, "10.0.0.1:0"),
        added(Peer::Server, 12, 25 * GBIT, "10.0.0.12:445"),
        added(Peer::Server, 10, GBIT, "10.0.0.10:445"),
        added(Peer::Server, 11, 10 * GBIT, "10.0.0.11:445"),
    ];

    let mut a = coordinator(3);
    let actions = a.apply_all(changes.clone(), now).unwrap();
    settle(&mut a, actions);

    let mut reversed = changes;
    reversed.reverse();
    let mut b = coordinator(3);
    let actions = b.apply_all(reversed, now).unwrap();
    settle(&mut b, actions);

    assert_eq!(assignment(&a), assignment(&b));
    assert!(a.successful_channels().len() <= 3);
}

#[test]
fn settled_state_does_not_flap() {
    let mut co = coordinator(8);
    let now = Utc::now();
    let actions = co.apply_all(mesh(), now).unwrap();
    settle(&mut co, actions);

    let settled = assignment(&co);
    for _ in 0..5 {
        assert!(co.reconcile(Utc::now()).unwrap().is_empty());
        assert_eq!(assignment(&co), settled);
    }
}

#[test]
fn reconcile_failure_is_reported_and_state_kept() {
    // Below the validated minimum, so any cycle that changes state fails
    let mut config = MultichannelConfig::default();
    config.selector.max_passes = 1;
    let mut co = Coordinator::new(&config);
    let now = Utc::now();

    let err = co.apply_all(mesh(), now).unwrap_err();
    assert!(err.is_non_convergence());
    assert!(co.registry().is_empty());
    assert!(co.client_inventory().is_empty());
    assert!(co.server_inventory().is_empty());
}
