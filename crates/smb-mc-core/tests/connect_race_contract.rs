//! Architectural Contract Test: Connect Results
//!
//! This test verifies how connect outcomes re-enter the core.
//!
//! Constraints verified:
//! - Connect attempts run outside the exclusive section
//! - A result arriving after its NIC vanished is torn down, never activated
//! - A failed attempt is retried once its backoff has elapsed
//!
//! If this test fails, someone has:
//! - Held the coordinator lock across a transport call
//! - Activated a channel whose entry was already in removal
//! - Dropped failed pairings instead of recycling them

mod common;

use common::*;
use smb_mc_core::registry::{ConnectionState, PairKey};
use smb_mc_core::traits::TransportHandle;
use smb_mc_core::{EngineEvent, MultichannelEngine, StaticNicSource};
use std::sync::Arc;

#[tokio::test]
async fn late_result_for_removed_nic_is_torn_down() {
    let client = StaticNicSource::new(vec![nic(1, GBIT, &["10.0.0.1:0"])]);
    let server = StaticNicSource::new(vec![nic(10, GBIT, &["10.0.0.10:445"])]);
    let server_handle = server.handle();
    let transport = RecordingTransport::gated();

    let (engine, mut event_rx) = MultichannelEngine::new(
        Box::new(client),
        Box::new(server),
        Box::new(RecordingTransport::sharing_counters_with(&transport)),
        minimal_config(4),
    )
    .unwrap();
    let engine = Arc::new(engine);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let runner = Arc::clone(&engine);
    let engine_handle =
        tokio::spawn(async move { runner.run_with_shutdown(Some(shutdown_rx)).await });

    // The attempt is parked inside the transport
    wait_until(|| transport.connect_call_count() == 1).await;
    let channels = engine.channels().await;
    assert_eq!(channels[0].state, ConnectionState::InTrial);

    // The engine stays responsive while the attempt is pending
    server_handle.remove(10).await;
    wait_for_channels(&engine, |c| {
        c.first().is_some_and(|s| s.state == ConnectionState::InRemoval)
    })
    .await;

    transport.release(1);
    wait_until(|| transport.disconnect_call_count() == 1).await;
    assert_eq!(transport.disconnected(), vec![TransportHandle::new(1)]);

    wait_for_channels(&engine, |c| c.is_empty()).await;
    assert!(engine.successful_channels().await.is_empty());

    shutdown_tx.send(()).unwrap();
    engine_handle.await.unwrap().unwrap();

    while let Ok(event) = event_rx.try_recv() {
        assert!(
            !matches!(event, EngineEvent::ChannelUp { .. }),
            "removed pairing must never come up: {:?}",
            event
        );
    }
}

#[tokio::test]
async fn failed_attempt_is_retried_after_backoff() {
    let client = StaticNicSource::new(vec![nic(1, GBIT, &["10.0.0.1:0"])]);
    let server = StaticNicSource::new(vec![nic(10, GBIT, &["10.0.0.10:445"])]);
    let transport = RecordingTransport::new();
    let pair = PairKey::new(1, 10);
    transport.fail_pair(pair);

    let mut config = minimal_config(4);
    config.selector.retry_backoff_secs = 1;
    config.selector.max_retry_backoff_secs = 1;

    let (engine, mut event_rx) = MultichannelEngine::new(
        Box::new(client),
        Box::new(server),
        Box::new(RecordingTransport::sharing_counters_with(&transport)),
        config,
    )
    .unwrap();
    let engine = Arc::new(engine);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let runner = Arc::clone(&engine);
    let engine_handle =
        tokio::spawn(async move { runner.run_with_shutdown(Some(shutdown_rx)).await });

    let channels = wait_for_channels(&engine, |c| {
        c.first().is_some_and(|s| s.consecutive_failures == 1)
    })
    .await;
    assert_eq!(channels[0].state, ConnectionState::Potential);
    assert!(channels[0].last_attempt.is_some());
    assert_eq!(transport.connect_call_count(), 1);

    // Let the retry through
    transport.unfail_pair(pair);
    let channels =
        wait_for_channels(&engine, |c| c.first().is_some_and(|s| s.state.is_connected())).await;
    assert_eq!(channels[0].consecutive_failures, 0);
    assert_eq!(transport.connect_call_count(), 2);

    shutdown_tx.send(()).unwrap();
    engine_handle.await.unwrap().unwrap();

    let mut failures = 0;
    while let Ok(event) = event_rx.try_recv() {
        if let EngineEvent::ConnectFailed { pair: failed, error } = event {
            assert_eq!(failed, pair);
            assert!(error.contains("refused"));
            failures += 1;
        }
    }
    assert_eq!(failures, 1);
}
