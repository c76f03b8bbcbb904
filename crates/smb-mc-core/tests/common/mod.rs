//! Test doubles and common utilities for architecture contract tests
//!
//! This module provides minimal test doubles that verify architectural
//! constraints without opening real channels.

#![allow(dead_code)]

use smb_mc_core::config::MultichannelConfig;
use smb_mc_core::error::{Error, Result};
use smb_mc_core::nic::NicAdvertisement;
use smb_mc_core::registry::{ChannelStatus, PairKey};
use smb_mc_core::traits::{ConnectRequest, Transport, TransportHandle};
use smb_mc_core::MultichannelEngine;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

pub const GBIT: u64 = 1_000_000_000;

/// A transport that records every call and succeeds unless told otherwise
pub struct RecordingTransport {
    connect_call_count: Arc<AtomicUsize>,
    disconnect_call_count: Arc<AtomicUsize>,
    next_handle: Arc<AtomicU64>,
    requests: Arc<std::sync::Mutex<Vec<ConnectRequest>>>,
    disconnected: Arc<std::sync::Mutex<Vec<TransportHandle>>>,
    failing: Arc<std::sync::Mutex<BTreeSet<PairKey>>>,
    /// When set, every connect waits for a permit
    gate: Option<Arc<Semaphore>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            connect_call_count: Arc::new(AtomicUsize::new(0)),
            disconnect_call_count: Arc::new(AtomicUsize::new(0)),
            next_handle: Arc::new(AtomicU64::new(1)),
            requests: Arc::new(std::sync::Mutex::new(Vec::new())),
            disconnected: Arc::new(std::sync::Mutex::new(Vec::new())),
            failing: Arc::new(std::sync::Mutex::new(BTreeSet::new())),
            gate: None,
        }
    }

    /// A transport whose connects block until [`release`](Self::release)
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::new()
        }
    }

    /// Let `n` pending or future connects complete
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Make every connect for `pair` fail
    pub fn fail_pair(&self, pair: PairKey) {
        self.failing.lock().unwrap().insert(pair);
    }

    /// Let connects for `pair` succeed again
    pub fn unfail_pair(&self, pair: PairKey) {
        self.failing.lock().unwrap().remove(&pair);
    }

    pub fn connect_call_count(&self) -> usize {
        self.connect_call_count.load(Ordering::SeqCst)
    }

    pub fn disconnect_call_count(&self) -> usize {
        self.disconnect_call_count.load(Ordering::SeqCst)
    }

    /// Requests in the order they were received
    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn disconnected(&self) -> Vec<TransportHandle> {
        self.disconnected.lock().unwrap().clone()
    }

    /// Create a new RecordingTransport that shares counters with an existing one
    pub fn sharing_counters_with(other: &Self) -> Self {
        Self {
            connect_call_count: Arc::clone(&other.connect_call_count),
            disconnect_call_count: Arc::clone(&other.disconnect_call_count),
            next_handle: Arc::clone(&other.next_handle),
            requests: Arc::clone(&other.requests),
            disconnected: Arc::clone(&other.disconnected),
            failing: Arc::clone(&other.failing),
            gate: other.gate.clone(),
        }
    }
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    async fn connect(&self, request: &ConnectRequest) -> Result<TransportHandle> {
        self.connect_call_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| Error::transport(e.to_string()))?
                .forget();
        }

        if self.failing.lock().unwrap().contains(&request.pair) {
            return Err(Error::transport(format!("refused: {}", request.server_address)));
        }
        Ok(TransportHandle::new(
            self.next_handle.fetch_add(1, Ordering::SeqCst),
        ))
    }

    async fn disconnect(&self, handle: TransportHandle) -> Result<()> {
        self.disconnect_call_count.fetch_add(1, Ordering::SeqCst);
        self.disconnected.lock().unwrap().push(handle);
        Ok(())
    }

    fn transport_name(&self) -> &'static str {
        "recording"
    }
}

/// Build an advertisement
pub fn nic(index: u32, speed: u64, addrs: &[&str]) -> NicAdvertisement {
    NicAdvertisement::new(index, speed, addrs.iter().map(|a| a.parse().unwrap()).collect())
}

/// Helper to create a minimal configuration for testing
pub fn minimal_config(max_channels: usize) -> MultichannelConfig {
    let mut config = MultichannelConfig::default();
    config.selector.max_channels = max_channels;
    config.engine.event_channel_capacity = 100;
    config.engine.shutdown_grace_ms = 2_000;
    config
}

/// Poll the engine until `check` accepts its channel list, or give up after 5 seconds
pub async fn wait_for_channels<F>(engine: &MultichannelEngine, check: F) -> Vec<ChannelStatus>
where
    F: Fn(&[ChannelStatus]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let channels = engine.channels().await;
        if check(&channels) {
            return channels;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached, channels: {:?}",
            channels
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `check` holds, or give up after 5 seconds
pub async fn wait_until<F>(check: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
