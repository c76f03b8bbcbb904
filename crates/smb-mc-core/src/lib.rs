// # smb-mc-core
//
// Core library for the SMB2/3 multichannel connection manager.
//
// ## Architecture Overview
//
// The library discovers the network interfaces of a client and of a
// connected file server, pairs them into candidate paths, and decides
// which channels to establish, keep active, or retire:
// - **NicInventory**: Interfaces of one peer (client or server)
// - **candidate**: Cross product of both inventories with feasibility verdicts
// - **ConnectionRegistry**: One entry per pairing, indexed by client NIC and by success
// - **Selector**: Redundancy, promotion and demotion policy
// - **Coordinator**: Runs one reconciliation cycle per input
// - **MultichannelEngine**: Async shell around the coordinator
// - **PluginRegistry**: Plugin-based registry for transports and NIC sources
//
// ## Design Principles
//
// 1. **Separation of Concerns**: Policy is synchronous and I/O free; the engine owns all I/O
// 2. **Event-Driven**: NIC changes and connect results arrive as async streams
// 3. **Plugin-Based**: Transports and NIC sources are registered dynamically
// 4. **Library-First**: All core functionality can be used as a library
// 5. **Determinism**: Identical input always yields the same channel assignment

pub mod candidate;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod nic;
pub mod plugins;
pub mod registry;
pub mod selector;
pub mod source;
pub mod traits;

// Re-export core types for convenience
pub use config::{EngineConfig, MultichannelConfig, SelectorConfig, TransportConfig};
pub use coordinator::{Action, Coordinator};
pub use engine::{EngineEvent, MultichannelEngine};
pub use error::{Error, Result};
pub use nic::{NicAdvertisement, NicInventory, Peer};
pub use plugins::PluginRegistry;
pub use registry::{ChannelStatus, ConnectionRegistry, ConnectionState, PairKey};
pub use source::{StaticNicHandle, StaticNicSource};
pub use traits::{NicSource, Transport};
