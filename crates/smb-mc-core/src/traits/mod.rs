//! Collaborator interfaces of the multichannel core
//!
//! - [`Transport`]: open and close channels
//! - [`NicSource`]: report interface inventories and their changes

pub mod nic_source;
pub mod transport;

pub use nic_source::{NicChange, NicSource, NicSourceFactory};
pub use transport::{ConnectRequest, Transport, TransportFactory, TransportHandle};
