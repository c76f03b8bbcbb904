// # NIC Source Implementations
//
// This module provides implementations of the NicSource trait.

pub mod static_source;

pub use static_source::{StaticNicHandle, StaticNicSource, StaticNicSourceFactory};
