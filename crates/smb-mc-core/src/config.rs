//! Configuration types for the multichannel core
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::nic::{NicAdvertisement, NicIndex};

/// Main multichannel configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultichannelConfig {
    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Selection policy
    #[serde(default)]
    pub selector: SelectorConfig,

    /// Optional engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Statically known client interfaces
    #[serde(default)]
    pub client_nics: Vec<NicAdvertisement>,

    /// Statically known server interfaces
    #[serde(default)]
    pub server_nics: Vec<NicAdvertisement>,
}

impl MultichannelConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON configuration document
    pub fn from_json_str(json: &str) -> Result<Self, crate::Error> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, crate::Error> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.transport.validate()?;
        self.selector.validate()?;

        if self.engine.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }

        for (peer, nics) in [("client", &self.client_nics), ("server", &self.server_nics)] {
            let mut seen = std::collections::BTreeSet::new();
            for nic in nics {
                if !seen.insert(nic.index) {
                    return Err(crate::Error::config(format!(
                        "Duplicate {} NIC index {}",
                        peer, nic.index
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Plain TCP channels
    Tcp {
        /// Connect timeout in milliseconds
        #[serde(default = "default_connect_timeout_ms")]
        connect_timeout_ms: u64,
        /// Port used when the server advertises port 0
        #[serde(default = "default_port")]
        default_port: u16,
    },

    /// Custom transport
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl TransportConfig {
    /// Validate the transport configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            TransportConfig::Tcp {
                connect_timeout_ms,
                default_port,
            } => {
                if *connect_timeout_ms == 0 {
                    return Err(crate::Error::config("TCP connect timeout must be > 0"));
                }
                if *default_port == 0 {
                    return Err(crate::Error::config("TCP default port must be > 0"));
                }
                Ok(())
            }
            TransportConfig::Custom { factory, config } => {
                if factory.is_empty() {
                    return Err(crate::Error::config(
                        "Custom transport factory cannot be empty",
                    ));
                }
                if config.is_null() {
                    return Err(crate::Error::config(
                        "Custom transport config cannot be null",
                    ));
                }
                Ok(())
            }
        }
    }

    /// Get the transport type name
    pub fn type_name(&self) -> &str {
        match self {
            TransportConfig::Tcp { .. } => "tcp",
            TransportConfig::Custom { factory, .. } => factory,
        }
    }

    /// Port substituted for an advertised port of 0
    pub fn default_port(&self) -> u16 {
        match self {
            TransportConfig::Tcp { default_port, .. } => *default_port,
            TransportConfig::Custom { .. } => default_port(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Tcp {
            connect_timeout_ms: default_connect_timeout_ms(),
            default_port: default_port(),
        }
    }
}

/// Selection policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Maximum number of channels (in trial or connected) at any time
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,

    /// Selector passes allowed per reconciliation before it is declared
    /// non-convergent. A cycle that changes anything needs at least one
    /// changing pass and one quiet pass, so the minimum is 2.
    #[serde(default = "default_max_passes")]
    pub max_passes: usize,

    /// Connect over IPv6 when both families are shared
    #[serde(default)]
    pub prefer_ipv6: bool,

    /// Client interfaces excluded from multichannel use
    #[serde(default)]
    pub blacklisted_client_nics: Vec<NicIndex>,

    /// Base delay before a failed pairing may be retried (in seconds)
    ///
    /// The delay doubles with every consecutive failure, up to
    /// `max_retry_backoff_secs`. Set to 0 to retry on the next pass.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,

    /// Upper bound on the retry delay (in seconds)
    #[serde(default = "default_max_retry_backoff_secs")]
    pub max_retry_backoff_secs: u64,
}

impl SelectorConfig {
    /// Validate the selection policy
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.max_channels == 0 {
            return Err(crate::Error::config("max_channels must be >= 1"));
        }
        if self.max_passes < 2 {
            return Err(crate::Error::config("max_passes must be >= 2"));
        }
        if self.retry_backoff_secs > self.max_retry_backoff_secs {
            return Err(crate::Error::config(
                "retry_backoff_secs cannot exceed max_retry_backoff_secs",
            ));
        }
        Ok(())
    }

    /// Delay before the next attempt after `failures` consecutive failures
    pub fn retry_backoff(&self, failures: u32) -> Option<chrono::Duration> {
        if self.retry_backoff_secs == 0 || failures == 0 {
            return None;
        }
        let shift = (failures - 1).min(32);
        let secs = self
            .retry_backoff_secs
            .saturating_mul(1u64 << shift)
            .min(self.max_retry_backoff_secs);
        Some(chrono::Duration::seconds(secs as i64))
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            max_channels: default_max_channels(),
            max_passes: default_max_passes(),
            prefer_ipv6: false,
            blacklisted_client_nics: Vec::new(),
            retry_backoff_secs: default_retry_backoff_secs(),
            max_retry_backoff_secs: default_max_retry_backoff_secs(),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the internal event channel
    ///
    /// When full, new engine events are dropped (with a warning log).
    ///
    /// Default: 1000 events
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// How long shutdown waits for in-flight connects and teardowns
    /// (in milliseconds)
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Additional metadata to attach to operations
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: default_event_channel_capacity(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            metadata: HashMap::new(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_port() -> u16 {
    445
}

fn default_max_channels() -> usize {
    4
}

fn default_max_passes() -> usize {
    8
}

fn default_retry_backoff_secs() -> u64 {
    1
}

fn default_max_retry_backoff_secs() -> u64 {
    300
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        assert!(MultichannelConfig::new().validate().is_ok());
    }

    #[test]
    fn test_zero_budget_rejected() {
        let mut config = MultichannelConfig::new();
        config.selector.max_channels = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_nic_rejected() {
        let mut config = MultichannelConfig::new();
        config.server_nics = vec![
            NicAdvertisement::new(1, 1_000, vec![]),
            NicAdvertisement::new(1, 2_000, vec![]),
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let selector = SelectorConfig {
            retry_backoff_secs: 5,
            max_retry_backoff_secs: 30,
            ..SelectorConfig::default()
        };
        assert_eq!(selector.retry_backoff(0), None);
        assert_eq!(selector.retry_backoff(1), Some(chrono::Duration::seconds(5)));
        assert_eq!(selector.retry_backoff(3), Some(chrono::Duration::seconds(20)));
        assert_eq!(selector.retry_backoff(10), Some(chrono::Duration::seconds(30)));
        assert_eq!(
            SelectorConfig::default().retry_backoff(4),
            Some(chrono::Duration::seconds(8))
        );
        let immediate = SelectorConfig {
            retry_backoff_secs: 0,
            ..SelectorConfig::default()
        };
        assert_eq!(immediate.retry_backoff(4), None);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "transport": {{ "type": "tcp", "connect_timeout_ms": 250 }},
                "selector": {{ "max_channels": 2, "blacklisted_client_nics": [3] }},
                "client_nics": [
                    {{ "index": 1, "speed": 1000000000, "addresses": ["10.0.0.1:0"] }}
                ],
                "server_nics": [
                    {{ "index": 10, "speed": 10000000000, "capabilities": 1,
                       "addresses": ["10.0.0.10:445", "[2001:db8::10]:445"] }}
                ]
            }}"#
        )
        .unwrap();

        let config = MultichannelConfig::from_json_file(file.path()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.selector.max_channels, 2);
        assert_eq!(config.selector.max_passes, 8);
        assert_eq!(config.selector.blacklisted_client_nics, vec![3]);
        assert_eq!(config.transport.default_port(), 445);
        assert_eq!(config.server_nics[0].addresses.len(), 2);
        assert!(config.server_nics[0]
            .capabilities
            .contains(crate::nic::NicCapabilities::RSS));
    }

    #[test]
    fn test_max_passes_needs_room_for_a_quiet_pass() {
        let mut config = MultichannelConfig::default();
        config.selector.max_passes = 1;
        assert!(config.validate().is_err());

        config.selector.max_passes = 2;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_custom_transport_requires_factory() {
        let config = TransportConfig::Custom {
            factory: String::new(),
            config: serde_json::json!({}),
        };
        assert!(config.validate().is_err());
    }
}
