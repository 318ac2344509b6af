//! Configuration types for Strata
//!
//! Section structs deserialized from TOML by the daemons; command-line
//! flags override file values, and arguments found in `STRATA_ARGS`
//! are prepended to the command line. Only the options that affect the
//! core subsystems are modeled; everything else keeps its default
//! behavior.

use serde::{Deserialize, Serialize};

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Monitor daemon tunables
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Client-side tunables (map client, capability cache)
    #[serde(default)]
    pub client: ClientConfig,
    /// Placement defaults
    #[serde(default)]
    pub placement: PlacementConfig,
}

/// Monitor daemon tunables
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between heartbeat ticks
    pub heartbeat_interval_secs: u64,
    /// Seconds to gather updates before proposing a map revision
    pub propose_interval_secs: f64,
    /// Seconds a down target stays in the map before being marked out
    pub down_out_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 5,
            propose_interval_secs: 1.0,
            down_out_interval_secs: 300,
        }
    }
}

/// Client-side tunables
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Seconds a capability session stays fresh without renewal
    pub session_ttl_secs: u64,
    /// Seconds to wait for the monitor handshake at mount time
    pub mount_timeout_secs: u64,
    /// Entries kept in the client metadata cache
    pub cache_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 60,
            mount_timeout_secs: 30,
            cache_size: 16384,
        }
    }
}

/// Placement defaults
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Default replica count for new pools
    pub default_replicas: u8,
    /// Bytes moved per recovery operation
    pub recovery_chunk_bytes: u64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            default_replicas: 2,
            recovery_chunk_bytes: 1 << 20,
        }
    }
}

/// Arguments injected from the `STRATA_ARGS` environment variable.
///
/// These are prepended to the real command line so explicit flags win.
#[must_use]
pub fn env_args() -> Vec<String> {
    std::env::var("STRATA_ARGS")
        .map(|v| v.split_whitespace().map(str::to_owned).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.monitor.heartbeat_interval_secs, 5);
        assert_eq!(c.client.session_ttl_secs, 60);
        assert_eq!(c.placement.default_replicas, 2);
    }

    #[test]
    fn test_partial_sections() {
        // missing sections fall back to defaults
        let c: Config = toml::from_str(
            r#"
            [client]
            session_ttl_secs = 120
            mount_timeout_secs = 10
            cache_size = 64
            "#,
        )
        .unwrap();
        assert_eq!(c.client.session_ttl_secs, 120);
        assert_eq!(c.monitor.down_out_interval_secs, 300);
    }
}
