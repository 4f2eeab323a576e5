use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_heartbeat_interval_us() -> u64 {
    500_000
}

fn default_rpc_timeout_ms() -> u64 {
    5_000
}

fn default_max_clock_skew_us() -> u64 {
    50_000
}

/// Configuration of the client-side transaction coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnClientConfig {
    /// Interval between liveness heartbeats to the status tablet, in
    /// microseconds.
    #[serde(default = "default_heartbeat_interval_us")]
    pub heartbeat_interval_us: u64,
    /// Short-circuit every heartbeat after the initial CREATED round-trip.
    /// Test-only knob.
    #[serde(default)]
    pub disable_heartbeat_in_tests: bool,
    /// Deadline applied to every outgoing transaction RPC, in milliseconds.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Assumed maximum clock skew between this client and any server, in
    /// microseconds. Feeds the hybrid clock's uncertainty window.
    #[serde(default = "default_max_clock_skew_us")]
    pub max_clock_skew_us: u64,
}

impl TxnClientConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_micros(self.heartbeat_interval_us)
    }

    pub fn rpc_deadline(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

impl Default for TxnClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_us: default_heartbeat_interval_us(),
            disable_heartbeat_in_tests: false,
            rpc_timeout_ms: default_rpc_timeout_ms(),
            max_clock_skew_us: default_max_clock_skew_us(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = TxnClientConfig::default();
        assert_eq!(cfg.heartbeat_interval(), Duration::from_micros(500_000));
        assert_eq!(cfg.rpc_deadline(), Duration::from_millis(5_000));
        assert!(!cfg.disable_heartbeat_in_tests);
    }

    #[test]
    fn test_deserialize_with_partial_fields() {
        let cfg: TxnClientConfig =
            serde_json::from_str(r#"{ "heartbeat_interval_us": 1000 }"#).unwrap();
        assert_eq!(cfg.heartbeat_interval_us, 1000);
        assert_eq!(cfg.rpc_timeout_ms, 5_000);
        assert_eq!(cfg.max_clock_skew_us, 50_000);
    }
}
