//! Cluster configuration.
//!
//! All durations are milliseconds. Every field has a serde default so a
//! partial JSON document is enough.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("heartbeatInterval ({interval}ms) must be shorter than heartbeatTimeout ({timeout}ms)")]
    HeartbeatTooSlow { interval: u64, timeout: u64 },
}

/// How cluster-wide requests decide they have heard from everyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AggregationPolicy {
    /// Track the live peer set; departures shrink what is still awaited.
    #[default]
    Membership,
    /// Snapshot the expected count; departures surface as timeouts.
    Count,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Quiet period after which a heartbeat is broadcast (default: 5s)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which a peer is considered gone (default: 10s)
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    /// How often stale peers are swept (default: 1s)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_ms: u64,

    /// Deadline for broadcast acks, fetches and server-side emits (default: 5s)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Deadline for session lock and handoff replies (default: 1s)
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,

    /// Noop keep-alive period while a handoff upgrade is pending (default: 200ms)
    #[serde(default = "default_noop_upgrade_interval")]
    pub noop_upgrade_interval_ms: u64,

    /// How long a new polling session is hidden from the application (default: 300ms)
    #[serde(default = "default_delayed_connection_timeout")]
    pub delayed_connection_timeout_ms: u64,

    /// Deadline for the probe exchange on a new transport (default: 10s)
    #[serde(default = "default_upgrade_timeout")]
    pub upgrade_timeout_ms: u64,

    #[serde(default)]
    pub aggregation: AggregationPolicy,

    /// Connection-state recovery; disabled when absent
    #[serde(default)]
    pub recovery: Option<RecoveryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryConfig {
    /// How long a disconnected session stays restorable (default: 2 min)
    #[serde(default = "default_max_disconnection_duration")]
    pub max_disconnection_duration_ms: u64,

    /// How often expired sessions and packets are evicted (default: 60s)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_disconnection_duration_ms: default_max_disconnection_duration(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    5_000
}

fn default_heartbeat_timeout() -> u64 {
    10_000
}

fn default_cleanup_interval() -> u64 {
    1_000
}

fn default_request_timeout() -> u64 {
    5_000
}

fn default_response_timeout() -> u64 {
    1_000
}

fn default_noop_upgrade_interval() -> u64 {
    200
}

fn default_delayed_connection_timeout() -> u64 {
    300
}

fn default_upgrade_timeout() -> u64 {
    10_000
}

fn default_max_disconnection_duration() -> u64 {
    2 * 60 * 1000
}

fn default_sweep_interval() -> u64 {
    60_000
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            cleanup_interval_ms: default_cleanup_interval(),
            request_timeout_ms: default_request_timeout(),
            response_timeout_ms: default_response_timeout(),
            noop_upgrade_interval_ms: default_noop_upgrade_interval(),
            delayed_connection_timeout_ms: default_delayed_connection_timeout(),
            upgrade_timeout_ms: default_upgrade_timeout(),
            aggregation: AggregationPolicy::default(),
            recovery: None,
        }
    }
}

impl ClusterConfig {
    /// Reject configurations under which peers would flap or timers spin.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("heartbeatIntervalMs", self.heartbeat_interval_ms),
            ("heartbeatTimeoutMs", self.heartbeat_timeout_ms),
            ("cleanupIntervalMs", self.cleanup_interval_ms),
            ("requestTimeoutMs", self.request_timeout_ms),
            ("responseTimeoutMs", self.response_timeout_ms),
            ("noopUpgradeIntervalMs", self.noop_upgrade_interval_ms),
            ("upgradeTimeoutMs", self.upgrade_timeout_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.heartbeat_interval_ms >= self.heartbeat_timeout_ms {
            return Err(ConfigError::HeartbeatTooSlow {
                interval: self.heartbeat_interval_ms,
                timeout: self.heartbeat_timeout_ms,
            });
        }
        if let Some(recovery) = &self.recovery {
            if recovery.sweep_interval_ms == 0 {
                return Err(ConfigError::ZeroDuration("recovery.sweepIntervalMs"));
            }
            if recovery.max_disconnection_duration_ms == 0 {
                return Err(ConfigError::ZeroDuration("recovery.maxDisconnectionDurationMs"));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}
