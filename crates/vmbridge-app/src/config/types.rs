//! Configuration types for the VM bridge
//!
//! Defines `Settings` and its sections. Every field has a serde default so a
//! partial (or empty) `config.toml` is always valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use vmbridge_client::ClientOptions;

use crate::governor::GovernorPolicy;
use crate::supervisor::{ReconnectPolicy, SupervisorOptions};

/// Streams subscribed by default: app logs, debugger events and
/// `postEvent` traffic from service extensions.
pub const DEFAULT_STREAMS: &[&str] = &["Logging", "Debug", "Extension"];

/// Lower bound for the metrics poll interval.
pub const POLL_INTERVAL_MIN_MS: u64 = 100;

/// Global settings from `.vmbridge/config.toml`
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub reconnect: ReconnectSettings,

    #[serde(default)]
    pub recovery: RecoverySettings,

    #[serde(default)]
    pub monitor: MonitorSettings,
}

impl Settings {
    /// Everything a [`Supervisor`](crate::supervisor::Supervisor) needs.
    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            client: self.connection.client_options(),
            reconnect: self.reconnect.policy(),
            poll_interval: self.monitor.poll_interval(),
            streams: self.monitor.streams.clone(),
        }
    }
}

/// Socket and request timeouts
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConnectionSettings {
    /// Per-call timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// WebSocket handshake timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ConnectionSettings {
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

/// Per-outage reconnect schedule used by the supervisor
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReconnectSettings {
    /// Delay before the first reconnect attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Multiplier applied per attempt
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Cap on any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Attempts per outage before giving up
    #[serde(default = "default_reconnect_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_reconnect_attempts(),
        }
    }
}

impl ReconnectSettings {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            factor: self.backoff_factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_reconnect_attempts() -> u32 {
    5
}

/// Budget enforced across outages by the recovery governor
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RecoverySettings {
    /// Recovery sequences allowed per window
    #[serde(default = "default_recovery_attempts")]
    pub max_attempts: u32,

    /// Quiet period after which the count resets
    #[serde(default = "default_reset_window_secs")]
    pub reset_window_secs: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_recovery_attempts(),
            reset_window_secs: default_reset_window_secs(),
        }
    }
}

impl RecoverySettings {
    pub fn policy(&self) -> GovernorPolicy {
        GovernorPolicy {
            max_attempts: self.max_attempts,
            reset_window: Duration::from_secs(self.reset_window_secs),
        }
    }
}

fn default_recovery_attempts() -> u32 {
    3
}

fn default_reset_window_secs() -> u64 {
    3_600
}

/// What the supervisor watches once connected
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MonitorSettings {
    /// `getMemoryUsage` poll interval in milliseconds (min 100)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Streams subscribed on every (re)connect
    #[serde(default = "default_streams")]
    pub streams: Vec<String>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            streams: default_streams(),
        }
    }
}

impl MonitorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(POLL_INTERVAL_MIN_MS))
    }
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_streams() -> Vec<String> {
    DEFAULT_STREAMS.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.connection.request_timeout_ms, 10_000);
        assert_eq!(settings.reconnect.base_delay_ms, 1_000);
        assert_eq!(settings.reconnect.backoff_factor, 1.5);
        assert_eq!(settings.reconnect.max_delay_ms, 30_000);
        assert_eq!(settings.reconnect.max_attempts, 5);
        assert_eq!(settings.recovery.max_attempts, 3);
        assert_eq!(settings.recovery.reset_window_secs, 3_600);
        assert_eq!(settings.monitor.streams, vec!["Logging", "Debug", "Extension"]);
    }

    #[test]
    fn test_empty_toml_is_default() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let settings: Settings = toml::from_str(
            r#"
[reconnect]
max_attempts = 8
"#,
        )
        .unwrap();
        assert_eq!(settings.reconnect.max_attempts, 8);
        assert_eq!(settings.reconnect.base_delay_ms, 1_000);
        assert_eq!(settings.recovery.max_attempts, 3);
    }

    #[test]
    fn test_poll_interval_is_clamped() {
        let monitor = MonitorSettings {
            poll_interval_ms: 5,
            ..MonitorSettings::default()
        };
        assert_eq!(monitor.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_supervisor_options_mapping() {
        let options = Settings::default().supervisor_options();
        assert_eq!(options.client.request_timeout, Duration::from_secs(10));
        assert_eq!(options.reconnect.base_delay, Duration::from_secs(1));
        assert_eq!(options.reconnect.max_delay, Duration::from_secs(30));
        assert_eq!(options.poll_interval, Duration::from_secs(2));
        assert_eq!(options.streams.len(), 3);
    }

    #[test]
    fn test_governor_policy_mapping() {
        let policy = RecoverySettings::default().policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.reset_window, Duration::from_secs(3_600));
    }
}
