use std::time::Duration;

use serde::{Deserialize, Serialize};
use vend_spec::{QueryDefaults, PROTOCOL_VERSION};

/// Endpoint used when none is configured.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080/command.php";

/// Floor for the correlator's poll interval.
pub const DEFAULT_MIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Connection and decoding settings for an [`crate::Agent`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Ledger endpoint URL.
    pub endpoint: String,
    /// Version string sent with every request.
    pub protocol_version: String,
    /// Budgets for queries given as bare SQL.
    pub query_defaults: QueryDefaults,
    /// Fail decoding when a query result is truncated.
    pub raise_on_query_truncate: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            query_defaults: QueryDefaults::default(),
            raise_on_query_truncate: true,
        }
    }
}

impl AgentConfig {
    /// Default settings against `endpoint`.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }
}

/// Dispatcher settings for a [`crate::ServiceAgent`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Kept from every refund to cover fees and processing.
    pub refund_fee: u64,
    /// Propagate handler errors to the caller of `work` instead of replying with them.
    pub raise_handler_errors: bool,
}

/// Options for [`crate::ServiceAgent::call`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CallOptions {
    /// Give up once this much time has passed without a reply. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Poll for the reply; otherwise return right after sending.
    pub wait_for_response: bool,
    /// Shortest pause between polls.
    pub min_poll_interval: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            wait_for_response: true,
            min_poll_interval: DEFAULT_MIN_POLL_INTERVAL,
        }
    }
}

impl CallOptions {
    /// Wait for the reply for at most `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    /// Send the call without waiting for a reply.
    pub fn fire_and_forget() -> Self {
        Self {
            wait_for_response: false,
            ..Self::default()
        }
    }

    /// Pause between polls grows with elapsed time, never below the floor.
    ///
    /// With a timeout the pause ends at most a millisecond past the deadline.
    pub fn poll_interval(&self, elapsed: Duration) -> Duration {
        let pause = (elapsed / 20).max(self.min_poll_interval);
        match self.timeout {
            Some(timeout) => {
                let remaining = timeout.saturating_sub(elapsed) + Duration::from_millis(1);
                pause.min(remaining)
            }
            None => pause,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol() {
        let config = AgentConfig::default();
        assert_eq!(config.protocol_version, "1_0");
        assert_eq!(config.query_defaults.max_time_cost, 1000);
        assert_eq!(config.query_defaults.max_size_cost, 100_000);
        assert!(config.raise_on_query_truncate);
        assert_eq!(ServiceConfig::default().refund_fee, 0);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"endpoint":"http://ledger.test/command.php"}"#).unwrap();
        assert_eq!(config.endpoint, "http://ledger.test/command.php");
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
        let service: ServiceConfig = serde_json::from_str(r#"{"refund_fee":3}"#).unwrap();
        assert_eq!(service.refund_fee, 3);
        assert!(!service.raise_handler_errors);
    }

    #[test]
    fn poll_interval_has_floor() {
        let options = CallOptions::default();
        assert_eq!(
            options.poll_interval(Duration::from_secs(1)),
            DEFAULT_MIN_POLL_INTERVAL
        );
        assert_eq!(
            options.poll_interval(Duration::from_secs(20)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn poll_interval_stops_at_deadline() {
        let options = CallOptions::with_timeout(Duration::from_millis(300));
        assert_eq!(
            options.poll_interval(Duration::from_millis(10)),
            DEFAULT_MIN_POLL_INTERVAL
        );
        assert_eq!(
            options.poll_interval(Duration::from_millis(200)),
            Duration::from_millis(101)
        );
        assert_eq!(
            options.poll_interval(Duration::from_millis(400)),
            Duration::from_millis(1)
        );
    }
}
