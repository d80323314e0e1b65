//! Per-connection configuration.
//!
//! Deliberately not loaded from environment variables or a config file —
//! spec.md §6 rules both out for this crate. Compare to the teacher's
//! `apolo-core::config::AppConfig`, which layers `config`/`dotenvy` sources
//! for an application; that pattern belongs at the application's edge, not
//! inside a connection-scoped library type.

use std::time::Duration;

/// Tunables for a single ESL connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// How long `send_api`/`send_command` wait for a correlated reply
    /// before failing with [`crate::EslError::Timeout`]. Default 5s.
    pub response_timeout: Duration,

    /// How long `exit` waits for the trailing `text/disconnect-notice`
    /// after its `command/reply` before treating the exit as successful
    /// anyway. Fixed at 2s per spec.md §4.4, but left as a field so tests
    /// can shrink it.
    pub disconnect_notice_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(5),
            disconnect_notice_timeout: Duration::from_secs(2),
        }
    }
}

impl ConnectionConfig {
    /// Start from the defaults and override the response timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = ConnectionConfig::default();
        assert_eq!(cfg.response_timeout, Duration::from_secs(5));
        assert_eq!(cfg.disconnect_notice_timeout, Duration::from_secs(2));
    }

    #[test]
    fn builder_overrides_response_timeout_only() {
        let cfg = ConnectionConfig::default().with_response_timeout(Duration::from_millis(250));
        assert_eq!(cfg.response_timeout, Duration::from_millis(250));
        assert_eq!(cfg.disconnect_notice_timeout, Duration::from_secs(2));
    }
}
