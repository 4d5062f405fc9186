//! Connection lifecycle: state enum and the bounded linear-backoff
//! reconnect policy.
//!
//! The state machine itself is driven by [`crate::client::SyncClient`];
//! this module owns the pure pieces so they stay unit-testable.

use std::time::Duration;

/// Client connection state. Exactly one instance per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Bounded retry with linearly growing delay: attempt N waits
/// `N × base_delay`. Once the cap is reached the engine stops retrying
/// and surfaces a terminal event; a fresh `connect()` call is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt. Linear, not exponential.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }

    /// Whether the given 1-based attempt exceeds the cap.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_linearly() {
        let policy = ReconnectPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(15));
    }

    #[test]
    fn test_cap() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.exhausted(1));
        assert!(!policy.exhausted(5));
        assert!(policy.exhausted(6));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }
}
