//! Reconnection policy: linear backoff with a ceiling.

use crate::transport::DisconnectReason;
use std::time::Duration;

/// What to do after the transport reported a close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another connection attempt
    Retry,
    /// Give up; the session becomes STOPPED
    Stop,
}

/// Computes retry delays from the consecutive failure count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectionPolicy {
    /// Delay added per consecutive failure
    pub base: Duration,
    /// Ceiling for any computed delay
    pub cap: Duration,
    /// Fixed delay after a failed connection setup
    pub fallback: Duration,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(2000),
            cap: Duration::from_millis(30_000),
            fallback: Duration::from_millis(5000),
        }
    }
}

impl ReconnectionPolicy {
    /// `min(base * max(attempts, 1), cap)`
    pub fn delay(&self, attempts: u32) -> Duration {
        self.base.saturating_mul(attempts.max(1)).min(self.cap)
    }

    /// Delay after an error while establishing the connection
    pub fn fallback_delay(&self) -> Duration {
        self.fallback
    }

    /// Only a permanent revocation without local credentials stops the session.
    pub fn decide(&self, reason: DisconnectReason, credentials_present: bool) -> RetryDecision {
        if reason.is_permanent_revocation() && !credentials_present {
            RetryDecision::Stop
        } else {
            RetryDecision::Retry
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff_is_capped() {
        let policy = ReconnectionPolicy::default();
        let delays: Vec<u64> = (1..=17).map(|n| policy.delay(n).as_millis() as u64).collect();
        assert_eq!(
            delays,
            vec![
                2000, 4000, 6000, 8000, 10000, 12000, 14000, 16000, 18000, 20000, 22000, 24000,
                26000, 28000, 30000, 30000, 30000
            ]
        );
    }

    #[test]
    fn test_zero_attempts_uses_first_step() {
        let policy = ReconnectionPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(2000));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_decide() {
        let policy = ReconnectionPolicy::default();
        assert_eq!(policy.decide(DisconnectReason::LoggedOut, false), RetryDecision::Stop);
        assert_eq!(policy.decide(DisconnectReason::LoggedOut, true), RetryDecision::Retry);
        assert_eq!(policy.decide(DisconnectReason::ConnectionLost, false), RetryDecision::Retry);
        assert_eq!(policy.decide(DisconnectReason::Other(999), false), RetryDecision::Retry);
    }
}
