//! Retry policy for transient provider failures.
//!
//! Exponential backoff starting at a base delay, doubling per attempt up
//! to a cap, with ±50% jitter, bounded to a small fixed number of
//! attempts. Retryability is decided by error classification: network and
//! timeout errors and throttling/5xx statuses retry; malformed input and
//! auth errors do not.

use std::time::Duration;

use mnema_core::config::ProviderConfig;
use rand::Rng;

/// Retry budget and backoff shape for one provider call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum attempts, first try included.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt.
    pub base_delay: Duration,
    /// Cap on the computed delay (before jitter).
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Build from the provider section of the mnema config.
    #[must_use]
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Jittered delay before retry number `attempt` (0-based: the delay
    /// between the first failure and the second try).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = (self.base_delay.as_millis() as u64).saturating_mul(1 << attempt.min(16));
        let capped_ms = base_ms.min(self.max_delay.as_millis() as u64).max(1);
        // ±50% jitter to avoid thundering herds on shared rate limits.
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.5);
        Duration::from_millis(((capped_ms as f64) * factor) as u64)
    }

    /// Sleep out the jittered delay for retry number `attempt`.
    pub async fn backoff(&self, attempt: u32) {
        tokio::time::sleep(self.delay(attempt)).await;
    }
}

/// Whether an HTTP status represents a transient, retryable failure.
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_within_jitter_band() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        };
        for attempt in 0..6 {
            let expected_ms = (500u64 << attempt).min(8_000);
            let lower = expected_ms / 2;
            let upper = expected_ms + expected_ms / 2;
            for _ in 0..50 {
                let ms = policy.delay(attempt).as_millis() as u64;
                assert!(
                    (lower..=upper).contains(&ms),
                    "attempt {attempt}: {ms}ms outside [{lower}, {upper}]"
                );
            }
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        };
        // Far past the cap: even with +50% jitter, at most 12s.
        let ms = policy.delay(30).as_millis() as u64;
        assert!(ms <= 12_000);
    }

    #[test]
    fn retryable_status_classification() {
        for status in [429, 500, 502, 503, 504, 529] {
            assert!(is_retryable_status(status), "{status} should retry");
        }
        for status in [400, 401, 403, 404, 422] {
            assert!(!is_retryable_status(status), "{status} should not retry");
        }
    }

    #[test]
    fn from_config_enforces_at_least_one_attempt() {
        let config = ProviderConfig {
            max_attempts: 0,
            ..ProviderConfig::default()
        };
        assert_eq!(RetryPolicy::from_config(&config).max_attempts, 1);
    }
}
