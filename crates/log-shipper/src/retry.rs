// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// How often, and how patiently, a failed unit of work is attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Total attempts, no pause between them.
    Immediate(u32),
    /// Total attempts and the pause in milliseconds, multiplied by the attempt number.
    LinearBackoff(u32, u64),
}

impl RetryStrategy {
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryStrategy::Immediate(attempts) | RetryStrategy::LinearBackoff(attempts, _) => {
                (*attempts).max(1)
            }
        }
    }

    /// Whether another attempt is allowed after `attempt` attempts failed.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }

    /// Pause before the attempt following failed attempt number `attempt`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Immediate(_) => Duration::ZERO,
            RetryStrategy::LinearBackoff(_, millis) => {
                Duration::from_millis(millis.saturating_mul(u64::from(attempt)))
            }
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::LinearBackoff(5, 1_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_has_no_delay() {
        let strategy = RetryStrategy::Immediate(3);
        assert_eq!(strategy.delay(1), Duration::ZERO);
        assert!(strategy.should_retry(2));
        assert!(!strategy.should_retry(3));
    }

    #[test]
    fn test_linear_backoff_grows_with_attempts() {
        let strategy = RetryStrategy::LinearBackoff(4, 250);
        assert_eq!(strategy.delay(1), Duration::from_millis(250));
        assert_eq!(strategy.delay(3), Duration::from_millis(750));
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let strategy = RetryStrategy::Immediate(0);
        assert_eq!(strategy.max_attempts(), 1);
        assert!(!strategy.should_retry(1));
    }
}
