// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

struct Window {
    start: Instant,
    accumulated: usize,
}

/// Byte-volume admission filter for outbound requests.
///
/// Callers report the size of each request before sending it. Once the bytes
/// admitted inside the current window reach the cap, the caller is held back
/// until the window has run out. Nothing is ever rejected.
pub struct RateLimiter {
    window: Duration,
    max_bytes: usize,
    state: Mutex<Window>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(window: Duration, max_bytes: usize) -> Self {
        RateLimiter {
            window,
            max_bytes,
            state: Mutex::new(Window {
                start: Instant::now(),
                accumulated: 0,
            }),
        }
    }

    pub async fn acquire(&self, bytes: usize) {
        // Held across the sleep so concurrent senders queue behind the throttled one.
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(state.start);
        if elapsed > self.window {
            state.start = now;
            state.accumulated = 0;
        }
        state.accumulated = state.accumulated.saturating_add(bytes);
        if state.accumulated >= self.max_bytes {
            let remaining = self
                .window
                .saturating_sub(now.duration_since(state.start));
            debug!(
                "Rate limit reached ({} bytes in window), pausing {} ms",
                state.accumulated,
                remaining.as_millis()
            );
            tokio::time::sleep(remaining).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_under_cap_is_not_delayed() {
        let limiter = RateLimiter::new(Duration::from_secs(1), 100);
        let begin = Instant::now();
        limiter.acquire(40).await;
        limiter.acquire(40).await;
        assert_eq!(begin.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaching_cap_waits_out_the_window() {
        let limiter = RateLimiter::new(Duration::from_secs(1), 100);
        let begin = Instant::now();
        limiter.acquire(60).await;
        tokio::time::advance(Duration::from_millis(300)).await;
        limiter.acquire(40).await;
        let waited = begin.elapsed();
        assert!(waited >= Duration::from_secs(1), "waited {waited:?}");
        assert!(waited < Duration::from_millis(1_100), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_window_resets_accumulator() {
        let limiter = RateLimiter::new(Duration::from_secs(1), 100);
        limiter.acquire(90).await;
        tokio::time::advance(Duration::from_millis(1_500)).await;
        let begin = Instant::now();
        limiter.acquire(90).await;
        assert_eq!(begin.elapsed(), Duration::ZERO);
    }
}
