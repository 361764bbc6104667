// src/validation/rate_limit.rs

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Sliding-window limiter keyed only by call time.
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    calls: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        RateLimiter {
            max_calls,
            window,
            calls: VecDeque::with_capacity(max_calls),
        }
    }

    /// Record a call if the window still has room.
    ///
    /// Rejected calls are not recorded.
    pub fn check(&mut self) -> bool {
        let now = Instant::now();
        while let Some(&oldest) = self.calls.front() {
            if now.duration_since(oldest) >= self.window {
                self.calls.pop_front();
            } else {
                break;
            }
        }

        if self.calls.len() < self.max_calls {
            self.calls.push_back(now);
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.calls.clear();
    }
}
