//! Sliding-window limit on messages per sender for unauthenticated sessions.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use parking_lot::Mutex;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitConfig {
    /// Messages permitted within the window
    pub messages: usize,
    /// Window length in seconds
    pub per_secs: u64,
}

/// Shared between all sessions of a listener.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    seen: Mutex<AHashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            limit: config.messages,
            window: Duration::from_secs(config.per_secs),
            seen: Mutex::new(AHashMap::new()),
        }
    }

    /// Record an attempt by `key`, returning `false` if it is over the limit.
    /// Refused attempts are not recorded.
    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> bool {
        let mut seen = self.seen.lock();

        // Forget senders whose whole window has passed
        seen.retain(|_, times| {
            times
                .back()
                .is_some_and(|last| now.duration_since(*last) < self.window)
        });

        let times = seen.entry(key.to_string()).or_default();
        while times
            .front()
            .is_some_and(|first| now.duration_since(*first) >= self.window)
        {
            times.pop_front();
        }

        if times.len() >= self.limit {
            return false;
        }

        times.push_back(now);
        true
    }
}
