//! Sliding-window limit on failed password attempts.
//!
//! Login is keyed by client IP and step-up by operator id. Only failures
//! count; a success clears the key.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::AuthConfig;

pub struct AttemptLimiter {
    max_attempts: usize,
    window: Duration,
    failures: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl AttemptLimiter {
    /// `max_attempts == 0` disables the limit.
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            max_attempts,
            window: window.max(Duration::from_secs(1)),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_secs(config.attempt_window_secs),
        )
    }

    /// `Err(retry_after)` while `key` has used up its attempts.
    pub fn check(&self, key: &str) -> Result<(), Duration> {
        self.check_at(key, Instant::now())
    }

    pub fn record_failure(&self, key: &str) {
        self.record_failure_at(key, Instant::now());
    }

    pub fn clear(&self, key: &str) {
        self.lock().remove(key);
    }

    fn check_at(&self, key: &str, now: Instant) -> Result<(), Duration> {
        if self.max_attempts == 0 {
            return Ok(());
        }
        let mut failures = self.lock();
        let Some(history) = failures.get_mut(key) else {
            return Ok(());
        };
        self.prune(history, now);
        if history.is_empty() {
            failures.remove(key);
            return Ok(());
        }
        if history.len() >= self.max_attempts {
            let oldest = history.front().copied().unwrap_or(now);
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            return Err(retry_after.max(Duration::from_secs(1)));
        }
        Ok(())
    }

    fn record_failure_at(&self, key: &str, now: Instant) {
        if self.max_attempts == 0 {
            return;
        }
        let mut failures = self.lock();
        // Drop keys whose window has passed so the map stays bounded.
        failures.retain(|_, history| {
            self.prune(history, now);
            !history.is_empty()
        });
        let history = failures.entry(key.to_string()).or_default();
        history.push_back(now);
        while history.len() > self.max_attempts {
            history.pop_front();
        }
    }

    fn prune(&self, history: &mut VecDeque<Instant>, now: Instant) {
        while let Some(front) = history.front() {
            if now.duration_since(*front) >= self.window {
                history.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<Instant>>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
