//! Sliding-window limiter for failed authentication attempts.
//!
//! Only failures are counted, so a client that reconnects often with a valid
//! token is never locked out.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Per-IP failure tracking over a rolling window.
#[derive(Debug)]
pub struct AuthRateLimiter {
    /// Maximum failures allowed within the window.
    max_failures: u32,
    window: Duration,
    /// Per-address failure timestamps.
    entries: HashMap<IpAddr, Vec<Instant>>,
}

impl Default for AuthRateLimiter {
    /// 5 failures per minute per address.
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}

impl AuthRateLimiter {
    pub fn new(max_failures: u32, window: Duration) -> Self {
        Self {
            max_failures,
            window,
            entries: HashMap::new(),
        }
    }

    /// Whether `ip` has exhausted its failure budget.
    pub fn is_blocked(&mut self, ip: &IpAddr) -> bool {
        let now = Instant::now();
        let window = self.window;
        match self.entries.get_mut(ip) {
            Some(failures) => {
                failures.retain(|t| now.duration_since(*t) < window);
                failures.len() as u32 >= self.max_failures
            }
            None => false,
        }
    }

    /// Record a failed attempt from `ip`.
    pub fn record_failure(&mut self, ip: IpAddr) {
        self.entries.entry(ip).or_default().push(Instant::now());
    }

    /// Drop addresses whose failures have all aged out.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.entries.retain(|_, failures| {
            failures.retain(|t| now.duration_since(*t) < window);
            !failures.is_empty()
        });
    }

    /// Number of addresses currently tracked.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}
