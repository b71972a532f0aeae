//! Sliding-window request rate limiting per client key.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::constants::{RATE_LIMIT_FRAMED, RATE_LIMIT_HTTP, RATE_LIMIT_IPC, RATE_WINDOW};

/// Sliding window of request timestamps per key.
pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Limiter allowing `max_requests` per `window` for each key.
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            window,
            max_requests,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Default policy for the HTTP surface (100 req/min).
    pub fn http() -> Self {
        Self::new(RATE_LIMIT_HTTP, RATE_WINDOW)
    }

    /// Default policy for framed stream connections (200 msgs/min).
    pub fn framed() -> Self {
        Self::new(RATE_LIMIT_FRAMED, RATE_WINDOW)
    }

    /// Default policy for the local control socket (1000 req/min).
    pub fn ipc() -> Self {
        Self::new(RATE_LIMIT_IPC, RATE_WINDOW)
    }

    /// Evicts expired timestamps for `key` and decides the request.
    /// On allow, the current timestamp joins the window.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let Ok(mut hits) = self.hits.lock() else {
            return true;
        };
        let window = hits.entry(key.to_string()).or_default();
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) >= self.window {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= self.max_requests {
            return false;
        }
        window.push_back(now);
        true
    }
}
