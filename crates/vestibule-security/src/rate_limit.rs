use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Window parameters for one limiter instance.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl RateLimitConfig {
    /// `max_requests` per `window_ms` milliseconds.
    pub fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
        }
    }

    /// Window length as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

struct WindowEntry {
    count: u32,
    window_start: Instant,
}

/// Outcome of a [`RateLimiter::check`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Time until the current window ends.
    pub retry_after: Duration,
}

impl RateLimitDecision {
    /// `retry_after` rounded up to whole seconds, never zero.
    pub fn retry_after_secs(&self) -> u64 {
        ceil_secs(self.retry_after)
    }
}

/// Per-key window counter. Each key gets at most one live entry; a new
/// window starts on the first request after the previous one elapsed.
pub struct RateLimiter {
    name: &'static str,
    config: RateLimitConfig,
    entries: Mutex<HashMap<String, WindowEntry>>,
}

impl RateLimiter {
    /// Create a limiter. `name` only shows up in logs.
    pub fn new(name: &'static str, config: RateLimitConfig) -> Self {
        Self {
            name,
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request for `key` and decide whether it may proceed.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        let window = self.config.window();
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let entry = entries.entry(key.to_string()).or_insert(WindowEntry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count = entry.count.saturating_add(1);
        let allowed = entry.count <= self.config.max_requests;
        let retry_after = window.saturating_sub(now.duration_since(entry.window_start));

        if !allowed {
            debug!(limiter = self.name, key, count = entry.count, "Rate limit exceeded");
        }

        RateLimitDecision {
            allowed,
            retry_after,
        }
    }

    /// Remove entries whose window has elapsed. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let window = self.config.window();
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| now.duration_since(e.window_start) < window);
        before - entries.len()
    }

    /// Number of tracked keys.
    pub fn tracked_keys(&self) -> usize {
        self.entries.lock().len()
    }

    /// Sweep cadence: five windows.
    pub fn sweep_interval(&self) -> Duration {
        self.config.window().saturating_mul(5).max(Duration::from_millis(1))
    }

    /// Run [`Self::sweep`] every [`Self::sweep_interval`] until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limiter.sweep_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = limiter.sweep();
                        if removed > 0 {
                            debug!(limiter = limiter.name, removed, "Swept stale rate-limit entries");
                        }
                    }
                }
            }
        })
    }
}

pub(crate) fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}
