use crate::rate_limit::ceil_secs;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Brute-force lockout parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct LockoutConfig {
    /// Failed logins that trigger a lock.
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    /// How long a lock lasts.
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            duration_secs: default_duration_secs(),
        }
    }
}

fn default_threshold() -> u32 {
    5
}
fn default_duration_secs() -> u64 {
    15 * 60
}

/// Lock state of one actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutStatus {
    /// Whether further attempts are refused.
    pub locked: bool,
    /// Zero when not locked.
    pub retry_after_secs: u64,
}

impl LockoutStatus {
    const OPEN: Self = Self {
        locked: false,
        retry_after_secs: 0,
    };

    /// Refusal while earlier attempts are still being checked.
    const PENDING: Self = Self {
        locked: true,
        retry_after_secs: 1,
    };
}

struct LockoutEntry {
    failure_count: u32,
    /// Admitted attempts whose password check has not finished.
    in_flight: u32,
    locked_until: Option<Instant>,
    last_failure: Instant,
}

impl LockoutEntry {
    fn new(now: Instant) -> Self {
        Self {
            failure_count: 0,
            in_flight: 0,
            locked_until: None,
            last_failure: now,
        }
    }

    fn lock_status(&self, now: Instant) -> LockoutStatus {
        match self.locked_until {
            Some(until) if until > now => LockoutStatus {
                locked: true,
                retry_after_secs: ceil_secs(until - now),
            },
            _ => LockoutStatus::OPEN,
        }
    }
}

/// A login attempt admitted by [`LockoutTracker::begin_attempt`].
///
/// Until it is resolved with [`Self::fail`] or [`Self::succeed`], or
/// dropped, it counts toward the threshold like a failure would.
pub struct LoginAttempt<'a> {
    tracker: &'a LockoutTracker,
    key: String,
}

impl LoginAttempt<'_> {
    /// The password was wrong. Returns the key's status after counting it.
    pub fn fail(self) -> LockoutStatus {
        self.tracker.record_failed_login(&self.key)
    }

    /// The password was right. Clears the failures unless the key got locked
    /// while the check ran, in which case the lock wins.
    pub fn succeed(self) -> Result<(), LockoutStatus> {
        let now = Instant::now();
        let mut entries = self.tracker.entries.lock();
        match entries.get_mut(&self.key) {
            Some(entry) => {
                let status = entry.lock_status(now);
                if status.locked {
                    Err(status)
                } else {
                    entry.failure_count = 0;
                    entry.locked_until = None;
                    Ok(())
                }
            }
            None => Ok(()),
        }
    }
}

impl Drop for LoginAttempt<'_> {
    fn drop(&mut self) {
        let mut entries = self.tracker.entries.lock();
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
            if entry.in_flight == 0 && entry.failure_count == 0 && entry.locked_until.is_none() {
                entries.remove(&self.key);
            }
        }
    }
}

/// Counts failed logins per key and holds a timed lock once the threshold is
/// reached. Independent of the request-volume [`crate::RateLimiter`].
pub struct LockoutTracker {
    config: LockoutConfig,
    entries: Mutex<HashMap<String, LockoutEntry>>,
}

impl LockoutTracker {
    /// A tracker with no recorded failures.
    pub fn new(config: LockoutConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn duration(&self) -> Duration {
        Duration::from_secs(self.config.duration_secs)
    }

    fn threshold(&self) -> u32 {
        self.config.threshold.max(1)
    }

    /// Admit one password check for `key`, or refuse it.
    ///
    /// Refused when `key` is locked, or when recorded failures plus attempts
    /// already in flight would reach the threshold. Concurrent requests
    /// therefore never get more guesses evaluated than the threshold allows.
    pub fn begin_attempt(&self, key: &str) -> Result<LoginAttempt<'_>, LockoutStatus> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| LockoutEntry::new(now));

        if entry.locked_until.is_some_and(|until| until <= now) {
            entry.locked_until = None;
        }
        let status = entry.lock_status(now);
        if status.locked {
            return Err(status);
        }
        if entry.failure_count.saturating_add(entry.in_flight) >= self.threshold() {
            debug!(key, in_flight = entry.in_flight, "Login attempt deferred");
            return Err(LockoutStatus::PENDING);
        }

        entry.in_flight += 1;
        Ok(LoginAttempt {
            tracker: self,
            key: key.to_string(),
        })
    }

    /// Record one failed login for `key` and return the resulting status.
    /// Reaching the threshold starts a lock and resets the counter.
    pub fn record_failed_login(&self, key: &str) -> LockoutStatus {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| LockoutEntry::new(now));

        entry.failure_count = entry.failure_count.saturating_add(1);
        entry.last_failure = now;

        if entry.failure_count >= self.threshold() {
            let until = now + self.duration();
            entry.locked_until = Some(until);
            entry.failure_count = 0;
            warn!(key, duration_secs = self.config.duration_secs, "Lockout triggered");
            return LockoutStatus {
                locked: true,
                retry_after_secs: ceil_secs(until - now),
            };
        }

        entry.lock_status(now)
    }

    /// Report whether `key` is locked. An expired lock is cleared here.
    pub fn check_lockout(&self, key: &str) -> LockoutStatus {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return LockoutStatus::OPEN;
        };

        match entry.locked_until {
            Some(until) if until > now => LockoutStatus {
                locked: true,
                retry_after_secs: ceil_secs(until - now),
            },
            Some(_) => {
                entry.locked_until = None;
                if entry.failure_count == 0 && entry.in_flight == 0 {
                    entries.remove(key);
                }
                LockoutStatus::OPEN
            }
            None => LockoutStatus::OPEN,
        }
    }

    /// Forget every failure for `key`. Called on successful login.
    pub fn clear_failed_attempts(&self, key: &str) {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.in_flight > 0 => {
                entry.failure_count = 0;
                entry.locked_until = None;
            }
            Some(_) => {
                entries.remove(key);
            }
            None => {}
        }
    }

    /// Failures counted toward the next lock.
    pub fn failure_count(&self, key: &str) -> u32 {
        self.entries
            .lock()
            .get(key)
            .map_or(0, |e| e.failure_count)
    }

    /// Drop entries that are neither locked nor have a recent failure.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let idle = self.duration();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| {
            let locked = e.locked_until.is_some_and(|until| until > now);
            locked || e.in_flight > 0 || now.duration_since(e.last_failure) < idle
        });
        before - entries.len()
    }

    /// Number of tracked keys.
    pub fn tracked_keys(&self) -> usize {
        self.entries.lock().len()
    }

    /// Run [`Self::sweep`] once a minute until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = tracker.sweep();
                        if removed > 0 {
                            debug!(removed, "Swept idle lockout entries");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tracker(threshold: u32, duration_secs: u64) -> LockoutTracker {
        LockoutTracker::new(LockoutConfig {
            threshold,
            duration_secs,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_locks_at_threshold_and_resets_counter() {
        let t = tracker(3, 60);
        assert!(!t.record_failed_login("ip").locked);
        assert!(!t.record_failed_login("ip").locked);
        let status = t.record_failed_login("ip");
        assert!(status.locked);
        assert_eq!(status.retry_after_secs, 60);
        assert_eq!(t.failure_count("ip"), 0);

        let check = t.check_lockout("ip");
        assert!(check.locked);
        assert!(check.retry_after_secs > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_is_cleared_on_read() {
        let t = tracker(1, 10);
        assert!(t.record_failed_login("ip").locked);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!t.check_lockout("ip").locked);
        assert_eq!(t.tracked_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_resets_failures() {
        let t = tracker(5, 60);
        for _ in 0..4 {
            t.record_failed_login("ip");
        }
        assert_eq!(t.failure_count("ip"), 4);
        t.clear_failed_attempts("ip");
        assert_eq!(t.failure_count("ip"), 0);
        assert!(!t.record_failed_login("ip").locked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_while_locked_report_locked() {
        let t = tracker(2, 30);
        t.record_failed_login("ip");
        t.record_failed_login("ip");
        tokio::time::advance(Duration::from_secs(5)).await;
        let status = t.record_failed_login("ip");
        assert!(status.locked);
        assert_eq!(status.retry_after_secs, 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_locked_entries() {
        let t = tracker(1, 30);
        t.record_failed_login("locked");
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(t.sweep(), 0);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(t.sweep(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_attempts_count_toward_threshold() {
        let t = tracker(3, 60);
        let a = t.begin_attempt("ip").unwrap();
        let b = t.begin_attempt("ip").unwrap();
        let c = t.begin_attempt("ip").unwrap();
        assert_eq!(t.begin_attempt("ip").err(), Some(LockoutStatus::PENDING));

        assert!(!a.fail().locked);
        assert!(!b.fail().locked);
        // The third guess was never checked; its slot comes back.
        drop(c);
        let d = t.begin_attempt("ip").unwrap();
        assert!(d.fail().locked);

        let refused = t.begin_attempt("ip").err().unwrap();
        assert!(refused.locked);
        assert_eq!(refused.retry_after_secs, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_failures_unless_locked_meanwhile() {
        let t = tracker(5, 60);
        t.record_failed_login("ip");
        t.record_failed_login("ip");
        let attempt = t.begin_attempt("ip").unwrap();
        assert!(attempt.succeed().is_ok());
        assert_eq!(t.failure_count("ip"), 0);
        assert_eq!(t.tracked_keys(), 0);

        let t = tracker(1, 60);
        let attempt = t.begin_attempt("ip").unwrap();
        // Another path locks the key while the password check runs.
        t.record_failed_login("ip");
        let lock = attempt.succeed().unwrap_err();
        assert!(lock.locked);
        assert!(t.check_lockout("ip").locked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_admits_again() {
        let t = tracker(1, 10);
        assert!(t.begin_attempt("ip").unwrap().fail().locked);
        assert!(t.begin_attempt("ip").is_err());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(t.begin_attempt("ip").unwrap().succeed().is_ok());
    }

    #[tokio::test]
    async fn test_unknown_key_is_open() {
        let t = tracker(5, 60);
        assert_eq!(t.check_lockout("nobody"), LockoutStatus::OPEN);
        assert_eq!(t.failure_count("nobody"), 0);
    }
}
