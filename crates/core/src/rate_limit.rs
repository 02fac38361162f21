//! Fixed-window request counters keyed by caller identity.
//!
//! Counters live behind the [`CounterStore`] trait so the in-process table can
//! be replaced by a shared cache without touching the ingestion path.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::Serialize;

use crate::Clock;

pub const DEFAULT_WINDOW_MS: i64 = 60_000;
pub const DEFAULT_MAX_REQUESTS: u32 = 100;
pub const DEFAULT_SWEEP_THRESHOLD: usize = 10_000;

/// Limits enforced by a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
    /// Entry count above which expired entries are swept.
    pub sweep_threshold: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::milliseconds(DEFAULT_WINDOW_MS),
            max_requests: DEFAULT_MAX_REQUESTS,
            sweep_threshold: DEFAULT_SWEEP_THRESHOLD,
        }
    }
}

/// Counter state for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitEntry {
    fn opened(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            count: 1,
            reset_at: window_end(now, window),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.reset_at
    }
}

// Windows too long to represent end at the latest instant chrono can hold.
fn window_end(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Result of a single check-and-increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub allowed: bool,
    /// `true` when the hit opened a new window for the identity.
    pub created: bool,
    pub entry: RateLimitEntry,
}

/// Snapshot returned by [`RateLimiter::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// Storage for rate limit counters.
///
/// `hit` must be atomic per identity: no other caller may observe or modify the
/// entry between the limit check and the increment.
pub trait CounterStore: Send + Sync {
    fn hit(&self, identity: &str, now: DateTime<Utc>, window: Duration, max_requests: u32) -> Hit;

    fn peek(&self, identity: &str) -> Option<RateLimitEntry>;

    /// Removes entries whose window has passed and returns how many were dropped.
    fn sweep_expired(&self, now: DateTime<Utc>) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process [`CounterStore`] on a [`DashMap`]; each identity is updated
/// under its shard's write lock.
#[derive(Debug, Default)]
pub struct ShardedCounterStore {
    entries: DashMap<String, RateLimitEntry>,
}

impl ShardedCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for ShardedCounterStore {
    fn hit(&self, identity: &str, now: DateTime<Utc>, window: Duration, max_requests: u32) -> Hit {
        match self.entries.entry(identity.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    *entry = RateLimitEntry::opened(now, window);
                    return Hit {
                        allowed: true,
                        created: true,
                        entry: *entry,
                    };
                }
                if entry.count >= max_requests {
                    return Hit {
                        allowed: false,
                        created: false,
                        entry: *entry,
                    };
                }
                entry.count += 1;
                Hit {
                    allowed: true,
                    created: false,
                    entry: *entry,
                }
            }
            Entry::Vacant(vacant) => {
                let fresh = RateLimitEntry::opened(now, window);
                vacant.insert(fresh);
                Hit {
                    allowed: true,
                    created: true,
                    entry: fresh,
                }
            }
        }
    }

    fn peek(&self, identity: &str) -> Option<RateLimitEntry> {
        self.entries.get(identity).map(|entry| *entry)
    }

    fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Outcome of [`RateLimiter::admit_with_sweep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub swept: usize,
}

/// Fixed window counter gate.
///
/// A caller can burst up to twice the limit around a window boundary; this is
/// accepted in exchange for O(1) state per identity.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
    clock: Clock,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig, clock: Clock) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    /// Counts one request for `identity` and reports whether it may proceed.
    pub fn admit(&self, identity: &str) -> bool {
        self.admit_with_sweep(identity).allowed
    }

    /// Same as [`admit`](Self::admit), also reporting housekeeping done on the way.
    pub fn admit_with_sweep(&self, identity: &str) -> Admission {
        let now = (self.clock)();
        let hit = self
            .store
            .hit(identity, now, self.config.window, self.config.max_requests);

        let swept = if hit.created && self.store.len() > self.config.sweep_threshold {
            self.store.sweep_expired(now)
        } else {
            0
        };

        Admission {
            allowed: hit.allowed,
            swept,
        }
    }

    /// Reports the state for `identity` without counting a request.
    pub fn status(&self, identity: &str) -> RateLimitStatus {
        let now = (self.clock)();
        match self.store.peek(identity) {
            Some(entry) if !entry.is_expired(now) => RateLimitStatus {
                allowed: entry.count < self.config.max_requests,
                remaining: self.config.max_requests.saturating_sub(entry.count),
                reset_at: entry.reset_at,
            },
            _ => RateLimitStatus {
                allowed: true,
                remaining: self.config.max_requests.saturating_sub(1),
                reset_at: window_end(now, self.config.window),
            },
        }
    }

    pub fn tracked_identities(&self) -> usize {
        self.store.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        thread,
    };

    struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        fn start() -> Arc<Self> {
            let start = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .expect("timestamp")
                .with_timezone(&Utc);
            Arc::new(Self(Mutex::new(start)))
        }

        fn advance(&self, by: Duration) {
            let mut now = self.0.lock().expect("clock poisoned");
            *now += by;
        }

        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().expect("clock poisoned")
        }
    }

    fn limiter(max_requests: u32, sweep_threshold: usize) -> (RateLimiter, Arc<ManualClock>) {
        limiter_with_window(max_requests, sweep_threshold, Duration::milliseconds(60_000))
    }

    fn limiter_with_window(
        max_requests: u32,
        sweep_threshold: usize,
        window: Duration,
    ) -> (RateLimiter, Arc<ManualClock>) {
        let clock = ManualClock::start();
        let handle = clock.clone();
        let limiter = RateLimiter::new(
            Arc::new(ShardedCounterStore::new()),
            RateLimitConfig {
                window,
                max_requests,
                sweep_threshold,
            },
            Arc::new(move || handle.now()),
        );
        (limiter, clock)
    }

    #[test]
    fn admits_exactly_max_requests_per_window() {
        let (limiter, _clock) = limiter(3, 100);

        let results: Vec<bool> = (0..5).map(|_| limiter.admit("webhook:1.2.3.4")).collect();
        assert_eq!(results, vec![true, true, true, false, false]);
    }

    #[test]
    fn window_resets_after_expiry() {
        let (limiter, clock) = limiter(2, 100);
        assert!(limiter.admit("ip"));
        assert!(limiter.admit("ip"));
        assert!(!limiter.admit("ip"));

        // reset_at itself is still inside the window
        clock.advance(Duration::milliseconds(60_000));
        assert!(!limiter.admit("ip"));

        clock.advance(Duration::milliseconds(1));
        assert!(limiter.admit("ip"));
        assert_eq!(limiter.status("ip").remaining, 1);
    }

    #[test]
    fn identities_are_counted_independently() {
        let (limiter, _clock) = limiter(1, 100);
        assert!(limiter.admit("webhook:a"));
        assert!(!limiter.admit("webhook:a"));
        assert!(limiter.admit("webhook:b"));
    }

    #[test]
    fn status_reports_without_counting() {
        let (limiter, clock) = limiter(3, 100);
        let fresh = limiter.status("ip");
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 2);
        assert_eq!(fresh.reset_at, clock.now() + Duration::milliseconds(60_000));
        assert_eq!(limiter.tracked_identities(), 0);

        let opened_at = clock.now();
        for _ in 0..3 {
            limiter.admit("ip");
        }
        clock.advance(Duration::seconds(5));
        let exhausted = limiter.status("ip");
        assert!(!exhausted.allowed);
        assert_eq!(exhausted.remaining, 0);
        assert_eq!(exhausted.reset_at, opened_at + Duration::milliseconds(60_000));
    }

    #[test]
    fn sweep_drops_only_expired_entries() {
        let (limiter, clock) = limiter(10, 2);
        assert!(limiter.admit("old-1"));
        assert!(limiter.admit("old-2"));
        clock.advance(Duration::milliseconds(30_000));
        assert!(limiter.admit("live"));
        assert_eq!(limiter.tracked_identities(), 3);

        clock.advance(Duration::milliseconds(30_001));
        let admission = limiter.admit_with_sweep("new");
        assert!(admission.allowed);
        assert_eq!(admission.swept, 2);
        assert_eq!(limiter.tracked_identities(), 2);

        // "live" keeps its count from the still-open window
        for _ in 0..9 {
            assert!(limiter.admit("live"));
        }
        assert!(!limiter.admit("live"));
    }

    #[test]
    fn sweep_runs_only_above_threshold() {
        let (limiter, clock) = limiter(10, 5);
        limiter.admit("a");
        clock.advance(Duration::minutes(5));
        let admission = limiter.admit_with_sweep("b");
        assert_eq!(admission.swept, 0);
        assert_eq!(limiter.tracked_identities(), 2);
    }

    #[test]
    fn concurrent_admits_never_exceed_limit() {
        let (limiter, _clock) = limiter(50, 10_000);
        let admitted = AtomicUsize::new(0);

        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        if limiter.admit("webhook:shared") {
                            admitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::Relaxed), 50);
        assert_eq!(limiter.status("webhook:shared").remaining, 0);
    }

    #[test]
    fn oversized_window_saturates_instead_of_overflowing() {
        let (limiter, _clock) =
            limiter_with_window(2, 100, Duration::milliseconds(9_000_000_000_000_000));

        assert!(limiter.admit("webhook:1.2.3.4"));
        assert!(limiter.admit("webhook:1.2.3.4"));
        assert!(!limiter.admit("webhook:1.2.3.4"));
        let status = limiter.status("webhook:1.2.3.4");
        assert_eq!(status.reset_at, DateTime::<Utc>::MAX_UTC);
        assert_eq!(limiter.status("webhook:5.6.7.8").reset_at, DateTime::<Utc>::MAX_UTC);
    }
}
