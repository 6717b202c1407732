//! Per-client usage tracking for the analyze endpoint.
//!
//! Implements a fixed-window counter per client key: the first request in a
//! window resets the record to `count = 1`, subsequent requests within the
//! window increment the count until the limit, and a request after the
//! window has elapsed starts a fresh window.
//!
//! A fixed window is an accepted approximation: at a window boundary a
//! client can be admitted up to twice the nominal limit within a span just
//! under two windows. The counter is also intentionally not rolled back
//! when a later pipeline stage fails, so a client cannot evade the limit by
//! submitting payloads that fail cheaply.
//!
//! # Configuration
//!
//! - `max_requests`: requests allowed per window
//! - `window_secs`: window length in seconds
//! - `sweep_interval`: run an expired-record sweep every Nth check
//! - `max_tracked_keys`: hard cap on distinct client keys held in memory
//!
//! # Thread Safety
//!
//! State lives behind an `RwLock`; axum handlers run concurrently. A denied
//! outcome can be decided under the read lock, but every admission re-checks
//! under the write lock so two requests from the same client racing on a
//! window boundary cannot both be admitted past the limit.
//!
//! # Memory Management
//!
//! The key map would otherwise grow for the life of the process. Two
//! defenses bound it: a probabilistic sweep of expired records every
//! `sweep_interval` checks, and the `max_tracked_keys` hard cap. When the
//! cap is reached and an untracked key arrives, a sweep is forced; if the
//! map is still full the request is denied (the soft outcome, same as an
//! over-limit client).

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Advisory shown to clients that hit the limit. Throttling is reported as
/// a success-status payload, not a transport error.
pub const RATE_LIMIT_MESSAGE: &str =
    "Has alcanzado el límite de análisis por minuto. Espera un momento antes de intentarlo de nuevo.";

/// Time source for the tracker. Injectable so tests drive the window
/// deterministically.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;
}

/// Production clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Configuration for the usage tracker.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    /// Requests allowed per window.
    pub max_requests: u32,

    /// Window length in seconds.
    pub window_secs: u64,

    /// How often to sweep expired records (every N checks).
    pub sweep_interval: u64,

    /// Maximum number of distinct client keys to track.
    ///
    /// Bounds memory regardless of how many origins hit the endpoint. With
    /// typical entry overhead this keeps the map around a megabyte.
    pub max_tracked_keys: usize,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            // Two analyses per minute per client
            max_requests: 2,
            window_secs: 60,
            sweep_interval: 100,
            max_tracked_keys: 10_000,
        }
    }
}

/// One client's usage within the current window. Mutated only by
/// [`UsageTracker::check`].
#[derive(Debug, Clone, Copy)]
struct ClientUsageRecord {
    count: u32,
    window_start: Instant,
}

/// Outcome of a usage check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageDecision {
    /// Request admitted; the counter has been spent.
    Allowed,
    /// Request over the limit for this window. Soft outcome: the server
    /// reports success status with a `rateLimited` flag.
    Denied {
        /// User-facing advisory message.
        message: &'static str,
    },
}

impl UsageDecision {
    /// Whether the request was admitted.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Fixed-window usage tracker keyed by client.
///
/// Constructed once per process and injected into the router state; nothing
/// reaches it through globals.
pub struct UsageTracker {
    config: UsageConfig,
    clock: Box<dyn Clock>,
    state: RwLock<HashMap<String, ClientUsageRecord>>,
    // Counter for the probabilistic sweep
    check_count: AtomicU64,
}

impl UsageTracker {
    /// Creates a tracker with the given configuration and the system clock.
    #[must_use]
    pub fn new(config: UsageConfig) -> Self {
        Self::with_clock(config, Box::new(SystemClock))
    }

    /// Creates a tracker with an explicit clock. Used by tests to step
    /// through window boundaries deterministically.
    #[must_use]
    pub fn with_clock(config: UsageConfig, clock: Box<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: RwLock::new(HashMap::new()),
            check_count: AtomicU64::new(0),
        }
    }

    /// Checks whether a request from `client_key` is admitted, spending one
    /// unit of the client's window budget if so.
    ///
    /// The spend is not rolled back if a later pipeline stage fails.
    pub fn check(&self, client_key: &str) -> UsageDecision {
        let now = self.clock.now();
        let window = Duration::from_secs(self.config.window_secs);

        // Relaxed is fine: a missed or duplicate sweep is harmless.
        let count = self.check_count.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % self.config.sweep_interval == 0 {
            tracing::debug!(check_count = count, "running periodic usage sweep");
            self.sweep();
        }

        // Fast path: decide denial under the read lock.
        {
            let state = self
                .state
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);

            if let Some(record) = state.get(client_key) {
                let in_window = now.duration_since(record.window_start) <= window;
                if in_window && record.count >= self.config.max_requests {
                    tracing::warn!(
                        client = client_key,
                        count = record.count,
                        max = self.config.max_requests,
                        "rate limit exceeded"
                    );
                    return Self::denied();
                }
            } else if state.len() >= self.config.max_tracked_keys {
                drop(state);

                tracing::debug!(
                    max_tracked_keys = self.config.max_tracked_keys,
                    "key cap reached, forcing sweep"
                );
                self.sweep();

                let state = self
                    .state
                    .read()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if !state.contains_key(client_key) && state.len() >= self.config.max_tracked_keys {
                    tracing::warn!(
                        client = client_key,
                        tracked_keys = state.len(),
                        "denying new client: key cap reached"
                    );
                    return Self::denied();
                }
            }
        }

        // Admission mutates the record, so re-check everything under the
        // write lock; another request may have raced in between.
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if !state.contains_key(client_key) && state.len() >= self.config.max_tracked_keys {
            return Self::denied();
        }

        match state.get_mut(client_key) {
            Some(record) if now.duration_since(record.window_start) <= window => {
                if record.count >= self.config.max_requests {
                    tracing::warn!(
                        client = client_key,
                        count = record.count,
                        max = self.config.max_requests,
                        "rate limit exceeded"
                    );
                    return Self::denied();
                }
                record.count += 1;
            },
            Some(record) => {
                // Window elapsed: the stale record is superseded in place.
                *record = ClientUsageRecord {
                    count: 1,
                    window_start: now,
                };
            },
            None => {
                state.insert(
                    client_key.to_string(),
                    ClientUsageRecord {
                        count: 1,
                        window_start: now,
                    },
                );
            },
        }

        UsageDecision::Allowed
    }

    /// Removes records whose window has fully elapsed.
    ///
    /// Called probabilistically from [`check`](Self::check); also safe to
    /// call directly.
    pub fn sweep(&self) {
        let now = self.clock.now();
        let window = Duration::from_secs(self.config.window_secs);

        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        state.retain(|_, record| now.duration_since(record.window_start) <= window);
    }

    /// Number of client keys currently tracked. Useful for monitoring.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        let state = self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.len()
    }

    const fn denied() -> UsageDecision {
        UsageDecision::Denied {
            message: RATE_LIMIT_MESSAGE,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Test clock advanced explicitly by each test.
    struct ManualClock {
        now: Mutex<Instant>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                now: Mutex::new(Instant::now()),
            }
        }

        fn advance(&self, d: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += d;
        }
    }

    impl Clock for &ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }
    }

    fn tracker_with_clock(config: UsageConfig, clock: &'static ManualClock) -> UsageTracker {
        UsageTracker::with_clock(config, Box::new(clock))
    }

    fn leaked_clock() -> &'static ManualClock {
        Box::leak(Box::new(ManualClock::new()))
    }

    #[test]
    fn test_allows_up_to_limit_then_denies() {
        let clock = leaked_clock();
        let tracker = tracker_with_clock(UsageConfig::default(), clock);

        assert!(tracker.check("10.0.0.1").is_allowed());
        assert!(tracker.check("10.0.0.1").is_allowed());

        let third = tracker.check("10.0.0.1");
        assert_eq!(
            third,
            UsageDecision::Denied {
                message: RATE_LIMIT_MESSAGE
            }
        );
    }

    #[test]
    fn test_window_elapse_resets_counter() {
        let clock = leaked_clock();
        let tracker = tracker_with_clock(UsageConfig::default(), clock);

        assert!(tracker.check("client").is_allowed());
        assert!(tracker.check("client").is_allowed());
        assert!(!tracker.check("client").is_allowed());

        clock.advance(Duration::from_secs(61));

        assert!(tracker.check("client").is_allowed());
        assert!(tracker.check("client").is_allowed());
        assert!(!tracker.check("client").is_allowed());
    }

    #[test]
    fn test_boundary_instant_still_within_window() {
        // `now - window_start > W` is the reset condition, so a request at
        // exactly W is still inside the old window.
        let clock = leaked_clock();
        let tracker = tracker_with_clock(UsageConfig::default(), clock);

        assert!(tracker.check("client").is_allowed());
        assert!(tracker.check("client").is_allowed());

        clock.advance(Duration::from_secs(60));
        assert!(!tracker.check("client").is_allowed());
    }

    #[test]
    fn test_clients_tracked_separately() {
        let clock = leaked_clock();
        let tracker = tracker_with_clock(UsageConfig::default(), clock);

        assert!(tracker.check("a").is_allowed());
        assert!(tracker.check("a").is_allowed());
        assert!(!tracker.check("a").is_allowed());

        // b has its own budget
        assert!(tracker.check("b").is_allowed());
        assert!(tracker.check("b").is_allowed());
        assert!(!tracker.check("b").is_allowed());
    }

    #[test]
    fn test_denial_does_not_spend_budget() {
        let clock = leaked_clock();
        let tracker = tracker_with_clock(UsageConfig::default(), clock);

        assert!(tracker.check("client").is_allowed());
        assert!(tracker.check("client").is_allowed());
        for _ in 0..5 {
            assert!(!tracker.check("client").is_allowed());
        }

        clock.advance(Duration::from_secs(61));
        // Denied attempts above must not have extended the window.
        assert!(tracker.check("client").is_allowed());
    }

    #[test]
    fn test_sweep_removes_expired_records() {
        let clock = leaked_clock();
        let tracker = tracker_with_clock(UsageConfig::default(), clock);

        for i in 0..5 {
            assert!(tracker.check(&format!("client-{i}")).is_allowed());
        }
        assert_eq!(tracker.tracked_keys(), 5);

        clock.advance(Duration::from_secs(61));
        tracker.sweep();
        assert_eq!(tracker.tracked_keys(), 0);
    }

    #[test]
    fn test_key_cap_denies_new_clients() {
        let clock = leaked_clock();
        let config = UsageConfig {
            max_requests: 10,
            // High value so the probabilistic sweep stays out of the way
            sweep_interval: 1_000,
            max_tracked_keys: 3,
            ..UsageConfig::default()
        };
        let tracker = tracker_with_clock(config, clock);

        assert!(tracker.check("a").is_allowed());
        assert!(tracker.check("b").is_allowed());
        assert!(tracker.check("c").is_allowed());
        assert_eq!(tracker.tracked_keys(), 3);

        // New key at the cap is denied, tracked keys stay bounded
        assert!(!tracker.check("d").is_allowed());
        assert!(tracker.tracked_keys() <= 3);

        // Existing keys keep working
        assert!(tracker.check("a").is_allowed());
    }

    #[test]
    fn test_key_cap_reclaims_after_expiry() {
        let clock = leaked_clock();
        let config = UsageConfig {
            sweep_interval: 1_000,
            max_tracked_keys: 3,
            ..UsageConfig::default()
        };
        let tracker = tracker_with_clock(config, clock);

        assert!(tracker.check("a").is_allowed());
        assert!(tracker.check("b").is_allowed());
        assert!(tracker.check("c").is_allowed());

        clock.advance(Duration::from_secs(61));

        // The forced sweep at the cap reclaims expired entries
        assert!(tracker.check("d").is_allowed());
        assert!(tracker.tracked_keys() <= 3);
    }

    #[test]
    fn test_concurrent_same_key_never_over_admits() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::thread;

        let config = UsageConfig {
            max_requests: 2,
            ..UsageConfig::default()
        };
        let tracker = Arc::new(UsageTracker::new(config));
        let admitted = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                let admitted = Arc::clone(&admitted);
                thread::spawn(move || {
                    if tracker.check("same-client").is_allowed() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_default_config() {
        let config = UsageConfig::default();
        assert_eq!(config.max_requests, 2);
        assert_eq!(config.window_secs, 60);
        assert_eq!(config.sweep_interval, 100);
        assert_eq!(config.max_tracked_keys, 10_000);
    }
}
