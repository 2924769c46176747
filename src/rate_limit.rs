//! Per-identity throttle for reconciliation
//!
//! Every reconcile goes out to the payment provider, so each identity gets a
//! sliding window of provider-backed calls. Calls over the limit are served
//! from the store. Only call instants are kept; no entitlement state lives
//! here. DashMap keeps identities from contending on one lock.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Drop idle identities once every this many checks
const PRUNE_EVERY: u64 = 512;

/// Sliding-window call counter keyed by identity id
pub struct ReconcileThrottle {
    hits: DashMap<String, VecDeque<Instant>>,
    max_calls: usize,
    window: Duration,
    checks: AtomicU64,
}

impl ReconcileThrottle {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            hits: DashMap::new(),
            max_calls,
            window,
            checks: AtomicU64::new(0),
        }
    }

    /// `max_calls` per rolling minute
    pub fn per_minute(max_calls: usize) -> Self {
        Self::new(max_calls, Duration::from_secs(60))
    }

    /// Record a call for `identity_id` if it fits in the window
    pub fn allow(&self, identity_id: &str) -> bool {
        self.allow_at(identity_id, Instant::now())
    }

    fn allow_at(&self, identity_id: &str, now: Instant) -> bool {
        if self.checks.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune(now);
        }

        let (allowed, in_window) = {
            let mut calls = self.hits.entry(identity_id.to_string()).or_default();
            while calls
                .front()
                .is_some_and(|t| now.duration_since(*t) >= self.window)
            {
                calls.pop_front();
            }

            if calls.len() >= self.max_calls {
                (false, calls.len())
            } else {
                calls.push_back(now);
                (true, calls.len())
            }
        };

        if !allowed {
            debug!(
                identity = identity_id,
                calls = in_window,
                max = self.max_calls,
                "Reconcile throttle hit"
            );
        }
        allowed
    }

    /// Forget identities with no calls inside the window
    fn prune(&self, now: Instant) {
        let before = self.hits.len();
        self.hits.retain(|_, calls| {
            calls.retain(|t| now.duration_since(*t) < self.window);
            !calls.is_empty()
        });
        debug!(before = before, after = self.hits.len(), "Pruned reconcile throttle");
    }
}

impl Default for ReconcileThrottle {
    fn default() -> Self {
        Self::per_minute(30)
    }
}
