//! Rate-limit governor: one in-flight request per bucket, plus a global gate.
//!
//! Every REST call takes a [`Lease`] on its bucket before it is sent. The lease
//! holds the bucket's lock, so requests on one bucket are serialized while
//! distinct buckets proceed in parallel. The global gate is consulted by every
//! acquirer; a global 429 closes it until its reopen deadline.
//!
//! A lease releases its lock when dropped, so an error or a cancelled future
//! can never leave a bucket locked. [`RateLimiter::release`] and
//! [`RateLimiter::rate_limited`] additionally record what the response said
//! about the bucket's quota.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;

/// Last quota the server reported for a bucket.
#[derive(Debug, Clone, Default)]
struct BucketState {
    remaining: Option<u32>,
    reset_after: Option<Duration>,
    /// The next acquirer may not proceed before this instant.
    blocked_until: Option<Instant>,
}

/// Process-wide pause for all buckets.
#[derive(Debug, Default)]
struct GlobalGate {
    reopen_at: Mutex<Option<Instant>>,
}

impl GlobalGate {
    fn deadline(&self) -> Option<Instant> {
        let g = self.reopen_at.lock().unwrap_or_else(PoisonError::into_inner);
        g.filter(|d| *d > Instant::now())
    }

    /// Close for `dur` from now. An already later deadline is kept.
    fn close_for(&self, dur: Duration) {
        let until = Instant::now() + dur;
        let mut g = self.reopen_at.lock().unwrap_or_else(PoisonError::into_inner);
        if g.map_or(true, |d| d < until) {
            *g = Some(until);
        }
    }

    /// Wait until the gate is open. Re-checks after each sleep since the deadline can move.
    async fn wait_open(&self) {
        while let Some(deadline) = self.deadline() {
            log::debug!(
                "global rate limit: waiting {:?}",
                deadline.saturating_duration_since(Instant::now())
            );
            tokio::time::sleep_until(deadline).await;
        }
    }
}

/// Exclusive right to send one request on a bucket.
pub struct Lease {
    key: String,
    guard: OwnedMutexGuard<BucketState>,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("key", &self.key).finish()
    }
}

/// Snapshot of a bucket's last observed quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketQuota {
    pub remaining: Option<u32>,
    pub reset_after: Option<Duration>,
}

/// Per-bucket locks and the global gate. Share one instance per process (it is cheap to clone via `Arc`).
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Arc<AsyncMutex<BucketState>>>>,
    global: GlobalGate,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, key: &str) -> Arc<AsyncMutex<BucketState>> {
        let mut map = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(key.to_string())
            .or_insert_with(|| {
                log::debug!("rate limit: new bucket {}", key);
                Arc::new(AsyncMutex::new(BucketState::default()))
            })
            .clone()
    }

    /// Wait for the global gate, then take the bucket's lock, then honour any bucket delay.
    pub async fn acquire(&self, key: &str) -> Lease {
        let bucket = self.bucket(key);
        self.global.wait_open().await;
        let mut guard = bucket.lock_owned().await;
        // the gate may have closed while this caller queued on the bucket
        self.global.wait_open().await;
        if let Some(until) = guard.blocked_until.take() {
            if until > Instant::now() {
                log::debug!(
                    "rate limit: bucket {} exhausted, waiting {:?}",
                    key,
                    until.saturating_duration_since(Instant::now())
                );
                tokio::time::sleep_until(until).await;
                self.global.wait_open().await;
            }
        }
        Lease {
            key: key.to_string(),
            guard,
        }
    }

    /// Record the quota headers of a completed response and release the bucket.
    /// With `remaining == 0` the next acquirer waits `reset_after` first.
    pub fn release(&self, lease: Lease, remaining: Option<u32>, reset_after: Option<Duration>) {
        let Lease { key, mut guard } = lease;
        guard.remaining = remaining.or(guard.remaining);
        guard.reset_after = reset_after.or(guard.reset_after);
        if remaining == Some(0) {
            if let Some(wait) = reset_after {
                log::debug!("rate limit: bucket {} exhausted for {:?}", key, wait);
                guard.blocked_until = Some(Instant::now() + wait);
            }
        }
    }

    /// Record a 429. A global limit closes the gate for every bucket; a local
    /// one delays only this bucket. Either way the caller retries the request.
    pub fn rate_limited(&self, lease: Lease, retry_after: Duration, global: bool) {
        let Lease { key, mut guard } = lease;
        if global {
            log::warn!("global rate limit hit, pausing all requests for {:?}", retry_after);
            self.global.close_for(retry_after);
        } else {
            log::warn!("rate limited on {}, retrying in {:?}", key, retry_after);
            guard.remaining = Some(0);
            guard.blocked_until = Some(Instant::now() + retry_after);
        }
    }

    /// True while a global 429 is in effect.
    pub fn is_globally_limited(&self) -> bool {
        self.global.deadline().is_some()
    }

    /// Last quota seen for a bucket, if the bucket exists and is not currently leased.
    pub fn quota(&self, key: &str) -> Option<BucketQuota> {
        let bucket = {
            let map = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
            map.get(key).cloned()
        }?;
        let state = bucket.try_lock().ok()?;
        Some(BucketQuota {
            remaining: state.remaining,
            reset_after: state.reset_after,
        })
    }
}
