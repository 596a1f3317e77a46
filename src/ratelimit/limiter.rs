//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::clock::{Clock, SystemClock};
use super::counter::{advance, Quota, Verdict, WindowRecord};
use super::store::{CounterStore, StoreError};
use crate::error::Result;
use crate::identity::Identifier;

/// Default bound on a single counter store operation.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);
/// Default grace period, in window lengths, before an expired record is purged.
pub const DEFAULT_GRACE_MULTIPLIER: u64 = 1;

/// Quota metadata reported with every enforced decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaState {
    /// Requests allowed per window
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// Epoch seconds at which the current window closes
    pub reset_at: i64,
}

impl QuotaState {
    fn from_record(record: &WindowRecord, quota: &Quota) -> Self {
        Self {
            limit: quota.max_requests(),
            remaining: quota.max_requests().saturating_sub(record.count),
            reset_at: record.reset_at(quota),
        }
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request is within quota.
    Admitted(QuotaState),
    /// The window is exhausted.
    Rejected {
        quota: QuotaState,
        /// Seconds until the window closes
        retry_after: u64,
    },
    /// The counter store failed; the request is admitted unmetered.
    Degraded {
        /// Configured limit; remaining and reset are unknown
        limit: u64,
    },
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Decision::Rejected { .. })
    }
}

/// Fixed-window rate limiter over a shared counter store.
///
/// The limiter holds no per-identifier state of its own: every check is one
/// atomic read-modify-write through the store.
pub struct RateLimiter {
    /// Policy name, used in logs
    name: String,
    quota: Quota,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    grace_multiplier: u64,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("quota", &self.quota)
            .field("store_timeout", &self.store_timeout)
            .field("grace_multiplier", &self.grace_multiplier)
            .finish()
    }
}

impl RateLimiter {
    /// Create a rate limiter using the wall clock and default timeouts.
    pub fn new(name: impl Into<String>, quota: Quota, store: Arc<dyn CounterStore>) -> Self {
        Self {
            name: name.into(),
            quota,
            store,
            clock: Arc::new(SystemClock),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            grace_multiplier: DEFAULT_GRACE_MULTIPLIER,
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound each counter store operation.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Set how many window lengths an expired record is kept before cleanup.
    pub fn with_grace_multiplier(mut self, multiplier: u64) -> Self {
        self.grace_multiplier = multiplier;
        self
    }

    /// The policy name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The quota this limiter enforces.
    pub fn quota(&self) -> Quota {
        self.quota
    }

    /// The counter store behind this limiter, for inspecting stored records.
    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Run one admission check for `identifier`.
    ///
    /// Never fails: a store error or a store operation that exceeds the
    /// timeout yields [`Decision::Degraded`], which admits the request.
    pub async fn check(&self, identifier: &Identifier) -> Decision {
        let key = identifier.to_string();
        let now = self.clock.now();
        let quota = self.quota;

        trace!(policy = %self.name, identifier = %key, now, "Checking rate limit");

        // Spawned so the update still lands if this future is dropped or times out.
        let store = Arc::clone(&self.store);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            store
                .update(&task_key, &move |previous: Option<WindowRecord>| {
                    advance(previous, now, &quota).0
                })
                .await
        });

        let transition = match tokio::time::timeout(self.store_timeout, task).await {
            Ok(Ok(Ok(transition))) => transition,
            Ok(Ok(Err(e))) => return self.fail_open(&key, &e),
            Ok(Err(e)) => return self.fail_open(&key, &StoreError::Unavailable(e.to_string())),
            Err(_) => {
                let millis = self.store_timeout.as_millis() as u64;
                return self.fail_open(&key, &StoreError::Timeout(millis));
            }
        };

        // The store applied exactly this transition, so replaying it on the
        // observed record reproduces the verdict.
        let (record, verdict) = advance(transition.previous, now, &quota);
        let state = QuotaState::from_record(&record, &quota);

        match verdict {
            Verdict::Admit => {
                trace!(
                    policy = %self.name,
                    identifier = %key,
                    remaining = state.remaining,
                    "Request admitted"
                );
                Decision::Admitted(state)
            }
            Verdict::Reject { retry_after } => {
                debug!(
                    policy = %self.name,
                    identifier = %key,
                    limit = state.limit,
                    retry_after,
                    "Rate limit exceeded"
                );
                Decision::Rejected {
                    quota: state,
                    retry_after,
                }
            }
        }
    }

    /// Remove records whose window closed more than one grace period ago.
    ///
    /// Returns the number of records removed.
    pub async fn cleanup(&self) -> Result<usize> {
        let now = self.clock.now();
        let window = i64::try_from(self.quota.window_secs()).unwrap_or(i64::MAX);
        let grace = window.saturating_mul(i64::try_from(self.grace_multiplier).unwrap_or(i64::MAX));
        let cutoff = now.saturating_sub(window).saturating_sub(grace);

        let removed = self.store.purge_before(cutoff).await?;
        info!(policy = %self.name, removed, cutoff, "Purged stale rate limit records");
        Ok(removed)
    }

    fn fail_open(&self, key: &str, error: &StoreError) -> Decision {
        warn!(
            policy = %self.name,
            identifier = %key,
            error = %error,
            "Counter store unavailable, admitting request without enforcement"
        );
        Decision::Degraded {
            limit: self.quota.max_requests(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::memory::MemoryStore;
    use crate::ratelimit::store::{RecordUpdate, StoreResult, Transition};
    use async_trait::async_trait;

    fn ip(addr: &str) -> Identifier {
        Identifier::Address(addr.parse().unwrap())
    }

    fn limiter(max: u64, window: u64, clock: Arc<ManualClock>) -> RateLimiter {
        RateLimiter::new("test", Quota::new(max, window).unwrap(), Arc::new(MemoryStore::new()))
            .with_clock(clock)
    }

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn update(&self, _key: &str, _op: &RecordUpdate) -> StoreResult<Transition> {
            Err(StoreError::Io(std::io::Error::other("disk on fire")))
        }
        async fn purge_before(&self, _cutoff: i64) -> StoreResult<usize> {
            Err(StoreError::Unavailable("offline".to_string()))
        }
        async fn get(&self, _key: &str) -> StoreResult<Option<WindowRecord>> {
            Ok(None)
        }
        async fn len(&self) -> StoreResult<usize> {
            Ok(0)
        }
    }

    /// Delays every update, then applies it to an inner memory store.
    struct SlowStore {
        delay: Duration,
        inner: MemoryStore,
    }

    #[async_trait]
    impl CounterStore for SlowStore {
        async fn update(&self, key: &str, op: &RecordUpdate) -> StoreResult<Transition> {
            tokio::time::sleep(self.delay).await;
            self.inner.update(key, op).await
        }
        async fn purge_before(&self, cutoff: i64) -> StoreResult<usize> {
            self.inner.purge_before(cutoff).await
        }
        async fn get(&self, key: &str) -> StoreResult<Option<WindowRecord>> {
            self.inner.get(key).await
        }
        async fn len(&self) -> StoreResult<usize> {
            self.inner.len().await
        }
    }

    #[tokio::test]
    async fn test_worked_example() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(3, 60, clock.clone());
        let id = ip("1.2.3.4");

        let mut remaining = Vec::new();
        for t in 0..3 {
            clock.set(t);
            match limiter.check(&id).await {
                Decision::Admitted(state) => remaining.push(state.remaining),
                other => panic!("request at t={} should be admitted, got {:?}", t, other),
            }
        }
        assert_eq!(remaining, vec![2, 1, 0]);

        clock.set(3);
        match limiter.check(&id).await {
            Decision::Rejected { quota, retry_after } => {
                assert_eq!(retry_after, 57);
                assert_eq!(quota.remaining, 0);
                assert_eq!(quota.limit, 3);
                assert_eq!(quota.reset_at, 60);
            }
            other => panic!("fourth request should be rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_admissions_never_exceed_limit_within_window() {
        let clock = Arc::new(ManualClock::new(1_000));
        let limiter = limiter(5, 60, clock.clone());
        let id = ip("10.1.1.1");

        let mut admitted = 0;
        for step in 0..50 {
            clock.set(1_000 + step % 60);
            if limiter.check(&id).await.is_admitted() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn test_window_reset_after_full_window() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(2, 60, clock.clone());
        let id = ip("192.0.2.7");

        assert!(limiter.check(&id).await.is_admitted());
        assert!(limiter.check(&id).await.is_admitted());
        clock.set(59);
        assert!(!limiter.check(&id).await.is_admitted());

        clock.set(60);
        match limiter.check(&id).await {
            Decision::Admitted(state) => {
                assert_eq!(state.remaining, 1);
                assert_eq!(state.reset_at, 120);
            }
            other => panic!("expected a fresh window, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reject_does_not_consume_quota() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(1, 60, clock.clone());
        let id = ip("192.0.2.8");

        limiter.check(&id).await;
        for _ in 0..5 {
            limiter.check(&id).await;
        }

        let record = limiter.store().get(&id.to_string()).await.unwrap().unwrap();
        assert_eq!(record.count, 1);
    }

    #[tokio::test]
    async fn test_retry_after_tracks_window_end() {
        let clock = Arc::new(ManualClock::new(500));
        let limiter = limiter(1, 30, clock.clone());
        let id = ip("198.51.100.1");

        limiter.check(&id).await;
        for elapsed in [1, 10, 29] {
            clock.set(500 + elapsed);
            match limiter.check(&id).await {
                Decision::Rejected { retry_after, quota } => {
                    assert_eq!(retry_after as i64, quota.reset_at - (500 + elapsed));
                    assert_eq!(retry_after, 30 - elapsed as u64);
                }
                other => panic!("expected rejection, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_clock_going_backwards() {
        let clock = Arc::new(ManualClock::new(1_000));
        let limiter = limiter(2, 60, clock.clone());
        let id = ip("203.0.113.9");

        limiter.check(&id).await;
        clock.set(900);
        match limiter.check(&id).await {
            Decision::Admitted(state) => assert_eq!(state.remaining, 0),
            other => panic!("expected admission, got {:?}", other),
        }
        match limiter.check(&id).await {
            Decision::Rejected { retry_after, quota } => {
                assert_eq!(quota.remaining, 0);
                assert_eq!(retry_after, 160);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_admit_exactly_limit() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = Arc::new(limiter(25, 60, clock));
        let id = ip("203.0.113.50");

        let checks: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                let id = id.clone();
                tokio::spawn(async move { limiter.check(&id).await })
            })
            .collect();

        let admitted = futures::future::join_all(checks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .filter(|d| matches!(d, Decision::Admitted(_)))
            .count();

        assert_eq!(admitted, 25);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let limiter = RateLimiter::new("api", Quota::new(1, 60).unwrap(), Arc::new(BrokenStore));
        let id = ip("10.0.0.1");

        for _ in 0..3 {
            assert_eq!(limiter.check(&id).await, Decision::Degraded { limit: 1 });
        }
        assert!(limiter.cleanup().await.is_err());
    }

    #[tokio::test]
    async fn test_slow_store_fails_open_and_still_persists() {
        let store = Arc::new(SlowStore {
            delay: Duration::from_millis(100),
            inner: MemoryStore::new(),
        });
        let limiter = RateLimiter::new("api", Quota::new(5, 60).unwrap(), store.clone())
            .with_store_timeout(Duration::from_millis(10));
        let id = ip("10.0.0.2");

        assert_eq!(limiter.check(&id).await, Decision::Degraded { limit: 5 });

        // The abandoned update completes in the background
        tokio::time::sleep(Duration::from_millis(300)).await;
        let record = store.get(&id.to_string()).await.unwrap().unwrap();
        assert_eq!(record.count, 1);
    }

    #[tokio::test]
    async fn test_cleanup_respects_grace_period() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(10, 60, clock.clone());

        limiter.check(&ip("10.0.0.10")).await;
        clock.set(100);
        limiter.check(&ip("10.0.0.11")).await;

        // First window closed at 60; with a grace of 60 it becomes stale after 120
        clock.set(120);
        assert_eq!(limiter.cleanup().await.unwrap(), 0);

        clock.set(121);
        assert_eq!(limiter.cleanup().await.unwrap(), 1);
        assert!(limiter.store().get("ip_10.0.0.10").await.unwrap().is_none());
        assert!(limiter.store().get("ip_10.0.0.11").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_with_larger_grace() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(10, 60, clock.clone()).with_grace_multiplier(3);

        limiter.check(&ip("10.0.0.12")).await;
        clock.set(240);
        assert_eq!(limiter.cleanup().await.unwrap(), 0);
        clock.set(241);
        assert_eq!(limiter.cleanup().await.unwrap(), 1);
    }
}
