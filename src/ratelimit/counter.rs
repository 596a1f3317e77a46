//! Fixed-window counter state and the admission state transition.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

/// Quota applied to every identifier of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    max_requests: u64,
    window_secs: u64,
}

impl Quota {
    /// Create a quota. Both the limit and the window must be positive.
    pub fn new(max_requests: u64, window_secs: u64) -> Result<Self> {
        if max_requests == 0 {
            return Err(TollgateError::Config(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        if window_secs == 0 {
            return Err(TollgateError::Config(
                "window_secs must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            max_requests,
            window_secs,
        })
    }

    /// Requests allowed per window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Window length in seconds.
    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    fn window_len(&self) -> i64 {
        i64::try_from(self.window_secs).unwrap_or(i64::MAX)
    }
}

/// Per-identifier state held by a counter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRecord {
    /// Requests admitted in the current window
    pub count: u64,
    /// Epoch seconds at which the current window opened
    pub window_start: i64,
}

impl WindowRecord {
    /// A freshly opened, empty window.
    pub fn open(now: i64) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    /// Epoch seconds at which this window closes.
    pub fn reset_at(&self, quota: &Quota) -> i64 {
        self.window_start.saturating_add(quota.window_len())
    }

    /// Whether the window is over at `now`. A `now` earlier than the window
    /// start (clock skew) counts as not expired.
    pub fn is_expired(&self, now: i64, quota: &Quota) -> bool {
        now.saturating_sub(self.window_start) >= quota.window_len()
    }

    /// Whether the window closed more than `grace_secs` before `now`.
    pub fn is_stale(&self, now: i64, quota: &Quota, grace_secs: u64) -> bool {
        let grace = i64::try_from(grace_secs).unwrap_or(i64::MAX);
        now.saturating_sub(self.reset_at(quota)) > grace
    }
}

/// Outcome of one fixed-window step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The request consumed a slot.
    Admit,
    /// The window is full; retry after the given number of seconds.
    Reject { retry_after: u64 },
}

/// Apply one admission check to `previous` at time `now`.
///
/// Returns the record to persist and the verdict. A full window is never
/// incremented.
pub fn advance(previous: Option<WindowRecord>, now: i64, quota: &Quota) -> (WindowRecord, Verdict) {
    let mut record = previous.unwrap_or_else(|| WindowRecord::open(now));

    if record.is_expired(now, quota) {
        record = WindowRecord::open(now);
    }

    if record.count >= quota.max_requests {
        let retry_after = record.reset_at(quota).saturating_sub(now).max(0) as u64;
        return (record, Verdict::Reject { retry_after });
    }

    record.count += 1;
    (record, Verdict::Admit)
}
