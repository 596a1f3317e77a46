//! In-process counter store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::counter::WindowRecord;
use super::store::{CounterStore, RecordUpdate, StoreResult, Transition};

/// Counter store backed by a sharded concurrent map.
///
/// Updates run under the shard lock of their key, so concurrent checks for
/// the same identifier serialize while other identifiers proceed. Records do
/// not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, WindowRecord>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn update(&self, key: &str, op: &RecordUpdate) -> StoreResult<Transition> {
        let transition = match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let previous = *entry.get();
                let current = op(Some(previous));
                entry.insert(current);
                Transition {
                    previous: Some(previous),
                    current,
                }
            }
            Entry::Vacant(entry) => {
                let current = op(None);
                entry.insert(current);
                Transition {
                    previous: None,
                    current,
                }
            }
        };

        trace!(key = %key, count = transition.current.count, "Updated in-memory record");
        Ok(transition)
    }

    async fn purge_before(&self, cutoff: i64) -> StoreResult<usize> {
        let mut removed = 0;
        self.records.retain(|_, record| {
            let keep = record.window_start >= cutoff;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<WindowRecord>> {
        Ok(self.records.get(key).map(|r| *r))
    }

    async fn len(&self) -> StoreResult<usize> {
        Ok(self.records.len())
    }
}
