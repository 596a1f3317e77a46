//! Rate limiting logic and counter storage.

mod clock;
mod counter;
mod file;
mod limiter;
mod memory;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{advance, Quota, Verdict, WindowRecord};
pub use file::FileStore;
pub use limiter::{
    Decision, QuotaState, RateLimiter, DEFAULT_GRACE_MULTIPLIER, DEFAULT_STORE_TIMEOUT,
};
pub use memory::MemoryStore;
pub use store::{CounterStore, RecordUpdate, StoreError, StoreResult, Transition};
