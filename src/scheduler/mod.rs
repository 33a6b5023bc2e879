pub mod job;
pub mod rate_limit;
pub mod selector;
pub mod version;

pub use job::{Job, Record, RecordState};
pub use rate_limit::DequeueRateLimiter;
pub use selector::{QueueSelector, WeightedQueueSelector};
