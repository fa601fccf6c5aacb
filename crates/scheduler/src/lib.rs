//! `genqueue-scheduler` — durable scheduling for long-running generation jobs.
//!
//! ## Design
//!
//! - Jobs are conversation-scoped; at most one generation is active per
//!   conversation (the lock manager gates enqueue, a store-level uniqueness
//!   check is the durable backstop)
//! - Per-provider concurrency caps, recomputed from the store on every
//!   admission check
//! - Atomic FIFO claiming (`claim_next`) safe under concurrent dispatchers
//! - Transient failures rest in `failed` until the retry promoter re-queues
//!   them after the provider's delay; budgets bound every retry loop
//! - Four independent periodic loops: dispatcher, status poller, retry
//!   promoter, retention janitor
//!
//! ## Components
//!
//! - `jobs`: job model, state machine, in-memory and Postgres stores
//! - `queue`: per-provider configuration, health, statistics
//! - `limiter` / `lock`: admission control and conversation exclusivity
//! - `dispatcher` / `poller` / `promoter`: the moving parts
//! - `service`: the `GenerationScheduler` facade callers talk to

pub mod dispatcher;
mod finisher;
pub mod jobs;
pub mod limiter;
pub mod lock;
pub mod poller;
pub mod promoter;
pub mod queue;
pub mod service;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::Dispatcher;
pub use jobs::{
    BackoffStrategy, FailureKind, InMemoryJobStore, Job, JobState, JobStore, JobStoreError,
    PostgresJobStore, RetryPolicy,
};
pub use limiter::ConcurrencyLimiter;
pub use lock::{Lease, ThreadLockManager};
pub use poller::{PollSummary, Poller};
pub use promoter::RetryPromoter;
pub use queue::{ProviderQueue, QueueHealth, QueueRegistry, QueueSettings, QueueStats};
pub use service::{
    ConversationStats, GenerationScheduler, SchedulerConfig, SchedulerError, SchedulerHandles,
    DEFAULT_MAX_RETRIES,
};
pub use worker::WorkerHandle;
