//! Generation job model and persistence.
//!
//! ## Components
//!
//! - `Job`: one generation request tracked through its lifecycle
//! - `JobStore`: persistence with atomic claiming (in-memory or Postgres)
//! - `RetryPolicy`: per-provider retry-delay configuration

pub mod postgres;
pub mod store;
pub mod types;

pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, FailureKind, Job, JobState, RetryPolicy, Transition, TransitionError,
};
