//! `genqueue-provider`
//!
//! **Responsibility:** the provider-adapter boundary of the scheduler.
//!
//! This crate is intentionally **not** part of the scheduling machinery:
//! - It defines the capability set every generation service implements
//!   (`submit` / `check` / `cancel`), nothing about queues or retries.
//! - It must not depend on any concrete provider client library.
//! - It owns the startup-time adapter registry and the result-sink contract
//!   through which finished generations leave the scheduler.

pub mod adapter;
pub mod registry;
pub mod sink;

pub use adapter::{Outcome, PollError, ProviderAdapter, Submission, SubmissionError};
pub use registry::AdapterRegistry;
pub use sink::{MemorySink, ResultSink, SinkError};
