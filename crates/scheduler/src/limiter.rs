//! Per-provider admission control.

use std::sync::Arc;

use crate::jobs::{JobStore, JobStoreError};
use crate::queue::QueueRegistry;
use genqueue_core::ProviderId;

/// Caps simultaneously running jobs per provider.
///
/// The running count is recomputed from the job store on every call (never
/// cached), so concurrent claims and completions cannot make it drift. The
/// check-then-claim sequence stays race-tolerant because `claim_next` itself
/// is atomic; an over-admitted caller simply claims nothing.
#[derive(Debug)]
pub struct ConcurrencyLimiter<S> {
    store: Arc<S>,
    queues: Arc<QueueRegistry>,
}

impl<S: JobStore> ConcurrencyLimiter<S> {
    pub fn new(store: Arc<S>, queues: Arc<QueueRegistry>) -> Self {
        Self { store, queues }
    }

    /// Whether the caller may claim one more job for this provider.
    ///
    /// Disabled queues admit nothing.
    pub fn try_admit(&self, provider_id: &ProviderId) -> Result<bool, JobStoreError> {
        let queue = self.queues.get_or_create(provider_id);
        if !queue.enabled {
            return Ok(false);
        }
        let running = self.store.count_running(provider_id)?;
        Ok(running < queue.max_concurrent)
    }
}
