//! Dispatcher: claims queued jobs and submits them through adapters.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use genqueue_core::ProviderId;
use genqueue_provider::{AdapterRegistry, Outcome, ResultSink, Submission};

use crate::finisher::Finisher;
use crate::jobs::{Job, JobStore, JobStoreError};
use crate::limiter::ConcurrencyLimiter;
use crate::queue::QueueRegistry;

/// The dispatch pass: for every provider with capacity, atomically claim the
/// oldest queued job and submit it. Retry delays are never waited on here;
/// failed jobs rest in `failed` until the retry promoter re-queues them.
pub struct Dispatcher<S> {
    store: Arc<S>,
    adapters: Arc<AdapterRegistry>,
    limiter: ConcurrencyLimiter<S>,
    finisher: Finisher<S>,
}

impl<S: JobStore> Dispatcher<S> {
    pub fn new(
        store: Arc<S>,
        adapters: Arc<AdapterRegistry>,
        queues: Arc<QueueRegistry>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            limiter: ConcurrencyLimiter::new(store.clone(), queues.clone()),
            finisher: Finisher::new(store.clone(), queues, sink),
            store,
            adapters,
        }
    }

    /// One bounded pass over every provider with queued work. Returns how
    /// many jobs were claimed and submitted.
    pub fn run_once(&self) -> Result<usize, JobStoreError> {
        let mut submitted = 0;
        for provider_id in self.store.providers_with_queued()? {
            submitted += self.dispatch_provider(&provider_id)?;
        }
        Ok(submitted)
    }

    /// Claim and submit for one provider while it has capacity and work.
    pub fn dispatch_provider(&self, provider_id: &ProviderId) -> Result<usize, JobStoreError> {
        let mut submitted = 0;
        while self.limiter.try_admit(provider_id)? {
            let Some(job) = self.store.claim_next(provider_id)? else {
                break;
            };
            if let Err(e) = self.submit(&job) {
                error!(job_id = %job.id, error = %e, "could not record submission outcome");
            }
            submitted += 1;
        }
        Ok(submitted)
    }

    fn submit(&self, job: &Job) -> Result<(), JobStoreError> {
        let Some(adapter) = self.adapters.get(&job.provider_id) else {
            return self.finisher.fail(
                job,
                &format!("no adapter registered for provider '{}'", job.provider_id),
                false,
            );
        };

        debug!(job_id = %job.id, provider = %job.provider_id, "submitting generation");

        match adapter.submit(&job.inputs) {
            Ok(Submission::Accepted(handle)) => {
                if let Err(e) = self.store.attach_handle(job.id, &handle) {
                    // The job left `running` while we were submitting (a
                    // cancel won the race); stop the remote side too.
                    warn!(job_id = %job.id, error = %e, "job moved during submission");
                    let _ = adapter.cancel(&handle);
                    return Ok(());
                }
                info!(job_id = %job.id, handle = %handle, "generation running remotely");
                Ok(())
            }
            Ok(Submission::Finished(outcome)) => {
                // Synchronous provider: the adapter ran the generation
                // inline. Synthesize a handle so the record still shows the
                // work reached the provider.
                let handle = format!("sync:{}", job.id);
                if let Err(e) = self.store.attach_handle(job.id, &handle) {
                    warn!(job_id = %job.id, error = %e, "job moved during submission");
                    return Ok(());
                }
                match outcome {
                    Outcome::Completed(output) => self.finisher.complete(job, &output),
                    Outcome::Failed(message) => self.finisher.fail(job, &message, true),
                    Outcome::Cancelled => self.finisher.cancelled(job),
                    Outcome::Running => self.finisher.fail(
                        job,
                        "synchronous adapter reported a running outcome",
                        false,
                    ),
                }
            }
            Err(e) => self.finisher.fail(job, &e.message, e.retryable),
        }
    }
}
