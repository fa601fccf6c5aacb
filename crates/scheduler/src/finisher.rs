//! Terminal-outcome handling shared by the dispatcher and the poller.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use genqueue_provider::ResultSink;

use crate::jobs::{FailureKind, Job, JobStore, JobStoreError};
use crate::queue::QueueRegistry;

/// Applies terminal outcomes: delivers results/errors to the sink and moves
/// jobs to their final state, honoring the per-provider retry policy.
pub(crate) struct Finisher<S> {
    store: Arc<S>,
    queues: Arc<QueueRegistry>,
    sink: Arc<dyn ResultSink>,
}

impl<S: JobStore> Finisher<S> {
    pub(crate) fn new(
        store: Arc<S>,
        queues: Arc<QueueRegistry>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            store,
            queues,
            sink,
        }
    }

    /// Deliver output to the sink and mark the job completed.
    pub(crate) fn complete(&self, job: &Job, output: &str) -> Result<(), JobStoreError> {
        match self.sink.write_result(job.conversation_id, output) {
            Ok(output_ref) => {
                self.store.mark_completed(job.id, &output_ref)?;
                info!(job_id = %job.id, output_ref = %output_ref, "generation completed");
                Ok(())
            }
            Err(e) => {
                // The generation succeeded but the result could not be
                // delivered; let the retry budget decide what happens next.
                warn!(job_id = %job.id, error = %e, "result sink rejected output");
                self.fail(job, &format!("result sink: {e}"), true)
            }
        }
    }

    /// Record a failure. Transient failures wait for the retry promoter;
    /// final ones are delivered to the sink as errors.
    ///
    /// A failure is final when the adapter says it is not retryable, the
    /// retry budget is exhausted, or auto-retry is off for the provider.
    pub(crate) fn fail(
        &self,
        job: &Job,
        error: &str,
        retryable: bool,
    ) -> Result<(), JobStoreError> {
        let queue = self.queues.get_or_create(&job.provider_id);
        let is_final = !retryable || !job.has_retry_budget() || !queue.auto_retry;
        let kind = if is_final {
            FailureKind::Permanent
        } else {
            FailureKind::Transient
        };

        self.store.mark_failed(job.id, error, kind)?;

        if is_final {
            warn!(job_id = %job.id, error = %error, retry_count = job.retry_count, "generation failed");
            if let Err(e) = self.sink.write_error(job.conversation_id, error) {
                error!(job_id = %job.id, error = %e, "could not deliver error to result sink");
            }
        } else {
            debug!(
                job_id = %job.id,
                error = %error,
                retry_count = job.retry_count,
                "generation failed; retry pending"
            );
        }
        Ok(())
    }

    /// The provider reported the remote job cancelled.
    pub(crate) fn cancelled(&self, job: &Job) -> Result<(), JobStoreError> {
        self.store.mark_cancelled(job.id)?;
        info!(job_id = %job.id, "generation cancelled remotely");
        Ok(())
    }
}
