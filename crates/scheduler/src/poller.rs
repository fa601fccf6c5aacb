//! Status poller: re-checks running jobs and sweeps stale ones.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, warn};

use genqueue_provider::{AdapterRegistry, Outcome, ResultSink};

use crate::finisher::Finisher;
use crate::jobs::{Job, JobState, JobStore, JobStoreError};
use crate::queue::QueueRegistry;

/// Running jobs examined per pass.
const POLL_BATCH: usize = 256;

/// Counters from one poll pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Running jobs examined.
    pub polled: usize,
    /// Jobs that reached a terminal state from a status check.
    pub transitioned: usize,
    /// Jobs failed by the staleness sweep.
    pub timed_out: usize,
}

/// Re-checks asynchronous providers for every running job and applies the
/// reported outcome. Poll errors are logged and change nothing; the
/// staleness sweep bounds how long a silent provider can hold a job.
pub struct Poller<S> {
    store: Arc<S>,
    adapters: Arc<AdapterRegistry>,
    finisher: Finisher<S>,
    stale_after: Duration,
}

impl<S: JobStore> Poller<S> {
    pub fn new(
        store: Arc<S>,
        adapters: Arc<AdapterRegistry>,
        queues: Arc<QueueRegistry>,
        sink: Arc<dyn ResultSink>,
        stale_after: Duration,
    ) -> Self {
        Self {
            finisher: Finisher::new(store.clone(), queues, sink),
            store,
            adapters,
            stale_after,
        }
    }

    /// One bounded pass: status checks first, then the staleness sweep.
    pub fn run_once(&self) -> Result<PollSummary, JobStoreError> {
        let mut summary = PollSummary::default();

        for job in self.store.list_in_state(JobState::Running, POLL_BATCH)? {
            summary.polled += 1;
            match self.check_job(&job) {
                Ok(true) => summary.transitioned += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "could not record status-check outcome");
                }
            }
        }

        let cutoff =
            Utc::now() - chrono::Duration::from_std(self.stale_after).unwrap_or_default();
        for job in self.store.list_stale_running(cutoff)? {
            warn!(
                job_id = %job.id,
                last_activity = %job.last_activity_at(),
                "running job went stale"
            );
            match self.finisher.fail(&job, "timeout", true) {
                Ok(()) => summary.timed_out += 1,
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "could not fail stale job");
                }
            }
        }

        Ok(summary)
    }

    /// Returns whether the job reached a terminal state.
    fn check_job(&self, job: &Job) -> Result<bool, JobStoreError> {
        // No handle yet: submission is still in flight on a dispatcher
        // thread; the staleness sweep covers the pathological case.
        let Some(handle) = job.external_handle.as_deref() else {
            return Ok(false);
        };
        let Some(adapter) = self.adapters.get(&job.provider_id) else {
            return Ok(false);
        };
        if !adapter.is_async() {
            return Ok(false);
        }

        match adapter.check(handle) {
            Ok(Outcome::Running) => {
                self.store.record_poll(job.id)?;
                Ok(false)
            }
            Ok(Outcome::Completed(output)) => {
                self.finisher.complete(job, &output)?;
                Ok(true)
            }
            Ok(Outcome::Failed(message)) => {
                self.finisher.fail(job, &message, true)?;
                Ok(true)
            }
            Ok(Outcome::Cancelled) => {
                self.finisher.cancelled(job)?;
                Ok(true)
            }
            Err(e) => {
                // Transient; state untouched until the staleness timeout.
                warn!(job_id = %job.id, error = %e, "status check failed");
                Ok(false)
            }
        }
    }
}
