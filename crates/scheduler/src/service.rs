//! `GenerationScheduler`: the public facade over stores, queues, and loops.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info};

use genqueue_core::{ConversationId, JobId, ModelId, ProviderId};
use genqueue_provider::{AdapterRegistry, ResultSink};

use crate::dispatcher::Dispatcher;
use crate::jobs::{Job, JobState, JobStore, JobStoreError, TransitionError};
use crate::lock::ThreadLockManager;
use crate::poller::{PollSummary, Poller};
use crate::promoter::RetryPromoter;
use crate::queue::{ProviderQueue, QueueRegistry, QueueSettings, QueueStats};
use crate::worker::{spawn_ticker, WorkerHandle};

/// Retry budget used when callers have no opinion.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Window over which queue statistics are computed.
const STATS_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Jobs examined per admin operation (clear / bulk retry).
const ADMIN_BATCH: usize = 10_000;

/// Errors surfaced synchronously by the scheduler API.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The conversation already has a queued or running generation.
    #[error("conversation {0} already has an active generation")]
    Busy(ConversationId),
    #[error("no adapter registered for provider '{0}'")]
    UnknownProvider(ProviderId),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    InvalidTransition(TransitionError),
    #[error("scheduler already started")]
    AlreadyStarted,
    #[error("store error: {0}")]
    Store(JobStoreError),
}

impl From<JobStoreError> for SchedulerError {
    fn from(e: JobStoreError) -> Self {
        match e {
            JobStoreError::Busy(conversation_id) => SchedulerError::Busy(conversation_id),
            JobStoreError::NotFound(job_id) => SchedulerError::NotFound(job_id),
            JobStoreError::InvalidTransition(t) => SchedulerError::InvalidTransition(t),
            other => SchedulerError::Store(other),
        }
    }
}

/// Intervals and timeouts for the scheduler's periodic loops.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Full dispatch pass period (the wake channel makes enqueues faster).
    pub dispatch_interval: Duration,
    /// Status-check period; shorter than dispatch since running jobs need
    /// fresher answers than new submissions.
    pub poll_interval: Duration,
    /// Retry-promotion pass period.
    pub promote_interval: Duration,
    /// Retention-cleanup pass period.
    pub janitor_interval: Duration,
    /// A running job untouched for this long is treated as timed out.
    pub stale_after: Duration,
    /// Finished jobs older than this are purged by the janitor.
    pub retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(500),
            promote_interval: Duration::from_secs(15),
            janitor_interval: Duration::from_secs(60 * 60),
            stale_after: Duration::from_secs(10 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl SchedulerConfig {
    pub fn with_dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_promote_interval(mut self, interval: Duration) -> Self {
        self.promote_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// Handles for the four scheduler loops.
#[derive(Debug)]
pub struct SchedulerHandles {
    pub dispatcher: WorkerHandle,
    pub poller: WorkerHandle,
    pub promoter: WorkerHandle,
    pub janitor: WorkerHandle,
}

impl SchedulerHandles {
    /// Stop every loop and wait for the threads to finish.
    pub fn shutdown(self) {
        self.dispatcher.shutdown();
        self.poller.shutdown();
        self.promoter.shutdown();
        self.janitor.shutdown();
    }
}

/// Per-conversation generation statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Succeeded / total; 0.0 with no jobs.
    pub success_rate: f64,
    pub is_generating: bool,
    pub active_job: Option<JobId>,
}

/// The asynchronous generation job scheduler.
///
/// Owns the job store, provider queues, conversation gate, and the four
/// periodic loops (dispatcher, poller, retry promoter, janitor). Callers get
/// an immediate answer to "was this accepted" and observe the outcome
/// asynchronously via [`get_job`](Self::get_job) or the result sink.
pub struct GenerationScheduler<S: JobStore + 'static> {
    store: Arc<S>,
    adapters: Arc<AdapterRegistry>,
    queues: Arc<QueueRegistry>,
    locks: Arc<ThreadLockManager>,
    config: SchedulerConfig,
    dispatcher: Dispatcher<S>,
    poller: Poller<S>,
    promoter: RetryPromoter<S>,
    wake_tx: mpsc::Sender<ProviderId>,
    wake_rx: Mutex<Option<mpsc::Receiver<ProviderId>>>,
}

impl<S: JobStore + 'static> GenerationScheduler<S> {
    pub fn new(
        store: Arc<S>,
        adapters: Arc<AdapterRegistry>,
        sink: Arc<dyn ResultSink>,
        config: SchedulerConfig,
    ) -> Self {
        let queues = Arc::new(QueueRegistry::new());
        let locks = Arc::new(ThreadLockManager::new());
        let (wake_tx, wake_rx) = mpsc::channel();

        let dispatcher = Dispatcher::new(
            store.clone(),
            adapters.clone(),
            queues.clone(),
            sink.clone(),
        );
        let poller = Poller::new(
            store.clone(),
            adapters.clone(),
            queues.clone(),
            sink,
            config.stale_after,
        );
        let promoter = RetryPromoter::new(store.clone(), queues.clone(), locks.clone());

        Self {
            store,
            adapters,
            queues,
            locks,
            config,
            dispatcher,
            poller,
            promoter,
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
        }
    }

    /// Accept a generation request for a conversation.
    ///
    /// Fails fast with [`SchedulerError::Busy`] while the conversation has an
    /// active generation; everything after acceptance is asynchronous.
    pub fn submit_generation(
        &self,
        conversation_id: ConversationId,
        provider_id: ProviderId,
        model_id: ModelId,
        inputs: JsonValue,
        max_retries: u32,
    ) -> Result<JobId, SchedulerError> {
        if !self.adapters.contains(&provider_id) {
            return Err(SchedulerError::UnknownProvider(provider_id));
        }
        // The queue exists from the first job onwards.
        self.queues.get_or_create(&provider_id);

        let _lease = self.locks.acquire(self.store.as_ref(), conversation_id)?;
        let job = self.store.create(
            conversation_id,
            &provider_id,
            &model_id,
            inputs,
            max_retries,
        )?;
        if let Err(e) = self.store.enqueue(job.id) {
            // The draft never made it into the queue; retire it.
            let _ = self.store.mark_cancelled(job.id);
            return Err(e.into());
        }

        let _ = self.wake_tx.send(provider_id.clone());
        info!(
            job_id = %job.id,
            conversation_id = %conversation_id,
            provider = %provider_id,
            "generation job queued"
        );
        Ok(job.id)
    }

    /// Read-only snapshot of a job.
    pub fn get_job(&self, job_id: JobId) -> Result<Job, SchedulerError> {
        self.store
            .get(job_id)?
            .ok_or(SchedulerError::NotFound(job_id))
    }

    /// Cancel a job. Returns whether the cancellation applied; a job already
    /// in a terminal state yields `Ok(false)`.
    ///
    /// Local state is authoritative: a provider that ignores the remote
    /// cancel request does not block the local transition.
    pub fn cancel_job(&self, job_id: JobId) -> Result<bool, SchedulerError> {
        let job = self.get_job(job_id)?;
        match job.state {
            JobState::Draft | JobState::Queued | JobState::Running => {
                if job.state == JobState::Running {
                    if let (Some(handle), Some(adapter)) = (
                        job.external_handle.as_deref(),
                        self.adapters.get(&job.provider_id),
                    ) {
                        let acked = adapter.cancel(handle);
                        if !acked {
                            debug!(job_id = %job_id, "provider did not acknowledge cancel");
                        }
                    }
                }
                match self.store.mark_cancelled(job_id) {
                    Ok(()) => {
                        info!(job_id = %job_id, "generation cancelled");
                        Ok(true)
                    }
                    // The job finished while we were cancelling.
                    Err(JobStoreError::InvalidTransition(_)) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            JobState::Completed | JobState::Failed | JobState::Cancelled => Ok(false),
        }
    }

    /// Manually re-queue a failed job with remaining retry budget. Returns
    /// whether the retry was accepted.
    pub fn retry_job(&self, job_id: JobId) -> Result<bool, SchedulerError> {
        let job = self.get_job(job_id)?;
        if job.state != JobState::Failed || !job.has_retry_budget() {
            return Ok(false);
        }

        let _lease = self.locks.acquire(self.store.as_ref(), job.conversation_id)?;
        match self.store.requeue_for_retry(job_id) {
            Ok(requeued) => {
                let _ = self.wake_tx.send(job.provider_id.clone());
                info!(
                    job_id = %job_id,
                    retry_count = requeued.retry_count,
                    "generation manually re-queued"
                );
                Ok(true)
            }
            Err(JobStoreError::InvalidTransition(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Observability snapshot for a provider queue.
    pub fn get_queue_stats(&self, provider_id: &ProviderId) -> Result<QueueStats, SchedulerError> {
        let queue = self.queues.get_or_create(provider_id);
        let since = Utc::now() - chrono::Duration::from_std(STATS_WINDOW).unwrap_or_default();
        Ok(QueueStats::collect(self.store.as_ref(), &queue, since)?)
    }

    /// 1-based FIFO position of a queued job, `None` once it left the queue.
    pub fn queue_position(&self, job_id: JobId) -> Result<Option<usize>, SchedulerError> {
        Ok(self.store.queue_position(job_id)?)
    }

    /// Every job for a conversation, oldest first.
    pub fn generation_history(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Job>, SchedulerError> {
        Ok(self.store.list_for_conversation(conversation_id)?)
    }

    pub fn conversation_stats(
        &self,
        conversation_id: ConversationId,
    ) -> Result<ConversationStats, SchedulerError> {
        let jobs = self.store.list_for_conversation(conversation_id)?;
        let total = jobs.len();
        let succeeded = jobs
            .iter()
            .filter(|j| j.state == JobState::Completed)
            .count();
        let failed = jobs.iter().filter(|j| j.state == JobState::Failed).count();
        let active_job = jobs.iter().find(|j| j.is_active()).map(|j| j.id);

        Ok(ConversationStats {
            total,
            succeeded,
            failed,
            success_rate: if total == 0 {
                0.0
            } else {
                succeeded as f64 / total as f64
            },
            is_generating: active_job.is_some(),
            active_job,
        })
    }

    /// Enable or disable dispatching for a provider. Disabled queues still
    /// accept submissions.
    pub fn set_queue_enabled(&self, provider_id: &ProviderId, enabled: bool) -> ProviderQueue {
        let queue = self.queues.set_enabled(provider_id, enabled);
        info!(provider = %provider_id, enabled, "queue toggled");
        queue
    }

    /// Apply partial settings to a provider queue.
    pub fn configure_queue(
        &self,
        provider_id: &ProviderId,
        settings: QueueSettings,
    ) -> ProviderQueue {
        self.queues.configure(provider_id, settings)
    }

    /// Cancel every queued job for a provider; returns how many.
    pub fn clear_queue(&self, provider_id: &ProviderId) -> Result<usize, SchedulerError> {
        let queued = self.store.list_in_state(JobState::Queued, ADMIN_BATCH)?;
        let mut cancelled = 0;
        for job in queued.into_iter().filter(|j| &j.provider_id == provider_id) {
            match self.store.mark_cancelled(job.id) {
                Ok(()) => cancelled += 1,
                // Claimed while we were clearing; leave it be.
                Err(JobStoreError::InvalidTransition(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(provider = %provider_id, cancelled, "queue cleared");
        Ok(cancelled)
    }

    /// Manually re-queue every eligible failed job for a provider.
    pub fn retry_failed(&self, provider_id: &ProviderId) -> Result<usize, SchedulerError> {
        let failed = self.store.list_in_state(JobState::Failed, ADMIN_BATCH)?;
        let mut retried = 0;
        for job in failed.into_iter().filter(|j| &j.provider_id == provider_id) {
            match self.retry_job(job.id) {
                Ok(true) => retried += 1,
                Ok(false) => {}
                // Another job holds the conversation; skip this one.
                Err(SchedulerError::Busy(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(retried)
    }

    /// One dispatch pass over every provider with queued work.
    pub fn run_dispatcher_once(&self) -> Result<usize, SchedulerError> {
        Ok(self.dispatcher.run_once()?)
    }

    /// One status-check and staleness pass.
    pub fn run_poller_once(&self) -> Result<PollSummary, SchedulerError> {
        Ok(self.poller.run_once()?)
    }

    /// One retry-promotion pass.
    pub fn run_promoter_once(&self) -> Result<usize, SchedulerError> {
        Ok(self.promoter.run_once()?)
    }

    /// One retention pass; returns how many finished jobs were purged.
    pub fn run_janitor_once(&self) -> Result<usize, SchedulerError> {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(self.config.retention).unwrap_or_default();
        Ok(self.store.purge_terminal(cutoff)?)
    }

    /// Start the four periodic loops. Callable once per scheduler; callers
    /// keep their own `Arc` clone for the API surface.
    pub fn start(self: Arc<Self>) -> Result<SchedulerHandles, SchedulerError> {
        let wake_rx = self
            .wake_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(SchedulerError::AlreadyStarted)?;

        let scheduler = Arc::clone(&self);
        let tick = self.config.dispatch_interval;
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name("genqueue-dispatcher".to_string())
            .spawn(move || dispatcher_loop(scheduler, wake_rx, shutdown_rx, tick))
            .expect("failed to spawn dispatcher thread");
        let dispatcher = WorkerHandle::new(shutdown_tx, join);

        let s = Arc::clone(&self);
        let poller = spawn_ticker("genqueue-poller", self.config.poll_interval, move || {
            if let Err(e) = s.run_poller_once() {
                error!(error = %e, "poll pass failed");
            }
        });

        let s = Arc::clone(&self);
        let promoter = spawn_ticker(
            "genqueue-promoter",
            self.config.promote_interval,
            move || {
                if let Err(e) = s.run_promoter_once() {
                    error!(error = %e, "promotion pass failed");
                }
            },
        );

        let s = Arc::clone(&self);
        let janitor = spawn_ticker("genqueue-janitor", self.config.janitor_interval, move || {
            match s.run_janitor_once() {
                Ok(0) => {}
                Ok(purged) => info!(purged, "purged old generation jobs"),
                Err(e) => error!(error = %e, "retention pass failed"),
            }
        });

        info!("generation scheduler started");
        Ok(SchedulerHandles {
            dispatcher,
            poller,
            promoter,
            janitor,
        })
    }

    fn dispatch_provider(&self, provider_id: &ProviderId) -> Result<usize, SchedulerError> {
        Ok(self.dispatcher.dispatch_provider(provider_id)?)
    }
}

/// Dispatcher loop: wakes on demand right after an enqueue, and does a full
/// pass every tick to catch anything missed.
fn dispatcher_loop<S: JobStore + 'static>(
    scheduler: Arc<GenerationScheduler<S>>,
    wake_rx: mpsc::Receiver<ProviderId>,
    shutdown_rx: mpsc::Receiver<()>,
    tick: Duration,
) {
    info!("dispatcher started");
    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }
        match wake_rx.recv_timeout(tick) {
            Ok(provider_id) => {
                if let Err(e) = scheduler.dispatch_provider(&provider_id) {
                    error!(provider = %provider_id, error = %e, "dispatch failed");
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if let Err(e) = scheduler.run_dispatcher_once() {
                    error!(error = %e, "dispatch pass failed");
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("dispatcher stopped");
}
