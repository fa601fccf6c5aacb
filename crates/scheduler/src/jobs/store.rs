//! Job storage: trait plus the in-memory implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use genqueue_core::{ConversationId, JobId, ModelId, OutputRef, ProviderId};

use super::types::{FailureKind, Job, JobState, TransitionError};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// The conversation already has a queued or running job.
    #[error("conversation {0} already has an active generation")]
    Busy(ConversationId),
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable record of every generation job.
///
/// All transition operations validate legal source states and are idempotent
/// against duplicate delivery of the same outcome. `claim_next` is the only
/// contended operation and must be atomic: exactly one caller wins per job.
pub trait JobStore: Send + Sync {
    /// Create a draft job.
    fn create(
        &self,
        conversation_id: ConversationId,
        provider_id: &ProviderId,
        model_id: &ModelId,
        inputs: JsonValue,
        max_retries: u32,
    ) -> Result<Job, JobStoreError>;

    /// Draft → Queued. Rejects with `Busy` if the conversation already has an
    /// active job; this is the durable backstop behind the lock manager.
    fn enqueue(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    /// Atomically claim the oldest queued job for a provider (Queued →
    /// Running, FIFO by `queued_at`). Returns `None` when nothing is queued.
    fn claim_next(&self, provider_id: &ProviderId) -> Result<Option<Job>, JobStoreError>;

    /// Record the provider handle on a running job.
    fn attach_handle(&self, job_id: JobId, external_handle: &str) -> Result<(), JobStoreError>;

    fn mark_completed(&self, job_id: JobId, output_ref: &OutputRef) -> Result<(), JobStoreError>;

    fn mark_failed(
        &self,
        job_id: JobId,
        error: &str,
        failure: FailureKind,
    ) -> Result<(), JobStoreError>;

    fn mark_cancelled(&self, job_id: JobId) -> Result<(), JobStoreError>;

    /// Failed → Queued with `retry_count += 1`. Subject to the same
    /// single-flight check as `enqueue`.
    fn requeue_for_retry(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    /// Record a successful status check on a running job.
    fn record_poll(&self, job_id: JobId) -> Result<(), JobStoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Jobs in a state, oldest first, bounded by `limit`.
    fn list_in_state(&self, state: JobState, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Running jobs whose last activity is older than the cutoff.
    fn list_stale_running(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Providers that currently have queued work.
    fn providers_with_queued(&self) -> Result<Vec<ProviderId>, JobStoreError>;

    fn count_running(&self, provider_id: &ProviderId) -> Result<usize, JobStoreError>;

    fn count_queued(&self, provider_id: &ProviderId) -> Result<usize, JobStoreError>;

    fn count_active_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<usize, JobStoreError>;

    /// 1-based position of a queued job within its provider's FIFO queue.
    fn queue_position(&self, job_id: JobId) -> Result<Option<usize>, JobStoreError>;

    /// Every job for a conversation, oldest first.
    fn list_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Jobs for a provider that finished at or after `since`.
    fn list_finished_since(
        &self,
        provider_id: &ProviderId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Delete finished jobs older than the cutoff; returns how many.
    fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, JobStoreError>;
}

/// In-memory job store for tests/dev and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a transition closure on one job under the write lock.
    fn with_job<T>(
        &self,
        job_id: JobId,
        f: impl FnOnce(&mut Job) -> Result<T, TransitionError>,
    ) -> Result<T, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        Ok(f(job)?)
    }

    fn active_conflict(
        jobs: &HashMap<JobId, Job>,
        conversation_id: ConversationId,
        except: JobId,
    ) -> bool {
        jobs.values()
            .any(|j| j.conversation_id == conversation_id && j.id != except && j.is_active())
    }
}

impl JobStore for InMemoryJobStore {
    fn create(
        &self,
        conversation_id: ConversationId,
        provider_id: &ProviderId,
        model_id: &ModelId,
        inputs: JsonValue,
        max_retries: u32,
    ) -> Result<Job, JobStoreError> {
        let job = Job::new(
            conversation_id,
            provider_id.clone(),
            model_id.clone(),
            inputs,
            max_retries,
        );
        let mut jobs = self.jobs.write().unwrap();
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn enqueue(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let conversation_id = jobs
            .get(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?
            .conversation_id;
        if Self::active_conflict(&jobs, conversation_id, job_id) {
            return Err(JobStoreError::Busy(conversation_id));
        }
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        job.enqueue()?;
        Ok(job.clone())
    }

    fn claim_next(&self, provider_id: &ProviderId) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();

        let next = jobs
            .values()
            .filter(|j| j.state == JobState::Queued && &j.provider_id == provider_id)
            .min_by_key(|j| (j.queued_at.unwrap_or(j.created_at), *j.id.as_uuid()))
            .map(|j| j.id);

        match next {
            Some(job_id) => {
                let job = jobs
                    .get_mut(&job_id)
                    .ok_or(JobStoreError::NotFound(job_id))?;
                job.begin_running()?;
                Ok(Some(job.clone()))
            }
            None => Ok(None),
        }
    }

    fn attach_handle(&self, job_id: JobId, external_handle: &str) -> Result<(), JobStoreError> {
        self.with_job(job_id, |job| job.attach_handle(external_handle))
            .map(|_| ())
    }

    fn mark_completed(&self, job_id: JobId, output_ref: &OutputRef) -> Result<(), JobStoreError> {
        self.with_job(job_id, |job| job.complete(output_ref)).map(|_| ())
    }

    fn mark_failed(
        &self,
        job_id: JobId,
        error: &str,
        failure: FailureKind,
    ) -> Result<(), JobStoreError> {
        self.with_job(job_id, |job| job.fail(error, failure)).map(|_| ())
    }

    fn mark_cancelled(&self, job_id: JobId) -> Result<(), JobStoreError> {
        self.with_job(job_id, |job| job.cancel()).map(|_| ())
    }

    fn requeue_for_retry(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let conversation_id = jobs
            .get(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?
            .conversation_id;
        if Self::active_conflict(&jobs, conversation_id, job_id) {
            return Err(JobStoreError::Busy(conversation_id));
        }
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        job.requeue_for_retry()?;
        Ok(job.clone())
    }

    fn record_poll(&self, job_id: JobId) -> Result<(), JobStoreError> {
        self.with_job(job_id, |job| job.record_poll()).map(|_| ())
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.read().unwrap().get(&job_id).cloned())
    }

    fn list_in_state(&self, state: JobState, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs.values().filter(|j| j.state == state).cloned().collect();
        result.sort_by_key(|j| (j.created_at, *j.id.as_uuid()));
        result.truncate(limit);
        Ok(result)
    }

    fn list_stale_running(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.state == JobState::Running && j.last_activity_at() < older_than)
            .cloned()
            .collect();
        result.sort_by_key(|j| (j.created_at, *j.id.as_uuid()));
        Ok(result)
    }

    fn providers_with_queued(&self) -> Result<Vec<ProviderId>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut providers: Vec<_> = jobs
            .values()
            .filter(|j| j.state == JobState::Queued)
            .map(|j| j.provider_id.clone())
            .collect();
        providers.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        providers.dedup();
        Ok(providers)
    }

    fn count_running(&self, provider_id: &ProviderId) -> Result<usize, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        Ok(jobs
            .values()
            .filter(|j| j.state == JobState::Running && &j.provider_id == provider_id)
            .count())
    }

    fn count_queued(&self, provider_id: &ProviderId) -> Result<usize, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        Ok(jobs
            .values()
            .filter(|j| j.state == JobState::Queued && &j.provider_id == provider_id)
            .count())
    }

    fn count_active_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<usize, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        Ok(jobs
            .values()
            .filter(|j| j.conversation_id == conversation_id && j.is_active())
            .count())
    }

    fn queue_position(&self, job_id: JobId) -> Result<Option<usize>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let Some(job) = jobs.get(&job_id) else {
            return Err(JobStoreError::NotFound(job_id));
        };
        if job.state != JobState::Queued {
            return Ok(None);
        }
        let key = (job.queued_at.unwrap_or(job.created_at), *job.id.as_uuid());
        let ahead = jobs
            .values()
            .filter(|j| {
                j.state == JobState::Queued
                    && j.provider_id == job.provider_id
                    && (j.queued_at.unwrap_or(j.created_at), *j.id.as_uuid()) < key
            })
            .count();
        Ok(Some(ahead + 1))
    }

    fn list_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.conversation_id == conversation_id)
            .cloned()
            .collect();
        result.sort_by_key(|j| (j.created_at, *j.id.as_uuid()));
        Ok(result)
    }

    fn list_finished_since(
        &self,
        provider_id: &ProviderId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| {
                &j.provider_id == provider_id
                    && j.state.is_finished()
                    && j.finished_at.is_some_and(|f| f >= since)
            })
            .cloned()
            .collect();
        result.sort_by_key(|j| (j.finished_at, *j.id.as_uuid()));
        Ok(result)
    }

    fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let before = jobs.len();
        jobs.retain(|_, j| {
            !(j.state.is_finished() && j.finished_at.is_some_and(|f| f < older_than))
        });
        Ok(before - jobs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn store_with_queued(
        store: &InMemoryJobStore,
        provider: &ProviderId,
        n: usize,
    ) -> Vec<JobId> {
        (0..n)
            .map(|i| {
                let job = store
                    .create(
                        ConversationId::new(),
                        provider,
                        &ModelId::new("m"),
                        serde_json::json!({ "i": i }),
                        3,
                    )
                    .unwrap();
                store.enqueue(job.id).unwrap();
                // Distinct queued_at values keep the FIFO order unambiguous.
                std::thread::sleep(Duration::from_millis(2));
                job.id
            })
            .collect()
    }

    #[test]
    fn enqueue_and_claim_fifo() {
        let store = InMemoryJobStore::new();
        let provider = ProviderId::new("p");
        let ids = store_with_queued(&store, &provider, 3);

        let first = store.claim_next(&provider).unwrap().unwrap();
        assert_eq!(first.id, ids[0]);
        assert_eq!(first.state, JobState::Running);
        assert!(first.started_at.is_some());

        let second = store.claim_next(&provider).unwrap().unwrap();
        assert_eq!(second.id, ids[1]);
    }

    #[test]
    fn claim_is_scoped_per_provider() {
        let store = InMemoryJobStore::new();
        let provider = ProviderId::new("p");
        store_with_queued(&store, &provider, 1);

        assert!(store.claim_next(&ProviderId::new("other")).unwrap().is_none());
        assert!(store.claim_next(&provider).unwrap().is_some());
        assert!(store.claim_next(&provider).unwrap().is_none());
    }

    #[test]
    fn second_active_job_per_conversation_is_rejected() {
        let store = InMemoryJobStore::new();
        let provider = ProviderId::new("p");
        let conversation = ConversationId::new();

        let first = store
            .create(conversation, &provider, &ModelId::new("m"), serde_json::json!({}), 3)
            .unwrap();
        store.enqueue(first.id).unwrap();

        let second = store
            .create(conversation, &provider, &ModelId::new("m"), serde_json::json!({}), 3)
            .unwrap();
        let err = store.enqueue(second.id).unwrap_err();
        assert!(matches!(err, JobStoreError::Busy(c) if c == conversation));

        // Once the first job finishes, the conversation frees up.
        store.claim_next(&provider).unwrap().unwrap();
        store.mark_cancelled(first.id).unwrap();
        store.enqueue(second.id).unwrap();
    }

    #[test]
    fn terminal_marks_are_idempotent() {
        let store = InMemoryJobStore::new();
        let provider = ProviderId::new("p");
        let ids = store_with_queued(&store, &provider, 1);
        store.claim_next(&provider).unwrap().unwrap();

        let output_ref = OutputRef::new("msg-1");
        store.mark_completed(ids[0], &output_ref).unwrap();
        store.mark_completed(ids[0], &output_ref).unwrap();
        assert!(store.mark_completed(ids[0], &OutputRef::new("msg-2")).is_err());
    }

    #[test]
    fn requeue_respects_single_flight() {
        let store = InMemoryJobStore::new();
        let provider = ProviderId::new("p");
        let conversation = ConversationId::new();

        let failed = store
            .create(conversation, &provider, &ModelId::new("m"), serde_json::json!({}), 3)
            .unwrap();
        store.enqueue(failed.id).unwrap();
        store.claim_next(&provider).unwrap().unwrap();
        store
            .mark_failed(failed.id, "boom", FailureKind::Transient)
            .unwrap();

        // A fresh job takes the conversation while the failed one waits.
        let fresh = store
            .create(conversation, &provider, &ModelId::new("m"), serde_json::json!({}), 3)
            .unwrap();
        store.enqueue(fresh.id).unwrap();

        assert!(matches!(
            store.requeue_for_retry(failed.id).unwrap_err(),
            JobStoreError::Busy(_)
        ));

        store.mark_cancelled(fresh.id).unwrap();
        let requeued = store.requeue_for_retry(failed.id).unwrap();
        assert_eq!(requeued.state, JobState::Queued);
        assert_eq!(requeued.retry_count, 1);
    }

    #[test]
    fn queue_position_counts_ahead_of_job() {
        let store = InMemoryJobStore::new();
        let provider = ProviderId::new("p");
        let ids = store_with_queued(&store, &provider, 3);

        assert_eq!(store.queue_position(ids[0]).unwrap(), Some(1));
        assert_eq!(store.queue_position(ids[2]).unwrap(), Some(3));

        store.claim_next(&provider).unwrap().unwrap();
        assert_eq!(store.queue_position(ids[0]).unwrap(), None);
        assert_eq!(store.queue_position(ids[1]).unwrap(), Some(1));
    }

    #[test]
    fn stale_running_filters_by_last_activity() {
        let store = InMemoryJobStore::new();
        let provider = ProviderId::new("p");
        let ids = store_with_queued(&store, &provider, 1);
        store.claim_next(&provider).unwrap().unwrap();

        assert!(store.list_stale_running(Utc::now() - chrono::Duration::seconds(60)).unwrap().is_empty());

        std::thread::sleep(Duration::from_millis(5));
        let stale = store.list_stale_running(Utc::now()).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, ids[0]);

        // A successful poll refreshes the job.
        store.record_poll(ids[0]).unwrap();
        assert!(store
            .list_stale_running(Utc::now() - chrono::Duration::seconds(1))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn purge_removes_only_old_finished_jobs() {
        let store = InMemoryJobStore::new();
        let provider = ProviderId::new("p");
        let ids = store_with_queued(&store, &provider, 2);

        store.claim_next(&provider).unwrap().unwrap();
        store.mark_completed(ids[0], &OutputRef::new("msg-1")).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let purged = store.purge_terminal(Utc::now()).unwrap();
        assert_eq!(purged, 1);
        assert!(store.get(ids[0]).unwrap().is_none());
        // The still-queued job survives.
        assert!(store.get(ids[1]).unwrap().is_some());
    }

    #[test]
    fn finished_since_window() {
        let store = InMemoryJobStore::new();
        let provider = ProviderId::new("p");
        let ids = store_with_queued(&store, &provider, 2);
        let cutoff = Utc::now() - chrono::Duration::seconds(60);

        store.claim_next(&provider).unwrap().unwrap();
        store.mark_completed(ids[0], &OutputRef::new("msg-1")).unwrap();
        store.claim_next(&provider).unwrap().unwrap();
        store
            .mark_failed(ids[1], "boom", FailureKind::Permanent)
            .unwrap();

        let finished = store.list_finished_since(&provider, cutoff).unwrap();
        assert_eq!(finished.len(), 2);
        assert!(store
            .list_finished_since(&ProviderId::new("other"), cutoff)
            .unwrap()
            .is_empty());
    }
}
