//! Retry promoter: re-queues transient failures once their delay elapses.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::jobs::{FailureKind, JobState, JobStore, JobStoreError};
use crate::lock::ThreadLockManager;
use crate::queue::QueueRegistry;

/// Failed jobs examined per pass.
const PROMOTE_BATCH: usize = 64;

/// Moves `failed` jobs with remaining retry budget back to `queued` after
/// the provider's retry delay, re-acquiring the conversation gate so
/// single-flight holds even when users submit new work while a retry waits.
pub struct RetryPromoter<S> {
    store: Arc<S>,
    queues: Arc<QueueRegistry>,
    locks: Arc<ThreadLockManager>,
}

impl<S: JobStore> RetryPromoter<S> {
    pub fn new(
        store: Arc<S>,
        queues: Arc<QueueRegistry>,
        locks: Arc<ThreadLockManager>,
    ) -> Self {
        Self {
            store,
            queues,
            locks,
        }
    }

    /// One bounded pass; returns how many jobs were re-queued.
    pub fn run_once(&self) -> Result<usize, JobStoreError> {
        let now = Utc::now();
        let mut promoted = 0;

        for job in self.store.list_in_state(JobState::Failed, PROMOTE_BATCH)? {
            if job.failure != Some(FailureKind::Transient) || !job.has_retry_budget() {
                continue;
            }
            let queue = self.queues.get_or_create(&job.provider_id);
            if !queue.auto_retry {
                continue;
            }

            let delay = queue.retry_policy.delay_for_attempt(job.retry_count + 1);
            let failed_at = job.finished_at.unwrap_or(job.updated_at);
            let eligible_at = failed_at + chrono::Duration::from_std(delay).unwrap_or_default();
            if now < eligible_at {
                continue;
            }

            match self.locks.acquire(self.store.as_ref(), job.conversation_id) {
                Ok(_lease) => match self.store.requeue_for_retry(job.id) {
                    Ok(requeued) => {
                        promoted += 1;
                        info!(
                            job_id = %job.id,
                            retry_count = requeued.retry_count,
                            max_retries = requeued.max_retries,
                            "re-queued failed generation"
                        );
                    }
                    Err(JobStoreError::InvalidTransition(e)) => {
                        debug!(job_id = %job.id, error = %e, "job moved before promotion");
                    }
                    Err(e) => return Err(e),
                },
                Err(JobStoreError::Busy(_)) => {
                    // The conversation picked up other work; try again on a
                    // later pass.
                    debug!(job_id = %job.id, "conversation busy; retry deferred");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobStore, RetryPolicy};
    use crate::queue::QueueSettings;
    use genqueue_core::{ConversationId, JobId, ModelId, ProviderId};
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        queues: Arc<QueueRegistry>,
        promoter: RetryPromoter<InMemoryJobStore>,
        provider: ProviderId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryJobStore::new());
        let queues = Arc::new(QueueRegistry::new());
        let locks = Arc::new(ThreadLockManager::new());
        let provider = ProviderId::new("p");
        // Immediate retries unless a test overrides the policy.
        queues.configure(
            &provider,
            QueueSettings {
                retry_policy: Some(RetryPolicy::fixed(Duration::ZERO)),
                ..QueueSettings::default()
            },
        );
        let promoter = RetryPromoter::new(store.clone(), queues.clone(), locks);
        Fixture {
            store,
            queues,
            promoter,
            provider,
        }
    }

    fn failed_job(f: &Fixture, conversation: ConversationId, kind: FailureKind) -> JobId {
        let job = f
            .store
            .create(
                conversation,
                &f.provider,
                &ModelId::new("m"),
                serde_json::json!({}),
                2,
            )
            .unwrap();
        f.store.enqueue(job.id).unwrap();
        f.store.claim_next(&f.provider).unwrap().unwrap();
        f.store.mark_failed(job.id, "boom", kind).unwrap();
        job.id
    }

    #[test]
    fn transient_failure_is_requeued_with_budget_spent() {
        let f = fixture();
        let job_id = failed_job(&f, ConversationId::new(), FailureKind::Transient);

        assert_eq!(f.promoter.run_once().unwrap(), 1);

        let job = f.store.get(job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.retry_count, 1);
        assert!(job.error.is_none());
    }

    #[test]
    fn permanent_failure_is_left_alone() {
        let f = fixture();
        let job_id = failed_job(&f, ConversationId::new(), FailureKind::Permanent);

        assert_eq!(f.promoter.run_once().unwrap(), 0);
        assert_eq!(f.store.get(job_id).unwrap().unwrap().state, JobState::Failed);
    }

    #[test]
    fn delay_defers_promotion() {
        let f = fixture();
        f.queues.configure(
            &f.provider,
            QueueSettings {
                retry_policy: Some(RetryPolicy::fixed(Duration::from_secs(3600))),
                ..QueueSettings::default()
            },
        );
        let job_id = failed_job(&f, ConversationId::new(), FailureKind::Transient);

        assert_eq!(f.promoter.run_once().unwrap(), 0);
        assert_eq!(f.store.get(job_id).unwrap().unwrap().state, JobState::Failed);
    }

    #[test]
    fn auto_retry_off_defers_to_operators() {
        let f = fixture();
        f.queues.configure(
            &f.provider,
            QueueSettings {
                auto_retry: Some(false),
                ..QueueSettings::default()
            },
        );
        let job_id = failed_job(&f, ConversationId::new(), FailureKind::Transient);

        assert_eq!(f.promoter.run_once().unwrap(), 0);
        assert_eq!(f.store.get(job_id).unwrap().unwrap().state, JobState::Failed);
    }

    #[test]
    fn busy_conversation_defers_promotion() {
        let f = fixture();
        let conversation = ConversationId::new();
        let job_id = failed_job(&f, conversation, FailureKind::Transient);

        // The user submits fresh work for the same conversation.
        let fresh = f
            .store
            .create(
                conversation,
                &f.provider,
                &ModelId::new("m"),
                serde_json::json!({}),
                0,
            )
            .unwrap();
        f.store.enqueue(fresh.id).unwrap();

        assert_eq!(f.promoter.run_once().unwrap(), 0);
        assert_eq!(f.store.get(job_id).unwrap().unwrap().state, JobState::Failed);

        // Once the fresh job finishes, the retry goes through.
        f.store.mark_cancelled(fresh.id).unwrap();
        assert_eq!(f.promoter.run_once().unwrap(), 1);
        assert_eq!(f.store.get(job_id).unwrap().unwrap().state, JobState::Queued);
    }
}
