//! Generation job model, retry policy, and state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use genqueue_core::{ConversationId, JobId, ModelId, OutputRef, ProviderId};

/// Lifecycle state of a generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created but not yet handed to the scheduler.
    Draft,
    /// Waiting for provider capacity.
    Queued,
    /// Claimed by the dispatcher; submitted (or being submitted) remotely.
    Running,
    /// Finished with output delivered to the result sink.
    Completed,
    /// Finished with an error; transient failures may still be re-queued.
    Failed,
    /// Cancelled locally (and best-effort remotely).
    Cancelled,
}

impl JobState {
    /// States that hold the conversation exclusively.
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }

    /// States with a `finished_at` timestamp.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Draft => "draft",
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(JobState::Draft),
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job failed, and whether the retry promoter may touch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Eligible for automatic re-queueing while retry budget remains.
    Transient,
    /// Terminal: exhausted budget, non-retryable rejection, or auto-retry
    /// disabled for the provider.
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transient" => Some(FailureKind::Transient),
            "permanent" => Some(FailureKind::Permanent),
            _ => None,
        }
    }
}

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff: base * 2^attempt.
    Exponential,
    /// Linear backoff: base * attempt.
    Linear,
}

/// Retry-delay configuration for a provider queue.
///
/// The retry *budget* lives on the job (`max_retries`); this type only
/// answers "how long until the next attempt".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay between retries.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Backoff strategy.
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to add spread.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    /// Fixed five-minute delay, the conventional default for generation
    /// providers.
    fn default() -> Self {
        Self::fixed(Duration::from_secs(300))
    }
}

impl RetryPolicy {
    /// Fixed delay for every attempt.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Exponential backoff with a cap.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread keyed on the attempt number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

/// Result of applying a state-transition event to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The same outcome was already recorded; re-delivery is a no-op.
    AlreadyApplied,
}

/// Illegal state-transition attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("job {job_id}: cannot {event} from state '{from}'")]
pub struct TransitionError {
    pub job_id: JobId,
    pub from: JobState,
    pub event: &'static str,
}

/// One generation request tracked through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub conversation_id: ConversationId,
    pub provider_id: ProviderId,
    pub model_id: ModelId,
    pub state: JobState,
    /// Already-validated structured payload passed to the adapter.
    pub inputs: JsonValue,
    /// Provider's identifier for the remote job; set once submission reaches
    /// the adapter.
    pub external_handle: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Last error message; present exactly when `state == Failed`.
    pub error: Option<String>,
    /// Set together with `error`.
    pub failure: Option<FailureKind>,
    /// Reference into the result sink; present exactly when `state == Completed`.
    pub output_ref: Option<OutputRef>,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Last successful status check for a running job.
    pub last_polled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new draft job.
    pub fn new(
        conversation_id: ConversationId,
        provider_id: ProviderId,
        model_id: ModelId,
        inputs: JsonValue,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            conversation_id,
            provider_id,
            model_id,
            state: JobState::Draft,
            inputs,
            external_handle: None,
            retry_count: 0,
            max_retries,
            error: None,
            failure: None,
            output_ref: None,
            created_at: now,
            queued_at: None,
            started_at: None,
            finished_at: None,
            last_polled_at: None,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Whether the retry promoter may still re-queue this job.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Time spent waiting for capacity, once started.
    pub fn queue_duration(&self) -> Option<Duration> {
        match (self.queued_at, self.started_at) {
            (Some(q), Some(s)) => (s - q).to_std().ok(),
            _ => None,
        }
    }

    /// Time spent generating, once finished.
    pub fn run_duration(&self) -> Option<Duration> {
        match (self.started_at, self.finished_at) {
            (Some(s), Some(f)) => (f - s).to_std().ok(),
            _ => None,
        }
    }

    /// Most recent sign of life for a running job, for the staleness sweep.
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_polled_at
            .or(self.started_at)
            .unwrap_or(self.updated_at)
    }

    fn illegal(&self, event: &'static str) -> TransitionError {
        TransitionError {
            job_id: self.id,
            from: self.state,
            event,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Draft → Queued.
    pub fn enqueue(&mut self) -> Result<Transition, TransitionError> {
        if self.state != JobState::Draft {
            return Err(self.illegal("enqueue"));
        }
        self.state = JobState::Queued;
        self.queued_at = Some(Utc::now());
        self.touch();
        Ok(Transition::Applied)
    }

    /// Queued → Running (the claim).
    pub fn begin_running(&mut self) -> Result<Transition, TransitionError> {
        if self.state != JobState::Queued {
            return Err(self.illegal("claim"));
        }
        self.state = JobState::Running;
        self.started_at = Some(Utc::now());
        self.touch();
        Ok(Transition::Applied)
    }

    /// Record the provider's handle on a running job.
    pub fn attach_handle(&mut self, handle: &str) -> Result<Transition, TransitionError> {
        match (&self.state, self.external_handle.as_deref()) {
            (JobState::Running, None) => {
                self.external_handle = Some(handle.to_string());
                self.touch();
                Ok(Transition::Applied)
            }
            (JobState::Running, Some(existing)) if existing == handle => {
                Ok(Transition::AlreadyApplied)
            }
            _ => Err(self.illegal("attach handle")),
        }
    }

    /// Running → Completed.
    pub fn complete(&mut self, output_ref: &OutputRef) -> Result<Transition, TransitionError> {
        match self.state {
            JobState::Running => {
                self.state = JobState::Completed;
                self.output_ref = Some(output_ref.clone());
                self.finished_at = Some(Utc::now());
                self.touch();
                Ok(Transition::Applied)
            }
            JobState::Completed if self.output_ref.as_ref() == Some(output_ref) => {
                Ok(Transition::AlreadyApplied)
            }
            _ => Err(self.illegal("complete")),
        }
    }

    /// Queued/Running → Failed.
    pub fn fail(
        &mut self,
        error: &str,
        failure: FailureKind,
    ) -> Result<Transition, TransitionError> {
        match self.state {
            JobState::Queued | JobState::Running => {
                self.state = JobState::Failed;
                self.error = Some(error.to_string());
                self.failure = Some(failure);
                self.finished_at = Some(Utc::now());
                self.touch();
                Ok(Transition::Applied)
            }
            JobState::Failed
                if self.error.as_deref() == Some(error) && self.failure == Some(failure) =>
            {
                Ok(Transition::AlreadyApplied)
            }
            _ => Err(self.illegal("fail")),
        }
    }

    /// Draft/Queued/Running → Cancelled.
    pub fn cancel(&mut self) -> Result<Transition, TransitionError> {
        match self.state {
            JobState::Draft | JobState::Queued | JobState::Running => {
                self.state = JobState::Cancelled;
                self.finished_at = Some(Utc::now());
                self.touch();
                Ok(Transition::Applied)
            }
            JobState::Cancelled => Ok(Transition::AlreadyApplied),
            _ => Err(self.illegal("cancel")),
        }
    }

    /// Failed → Queued, consuming one unit of retry budget.
    ///
    /// Clears every per-attempt field so the next attempt starts clean,
    /// exactly like a fresh enqueue.
    pub fn requeue_for_retry(&mut self) -> Result<Transition, TransitionError> {
        if self.state != JobState::Failed || !self.has_retry_budget() {
            return Err(self.illegal("requeue"));
        }
        self.state = JobState::Queued;
        self.retry_count += 1;
        self.queued_at = Some(Utc::now());
        self.started_at = None;
        self.finished_at = None;
        self.last_polled_at = None;
        self.error = None;
        self.failure = None;
        self.external_handle = None;
        self.touch();
        Ok(Transition::Applied)
    }

    /// Record a successful status check on a running job.
    pub fn record_poll(&mut self) -> Result<Transition, TransitionError> {
        if self.state != JobState::Running {
            return Err(self.illegal("record poll"));
        }
        self.last_polled_at = Some(Utc::now());
        self.touch();
        Ok(Transition::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genqueue_core::{ConversationId, ModelId, ProviderId};
    use proptest::prelude::*;

    fn test_job(max_retries: u32) -> Job {
        Job::new(
            ConversationId::new(),
            ProviderId::new("test"),
            ModelId::new("test-model"),
            serde_json::json!({"prompt": "hi"}),
            max_retries,
        )
    }

    #[test]
    fn happy_path_lifecycle() {
        let mut job = test_job(3);
        assert_eq!(job.state, JobState::Draft);

        job.enqueue().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert!(job.queued_at.is_some());

        job.begin_running().unwrap();
        assert_eq!(job.state, JobState::Running);
        assert!(job.started_at.is_some());

        job.attach_handle("ext-1").unwrap();
        assert_eq!(job.external_handle.as_deref(), Some("ext-1"));

        let output_ref = OutputRef::new("msg-1");
        job.complete(&output_ref).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.output_ref, Some(output_ref));
        assert!(job.finished_at.is_some());
        assert!(job.error.is_none());
    }

    #[test]
    fn enqueue_requires_draft() {
        let mut job = test_job(3);
        job.enqueue().unwrap();
        let err = job.enqueue().unwrap_err();
        assert_eq!(err.from, JobState::Queued);
    }

    #[test]
    fn complete_is_idempotent_for_same_ref_only() {
        let mut job = test_job(3);
        job.enqueue().unwrap();
        job.begin_running().unwrap();
        job.attach_handle("ext-1").unwrap();

        let output_ref = OutputRef::new("msg-1");
        assert_eq!(job.complete(&output_ref).unwrap(), Transition::Applied);
        assert_eq!(
            job.complete(&output_ref).unwrap(),
            Transition::AlreadyApplied
        );
        assert!(job.complete(&OutputRef::new("msg-2")).is_err());
    }

    #[test]
    fn fail_records_error_and_kind() {
        let mut job = test_job(1);
        job.enqueue().unwrap();
        job.begin_running().unwrap();
        job.fail("rate limited", FailureKind::Transient).unwrap();

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("rate limited"));
        assert_eq!(job.failure, Some(FailureKind::Transient));
        assert_eq!(
            job.fail("rate limited", FailureKind::Transient).unwrap(),
            Transition::AlreadyApplied
        );
        assert!(job.fail("other", FailureKind::Transient).is_err());
    }

    #[test]
    fn requeue_consumes_budget_and_clears_attempt_state() {
        let mut job = test_job(2);
        job.enqueue().unwrap();
        job.begin_running().unwrap();
        job.attach_handle("ext-1").unwrap();
        job.fail("boom", FailureKind::Transient).unwrap();

        job.requeue_for_retry().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.retry_count, 1);
        assert!(job.error.is_none());
        assert!(job.failure.is_none());
        assert!(job.external_handle.is_none());
        assert!(job.started_at.is_none());
        assert!(job.finished_at.is_none());
    }

    #[test]
    fn requeue_refused_once_budget_exhausted() {
        let mut job = test_job(1);
        job.enqueue().unwrap();
        job.begin_running().unwrap();
        job.fail("a", FailureKind::Transient).unwrap();
        job.requeue_for_retry().unwrap();
        assert_eq!(job.retry_count, 1);

        job.begin_running().unwrap();
        job.fail("b", FailureKind::Transient).unwrap();
        assert!(job.requeue_for_retry().is_err());
        assert_eq!(job.retry_count, 1);
    }

    #[test]
    fn cancel_from_active_states_only() {
        let mut job = test_job(3);
        assert_eq!(job.cancel().unwrap(), Transition::Applied);
        assert_eq!(job.cancel().unwrap(), Transition::AlreadyApplied);

        let mut done = test_job(3);
        done.enqueue().unwrap();
        done.begin_running().unwrap();
        done.complete(&OutputRef::new("msg-1")).unwrap();
        assert!(done.cancel().is_err());
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(400));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_range() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(1000),
            strategy: BackoffStrategy::Fixed,
            jitter: 0.1,
        };
        for attempt in 1..=10 {
            let delay = policy.delay_for_attempt(attempt).as_millis() as f64;
            assert!((900.0..=1100.0).contains(&delay), "attempt {attempt}: {delay}");
        }
    }

    /// Events a scheduler component may try to apply to a job.
    #[derive(Debug, Clone)]
    enum Event {
        Enqueue,
        Claim,
        AttachHandle(String),
        Complete(String),
        Fail(String, FailureKind),
        Cancel,
        Requeue,
        Poll,
    }

    fn event_strategy() -> impl Strategy<Value = Event> {
        prop_oneof![
            Just(Event::Enqueue),
            Just(Event::Claim),
            "[a-z]{1,8}".prop_map(Event::AttachHandle),
            "[a-z]{1,8}".prop_map(Event::Complete),
            ("[a-z]{1,8}", prop_oneof![
                Just(FailureKind::Transient),
                Just(FailureKind::Permanent)
            ])
                .prop_map(|(m, k)| Event::Fail(m, k)),
            Just(Event::Cancel),
            Just(Event::Requeue),
            Just(Event::Poll),
        ]
    }

    fn apply(job: &mut Job, event: &Event) {
        // Illegal transitions are rejected; the property checks state after
        // every application regardless.
        let _ = match event {
            Event::Enqueue => job.enqueue(),
            Event::Claim => job.begin_running(),
            Event::AttachHandle(h) => job.attach_handle(h),
            Event::Complete(r) => job.complete(&OutputRef::new(r.clone())),
            Event::Fail(m, k) => job.fail(m, *k),
            Event::Cancel => job.cancel(),
            Event::Requeue => job.requeue_for_retry(),
            Event::Poll => job.record_poll(),
        };
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 512,
            ..ProptestConfig::default()
        })]

        /// Property: no event sequence can break the job invariants.
        #[test]
        fn event_sequences_preserve_invariants(
            max_retries in 0u32..4,
            events in proptest::collection::vec(event_strategy(), 0..40),
        ) {
            let mut job = test_job(max_retries);

            for event in &events {
                apply(&mut job, event);

                prop_assert!(job.retry_count <= job.max_retries);
                match job.state {
                    JobState::Completed => {
                        prop_assert!(job.output_ref.is_some());
                        prop_assert!(job.error.is_none());
                        prop_assert!(job.finished_at.is_some());
                    }
                    JobState::Failed => {
                        prop_assert!(job.error.is_some());
                        prop_assert!(job.failure.is_some());
                        prop_assert!(job.output_ref.is_none());
                    }
                    _ => {
                        prop_assert!(job.output_ref.is_none());
                        prop_assert!(job.error.is_none());
                    }
                }
            }
        }

        /// Property: a completed job never changes its output reference.
        #[test]
        fn terminal_output_is_immutable(
            events in proptest::collection::vec(event_strategy(), 0..40),
        ) {
            let mut job = test_job(2);
            job.enqueue().unwrap();
            job.begin_running().unwrap();
            let output_ref = OutputRef::new("final");
            job.complete(&output_ref).unwrap();

            for event in &events {
                apply(&mut job, event);
                prop_assert_eq!(job.state, JobState::Completed);
                prop_assert_eq!(job.output_ref.as_ref(), Some(&output_ref));
            }
        }
    }
}
