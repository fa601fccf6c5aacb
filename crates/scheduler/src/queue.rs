//! Per-provider queue configuration, health, and statistics.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use genqueue_core::ProviderId;

use crate::jobs::{JobState, JobStore, JobStoreError, RetryPolicy};

/// Finished jobs needed in the stats window before the success rate may
/// affect health.
const MIN_HEALTH_SAMPLES: usize = 4;

/// Success rate below which a queue is flagged.
const HEALTH_SUCCESS_FLOOR: f64 = 0.5;

/// Per-provider queue configuration.
///
/// Created lazily on the first job for a provider and mutated only through
/// the scheduler's admin surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderQueue {
    pub provider_id: ProviderId,
    /// Cap on simultaneously running jobs.
    pub max_concurrent: usize,
    /// Disabled queues accept submissions but dispatch nothing.
    pub enabled: bool,
    /// Whether transient failures are re-queued automatically.
    pub auto_retry: bool,
    pub retry_policy: RetryPolicy,
}

impl ProviderQueue {
    pub fn new(provider_id: ProviderId) -> Self {
        Self {
            provider_id,
            max_concurrent: 5,
            enabled: true,
            auto_retry: true,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_auto_retry(mut self, auto_retry: bool) -> Self {
        self.auto_retry = auto_retry;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// Partial update applied to a queue through the admin surface.
#[derive(Debug, Clone, Default)]
pub struct QueueSettings {
    pub max_concurrent: Option<usize>,
    pub enabled: Option<bool>,
    pub auto_retry: Option<bool>,
    pub retry_policy: Option<RetryPolicy>,
}

/// Registry of provider queues, keyed by provider id.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    queues: Mutex<HashMap<ProviderId, ProviderQueue>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the queue for a provider, creating it with defaults on
    /// first use.
    pub fn get_or_create(&self, provider_id: &ProviderId) -> ProviderQueue {
        let mut queues = self.queues.lock().unwrap();
        queues
            .entry(provider_id.clone())
            .or_insert_with(|| ProviderQueue::new(provider_id.clone()))
            .clone()
    }

    /// Apply settings to a queue and return the updated snapshot.
    pub fn configure(&self, provider_id: &ProviderId, settings: QueueSettings) -> ProviderQueue {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues
            .entry(provider_id.clone())
            .or_insert_with(|| ProviderQueue::new(provider_id.clone()));
        if let Some(max) = settings.max_concurrent {
            queue.max_concurrent = max;
        }
        if let Some(enabled) = settings.enabled {
            queue.enabled = enabled;
        }
        if let Some(auto_retry) = settings.auto_retry {
            queue.auto_retry = auto_retry;
        }
        if let Some(policy) = settings.retry_policy {
            queue.retry_policy = policy;
        }
        queue.clone()
    }

    pub fn set_enabled(&self, provider_id: &ProviderId, enabled: bool) -> ProviderQueue {
        self.configure(
            provider_id,
            QueueSettings {
                enabled: Some(enabled),
                ..QueueSettings::default()
            },
        )
    }
}

/// Queue health, derived from utilization and the recent success rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueHealth {
    Healthy,
    Warning,
    Critical,
    Disabled,
}

/// Observability snapshot for one provider queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub provider_id: ProviderId,
    pub running_count: usize,
    pub queued_count: usize,
    pub max_concurrent: usize,
    pub enabled: bool,
    pub health: QueueHealth,
    /// Completed / (completed + failed) over the stats window; 1.0 with no
    /// samples.
    pub recent_success_rate: f64,
    pub avg_queue_secs: f64,
    pub avg_run_secs: f64,
    /// Finished jobs inside the stats window.
    pub finished_recently: usize,
}

impl QueueStats {
    /// Collect stats for a queue over jobs finished since `since`.
    ///
    /// Counts are always recomputed from the store; nothing here is cached.
    pub fn collect<S: JobStore>(
        store: &S,
        queue: &ProviderQueue,
        since: DateTime<Utc>,
    ) -> Result<Self, JobStoreError> {
        let running_count = store.count_running(&queue.provider_id)?;
        let queued_count = store.count_queued(&queue.provider_id)?;
        let finished = store.list_finished_since(&queue.provider_id, since)?;

        let completed = finished
            .iter()
            .filter(|j| j.state == JobState::Completed)
            .count();
        let failed = finished
            .iter()
            .filter(|j| j.state == JobState::Failed)
            .count();
        let samples = completed + failed;
        let recent_success_rate = if samples == 0 {
            1.0
        } else {
            completed as f64 / samples as f64
        };

        let avg_queue_secs = average_secs(finished.iter().filter_map(|j| j.queue_duration()));
        let avg_run_secs = average_secs(finished.iter().filter_map(|j| j.run_duration()));

        let health = health_of(
            queue,
            running_count,
            queued_count,
            recent_success_rate,
            samples,
        );

        Ok(Self {
            provider_id: queue.provider_id.clone(),
            running_count,
            queued_count,
            max_concurrent: queue.max_concurrent,
            enabled: queue.enabled,
            health,
            recent_success_rate,
            avg_queue_secs,
            avg_run_secs,
            finished_recently: finished.len(),
        })
    }
}

fn average_secs(durations: impl Iterator<Item = Duration>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for d in durations {
        sum += d.as_secs_f64();
        count += 1;
    }
    if count == 0 { 0.0 } else { sum / count as f64 }
}

fn health_of(
    queue: &ProviderQueue,
    running: usize,
    queued: usize,
    success_rate: f64,
    samples: usize,
) -> QueueHealth {
    if !queue.enabled {
        QueueHealth::Disabled
    } else if running >= queue.max_concurrent {
        if queued > queue.max_concurrent * 2 {
            QueueHealth::Critical
        } else {
            QueueHealth::Warning
        }
    } else if samples >= MIN_HEALTH_SAMPLES && success_rate < HEALTH_SUCCESS_FLOOR {
        QueueHealth::Warning
    } else {
        QueueHealth::Healthy
    }
}
