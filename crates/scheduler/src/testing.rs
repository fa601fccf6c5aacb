//! Scripted test doubles shared by the scheduler test suites.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::Value as JsonValue;

use genqueue_provider::{Outcome, PollError, ProviderAdapter, Submission, SubmissionError};

/// Adapter that replays a scripted sequence of submit/check responses.
///
/// Scripts are consumed front to back; running out of script is a test bug
/// and panics.
pub(crate) struct ScriptedAdapter {
    is_async: bool,
    submissions: Mutex<VecDeque<Result<Submission, SubmissionError>>>,
    checks: Mutex<VecDeque<Result<Outcome, PollError>>>,
    cancel_ack: bool,
    cancelled: Mutex<Vec<String>>,
}

impl ScriptedAdapter {
    pub(crate) fn asynchronous() -> Self {
        Self {
            is_async: true,
            submissions: Mutex::new(VecDeque::new()),
            checks: Mutex::new(VecDeque::new()),
            cancel_ack: true,
            cancelled: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn synchronous() -> Self {
        Self {
            is_async: false,
            ..Self::asynchronous()
        }
    }

    pub(crate) fn with_cancel_ack(mut self, ack: bool) -> Self {
        self.cancel_ack = ack;
        self
    }

    pub(crate) fn submit_accepted(self, handle: &str) -> Self {
        self.submissions
            .lock()
            .unwrap()
            .push_back(Ok(Submission::Accepted(handle.to_string())));
        self
    }

    pub(crate) fn submit_completed(self, output: &str) -> Self {
        self.submissions
            .lock()
            .unwrap()
            .push_back(Ok(Submission::Finished(Outcome::Completed(
                output.to_string(),
            ))));
        self
    }

    pub(crate) fn submit_finished(self, outcome: Outcome) -> Self {
        self.submissions
            .lock()
            .unwrap()
            .push_back(Ok(Submission::Finished(outcome)));
        self
    }

    pub(crate) fn submit_error(self, error: SubmissionError) -> Self {
        self.submissions.lock().unwrap().push_back(Err(error));
        self
    }

    pub(crate) fn check_outcome(self, outcome: Outcome) -> Self {
        self.checks.lock().unwrap().push_back(Ok(outcome));
        self
    }

    pub(crate) fn check_error(self, message: &str) -> Self {
        self.checks
            .lock()
            .unwrap()
            .push_back(Err(PollError(message.to_string())));
        self
    }

    pub(crate) fn cancelled_handles(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

impl ProviderAdapter for ScriptedAdapter {
    fn is_async(&self) -> bool {
        self.is_async
    }

    fn submit(&self, _inputs: &JsonValue) -> Result<Submission, SubmissionError> {
        self.submissions
            .lock()
            .unwrap()
            .pop_front()
            .expect("scripted adapter: submit script exhausted")
    }

    fn check(&self, _handle: &str) -> Result<Outcome, PollError> {
        self.checks
            .lock()
            .unwrap()
            .pop_front()
            .expect("scripted adapter: check script exhausted")
    }

    fn cancel(&self, handle: &str) -> bool {
        self.cancelled.lock().unwrap().push(handle.to_string());
        self.cancel_ack
    }
}
