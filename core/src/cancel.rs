//! Cancellation Controller
//!
//! Translates stop requests into cooperative cancellation of live jobs.
//! Cancellation is a request, not a guarantee: the drive task bounds the
//! provider's response with a grace period and forces the terminal state
//! if the provider keeps talking.

use std::sync::Arc;

use crate::job::JobRegistry;
use crate::messages::MessageId;

/// Requests cancellation of in-flight generations
#[derive(Clone)]
pub struct CancellationController {
    jobs: Arc<JobRegistry>,
}

impl CancellationController {
    /// Create a controller over the given job registry
    #[must_use]
    pub fn new(jobs: Arc<JobRegistry>) -> Self {
        Self { jobs }
    }

    /// Request cancellation of the job producing `message_id`.
    ///
    /// Idempotent: repeated calls for the same job are no-ops. Returns
    /// false when no live job exists, which covers both unknown ids and
    /// jobs that already reached a terminal state.
    pub fn cancel(&self, message_id: MessageId) -> bool {
        match self.jobs.get(message_id) {
            Some(job) => {
                if !job.is_cancel_requested() {
                    tracing::info!(message_id = %message_id, "cancellation requested");
                }
                job.request_cancel();
                true
            }
            None => {
                tracing::debug!(message_id = %message_id, "stop request for unknown job");
                false
            }
        }
    }

    /// Request cancellation of every live job.
    ///
    /// Used at shutdown so in-flight generations resolve as Cancelled
    /// rather than being abandoned mid-stream. Returns the number of jobs
    /// signalled.
    pub fn cancel_all(&self) -> usize {
        let jobs = self.jobs.live_jobs();
        for job in &jobs {
            job.request_cancel();
        }
        if !jobs.is_empty() {
            tracing::info!(count = jobs.len(), "cancelling all live generations");
        }
        jobs.len()
    }

    /// Request cancellation of every live job in a session.
    ///
    /// Returns the number of jobs signalled.
    pub fn cancel_session(&self, session_id: crate::messages::SessionId) -> usize {
        let jobs = self.jobs.jobs_for_session(session_id);
        for job in &jobs {
            job.request_cancel();
        }
        if !jobs.is_empty() {
            tracing::info!(
                session_id = %session_id,
                count = jobs.len(),
                "session cancellation requested"
            );
        }
        jobs.len()
    }
}
