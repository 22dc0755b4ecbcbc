//! Generation Jobs
//!
//! Per-message generation lifecycle tracking. Every in-flight generation is
//! one `JobHandle` keyed by the assistant message id it is producing, held
//! in the `JobRegistry` from creation until it reaches a terminal state.
//!
//! # State Machine
//!
//! ```text
//! Queued ──> Streaming ──> Completed
//!    │           │────────> Cancelled
//!    │           └────────> Failed
//!    ├────────────────────> Cancelled   (stopped before first delta)
//!    └────────────────────> Failed      (provider refused the request)
//! ```
//!
//! Terminal states are absorbing: once a job completes, cancels, or fails,
//! no further transition is accepted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::messages::{MessageId, SessionId};
use crate::provider::{ProviderError, ProviderKind};

// ============================================================================
// Job State
// ============================================================================

/// Lifecycle state of a generation job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Created, provider request not yet streaming
    Queued,
    /// First delta received, chunks flowing
    Streaming,
    /// Provider finished normally
    Completed,
    /// Stopped by user request
    Cancelled,
    /// Provider or transport failure
    Failed(ProviderError),
}

impl JobState {
    /// Whether this state accepts no further transitions
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Failed(_)
        )
    }
}

// ============================================================================
// Job Handle
// ============================================================================

/// Shared handle to one in-flight generation
pub struct JobHandle {
    /// Assistant message this job is producing
    pub message_id: MessageId,
    /// Session the message belongs to
    pub session_id: SessionId,
    /// Provider serving the generation
    pub provider: ProviderKind,
    /// Model name
    pub model: String,
    /// Monotonic chunk sequence, owned by the drive task
    seq: AtomicU64,
    /// Cooperative cancellation signal
    cancel: CancellationToken,
    state: parking_lot::RwLock<JobState>,
}

impl JobHandle {
    /// Create a new queued job
    #[must_use]
    pub fn new(
        message_id: MessageId,
        session_id: SessionId,
        provider: ProviderKind,
        model: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            session_id,
            provider,
            model: model.into(),
            seq: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            state: parking_lot::RwLock::new(JobState::Queued),
        }
    }

    /// Current state (cloned snapshot)
    #[must_use]
    pub fn state(&self) -> JobState {
        self.state.read().clone()
    }

    /// Attempt a state transition.
    ///
    /// Returns `false` if the job is already terminal, in which case the
    /// existing state is kept. First writer to a terminal state wins.
    pub fn transition(&self, next: JobState) -> bool {
        let mut state = self.state.write();
        if state.is_terminal() {
            return false;
        }
        tracing::debug!(
            message_id = %self.message_id,
            from = ?*state,
            to = ?next,
            "job transition"
        );
        *state = next;
        true
    }

    /// Next chunk index, starting at 0
    pub fn next_chunk_index(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// The job's cancellation token
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation. Idempotent.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation has been requested
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ============================================================================
// Job Registry
// ============================================================================

/// Registry of in-flight generation jobs, keyed by assistant message id
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<MessageId, Arc<JobHandle>>,
}

impl JobRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job if no live job exists for the same message id.
    ///
    /// Returns `None` when a job is already registered, enforcing at most
    /// one generation per message.
    pub fn try_insert(&self, job: Arc<JobHandle>) -> Option<Arc<JobHandle>> {
        match self.jobs.entry(job.message_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(job.clone());
                Some(job)
            }
        }
    }

    /// Look up a live job
    #[must_use]
    pub fn get(&self, message_id: MessageId) -> Option<Arc<JobHandle>> {
        self.jobs.get(&message_id).map(|j| j.clone())
    }

    /// Remove a job after it reaches a terminal state
    pub fn remove(&self, message_id: MessageId) {
        self.jobs.remove(&message_id);
    }

    /// All live jobs
    #[must_use]
    pub fn live_jobs(&self) -> Vec<Arc<JobHandle>> {
        self.jobs.iter().map(|entry| entry.clone()).collect()
    }

    /// Live jobs for one session
    #[must_use]
    pub fn jobs_for_session(&self, session_id: SessionId) -> Vec<Arc<JobHandle>> {
        self.jobs
            .iter()
            .filter(|entry| entry.session_id == session_id)
            .map(|entry| entry.clone())
            .collect()
    }

    /// Number of live jobs
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether no jobs are live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_job() -> Arc<JobHandle> {
        Arc::new(JobHandle::new(
            MessageId::new(),
            SessionId::new(),
            ProviderKind::Ollama,
            "llama3",
        ))
    }

    #[test]
    fn test_new_job_is_queued() {
        let job = test_job();
        assert_eq!(job.state(), JobState::Queued);
        assert!(!job.state().is_terminal());
    }

    #[test]
    fn test_normal_lifecycle() {
        let job = test_job();
        assert!(job.transition(JobState::Streaming));
        assert!(job.transition(JobState::Completed));
        assert_eq!(job.state(), JobState::Completed);
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        let job = test_job();
        assert!(job.transition(JobState::Completed));
        assert!(!job.transition(JobState::Cancelled));
        assert!(!job.transition(JobState::Failed(ProviderError::RateLimited)));
        assert_eq!(job.state(), JobState::Completed);
    }

    #[test]
    fn test_queued_can_cancel_directly() {
        let job = test_job();
        assert!(job.transition(JobState::Cancelled));
        assert!(job.state().is_terminal());
    }

    #[test]
    fn test_chunk_indices_are_gapless() {
        let job = test_job();
        assert_eq!(job.next_chunk_index(), 0);
        assert_eq!(job.next_chunk_index(), 1);
        assert_eq!(job.next_chunk_index(), 2);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let job = test_job();
        assert!(!job.is_cancel_requested());
        job.request_cancel();
        job.request_cancel();
        assert!(job.is_cancel_requested());
    }

    #[test]
    fn test_registry_rejects_duplicate() {
        let registry = JobRegistry::new();
        let job = test_job();
        assert!(registry.try_insert(job.clone()).is_some());

        let dup = Arc::new(JobHandle::new(
            job.message_id,
            job.session_id,
            ProviderKind::Ollama,
            "llama3",
        ));
        assert!(registry.try_insert(dup).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_remove_allows_reinsert() {
        let registry = JobRegistry::new();
        let job = test_job();
        registry.try_insert(job.clone());
        registry.remove(job.message_id);
        assert!(registry.is_empty());
        assert!(registry.try_insert(job).is_some());
    }

    #[test]
    fn test_jobs_for_session_filters() {
        let registry = JobRegistry::new();
        let session = SessionId::new();
        let job_a = Arc::new(JobHandle::new(
            MessageId::new(),
            session,
            ProviderKind::Ollama,
            "llama3",
        ));
        registry.try_insert(job_a);
        registry.try_insert(test_job());

        assert_eq!(registry.jobs_for_session(session).len(), 1);
    }
}
