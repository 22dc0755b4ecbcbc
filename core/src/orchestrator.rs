//! Generation Orchestrator
//!
//! Coordinates the full lifecycle of a generation: persisting the user
//! message, resolving session settings, starting the provider stream, and
//! driving deltas out to subscribed connections until the job reaches a
//! terminal state.
//!
//! # Design Philosophy
//!
//! One spawned drive task owns each generation end to end. The task is the
//! only writer of the job's chunk sequence and the assistant message's
//! parts, so per-message ordering needs no locking. Persistence happens at
//! the boundaries only: the user message and assistant placeholder at
//! submit, and one final update when the job terminates.
//!
//! ```text
//!  submit ──> persist user msg ──> persist placeholder ──> spawn drive
//!                                                              │
//!                       ┌──────────────────────────────────────┘
//!                       ▼
//!              acquire global permit
//!                       │
//!              adapter.start(ctx, cancel)
//!                       │
//!              recv deltas ──> publish chunks ──> terminal state
//!                       │
//!              finalize message ──> publish stream_end / stream_error
//! ```

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Semaphore};

use crate::cancel::CancellationController;
use crate::config::StreamConfig;
use crate::events::{ClientEvent, ServerEvent};
use crate::job::{JobHandle, JobRegistry, JobState};
use crate::messages::{ContentPart, Message, MessageId, MessageRole, MessageStatus, SessionId};
use crate::provider::{
    Delta, PromptContext, PromptMessage, ProviderAdapter, ProviderError, ProviderKind,
    ProviderRegistry,
};
use crate::store::{MessageStore, SettingsResolver, StoreError};
use crate::streaming::SessionStreamManager;

/// Reasons a submission is rejected before a job is created
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The submitted content is not acceptable
    #[error("invalid submission: {0}")]
    Validation(String),

    /// A live job already exists for the target message id
    #[error("generation already in flight for message {0}")]
    DuplicateGeneration(MessageId),

    /// The session's configured provider has no registered adapter
    #[error("no adapter registered for provider {0}")]
    UnknownProvider(ProviderKind),

    /// The session has reached its concurrent generation cap
    #[error("session has {0} generations in flight, cap reached")]
    SessionBusy(usize),

    /// Persistence failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ids handed back to the submitter
#[derive(Debug, Clone, Copy)]
pub struct SubmitReceipt {
    /// The persisted user message
    pub user_message_id: MessageId,
    /// The assistant message the generation will fill
    pub assistant_message_id: MessageId,
}

/// Outcome of handling one client event
#[derive(Debug, Clone, Copy)]
pub enum EventOutcome {
    /// A generation was started
    Submitted(SubmitReceipt),
    /// A cancellation was requested (or was already requested)
    CancelRequested,
    /// The stop target had no live job
    NoLiveJob,
}

/// Drives generations from submission to terminal state
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn MessageStore>,
    settings: Arc<dyn SettingsResolver>,
    providers: Arc<ProviderRegistry>,
    streams: Arc<SessionStreamManager>,
    jobs: Arc<JobRegistry>,
    canceller: CancellationController,
    config: StreamConfig,
    /// Global cap on concurrently streaming generations
    permits: Arc<Semaphore>,
}

impl Orchestrator {
    /// Create an orchestrator wired to its collaborators
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        settings: Arc<dyn SettingsResolver>,
        providers: Arc<ProviderRegistry>,
        streams: Arc<SessionStreamManager>,
        jobs: Arc<JobRegistry>,
        config: StreamConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_global));
        let canceller = CancellationController::new(jobs.clone());
        Self {
            store,
            settings,
            providers,
            streams,
            jobs,
            canceller,
            config,
            permits,
        }
    }

    /// The job registry backing this orchestrator
    #[must_use]
    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    /// The cancellation controller backing this orchestrator
    #[must_use]
    pub fn canceller(&self) -> &CancellationController {
        &self.canceller
    }

    /// Submit a user message and start a generation for it.
    ///
    /// Persists the user message and an empty assistant placeholder, then
    /// spawns the drive task. Returns as soon as the job is registered;
    /// streaming progress is observed through the session's connections.
    ///
    /// # Errors
    ///
    /// Rejects empty submissions, sessions at their concurrency cap,
    /// providers with no registered adapter, and sessions whose history
    /// cannot be read. Nothing is persisted or broadcast when submission
    /// is rejected.
    pub async fn submit(
        &self,
        session_id: SessionId,
        parts: Vec<ContentPart>,
    ) -> Result<SubmitReceipt, SubmitError> {
        validate_parts(&parts)?;

        let cap = self.config.max_concurrent_per_session;
        if cap > 0 {
            let live = self.jobs.jobs_for_session(session_id).len();
            if live >= cap {
                return Err(SubmitError::SessionBusy(live));
            }
        }

        let settings = self.settings.resolve(session_id).await;
        let adapter = self
            .providers
            .get(settings.provider)
            .ok_or(SubmitError::UnknownProvider(settings.provider))?;

        let submitted_at = Instant::now();

        let user_message = Message::user(session_id, parts);
        let user_message_id = user_message.id;

        // Read the history before persisting or broadcasting anything, so
        // a storage failure rejects the submission with no side effects
        let mut history = self.store.list_session(session_id).await?;
        history.push(user_message.clone());
        let ctx = build_prompt_context(&history, &settings);

        self.store.insert(user_message.clone()).await?;
        self.streams.publish(
            session_id,
            &ServerEvent::MessageCreated {
                message: user_message,
            },
        );

        let assistant = Message::generating_assistant(session_id);
        let assistant_message_id = assistant.id;
        self.store.insert(assistant.clone()).await?;
        self.streams.publish(
            session_id,
            &ServerEvent::MessageCreated {
                message: assistant.clone(),
            },
        );

        let job = Arc::new(JobHandle::new(
            assistant_message_id,
            session_id,
            settings.provider,
            settings.model.clone(),
        ));
        let job = self
            .jobs
            .try_insert(job)
            .ok_or(SubmitError::DuplicateGeneration(assistant_message_id))?;

        tracing::info!(
            session_id = %session_id,
            message_id = %assistant_message_id,
            provider = %settings.provider,
            model = %settings.model,
            "generation submitted"
        );

        let this = self.clone();
        tokio::spawn(async move {
            this.drive(job, adapter, ctx, assistant, submitted_at).await;
        });

        Ok(SubmitReceipt {
            user_message_id,
            assistant_message_id,
        })
    }

    /// Begin shutdown: cancel every in-flight generation.
    ///
    /// Each drive task finalizes its job as Cancelled (persisting partial
    /// content) before exiting. Returns the number of jobs signalled; the
    /// embedding application drops its connections once the registry
    /// drains.
    pub fn shutdown(&self) -> usize {
        self.canceller.cancel_all()
    }

    /// Handle one decoded client event for a session
    ///
    /// # Errors
    ///
    /// Propagates submission rejections. Stop requests never error.
    pub async fn handle_client_event(
        &self,
        session_id: SessionId,
        event: ClientEvent,
    ) -> Result<EventOutcome, SubmitError> {
        match event {
            ClientEvent::SendMessage {
                role,
                content_parts,
                ..
            } => {
                if role != MessageRole::User {
                    return Err(SubmitError::Validation(
                        "only user messages can be submitted".to_string(),
                    ));
                }
                let receipt = self.submit(session_id, content_parts).await?;
                Ok(EventOutcome::Submitted(receipt))
            }
            ClientEvent::StopGeneration { message_id } => {
                if self.canceller.cancel(message_id) {
                    Ok(EventOutcome::CancelRequested)
                } else {
                    Ok(EventOutcome::NoLiveJob)
                }
            }
        }
    }

    // ========================================================================
    // Drive Task
    // ========================================================================

    /// Own one generation from provider start to finalized message
    async fn drive(
        &self,
        job: Arc<JobHandle>,
        adapter: Arc<dyn ProviderAdapter>,
        ctx: PromptContext,
        mut assistant: Message,
        submitted_at: Instant,
    ) {
        // Closed semaphore cannot happen; treat it as shutdown
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return;
        };

        if job.is_cancel_requested() {
            job.transition(JobState::Cancelled);
            self.finalize(&job, &mut assistant).await;
            return;
        }

        let mut rx = match adapter.start(&ctx, job.cancel_token()).await {
            Ok(rx) => rx,
            Err(e) => {
                job.transition(JobState::Failed(e));
                self.finalize(&job, &mut assistant).await;
                return;
            }
        };

        let cancel = job.cancel_token();
        loop {
            // A stop request bounds how long the provider may keep
            // talking, even when it arrives while we are parked on recv
            let delta = if job.is_cancel_requested() {
                self.recv_acknowledgement(&job, &mut rx).await
            } else {
                let received = tokio::select! {
                    delta = rx.recv() => Some(delta),
                    () = cancel.cancelled() => None,
                };
                match received {
                    Some(delta) => Some(delta),
                    // Cancel landed while parked; grant the grace window
                    None => self.recv_acknowledgement(&job, &mut rx).await,
                }
            };
            let Some(delta) = delta else {
                job.transition(JobState::Cancelled);
                break;
            };

            match delta {
                Some(Delta::Text(text)) => {
                    self.emit_chunk(
                        &job,
                        &mut assistant,
                        ContentPart::Text { text },
                        submitted_at,
                    );
                }
                Some(Delta::Reasoning(text)) => {
                    self.emit_chunk(
                        &job,
                        &mut assistant,
                        ContentPart::Reasoning { text },
                        submitted_at,
                    );
                }
                Some(Delta::ToolCall {
                    id,
                    name,
                    arguments,
                }) => {
                    self.emit_chunk(
                        &job,
                        &mut assistant,
                        ContentPart::ToolCall {
                            id,
                            name,
                            arguments,
                        },
                        submitted_at,
                    );
                }
                Some(Delta::Usage(usage)) => {
                    assistant.usage = Some(usage);
                }
                Some(Delta::Done) => {
                    // Completion beats a pending cancel: the work is done
                    job.transition(JobState::Completed);
                    break;
                }
                Some(Delta::Cancelled) => {
                    job.transition(JobState::Cancelled);
                    break;
                }
                Some(Delta::Failed(e)) => {
                    job.transition(JobState::Failed(e));
                    break;
                }
                None => {
                    if job.is_cancel_requested() {
                        job.transition(JobState::Cancelled);
                    } else {
                        job.transition(JobState::Failed(ProviderError::TransientNetwork(
                            "stream closed before completion".to_string(),
                        )));
                    }
                    break;
                }
            }
        }

        self.finalize(&job, &mut assistant).await;
    }

    /// After a stop request, wait at most `cancel_grace` for the
    /// provider's next delta. `None` means the grace period expired
    /// without one and the job is forced to `Cancelled`.
    async fn recv_acknowledgement(
        &self,
        job: &JobHandle,
        rx: &mut mpsc::Receiver<Delta>,
    ) -> Option<Option<Delta>> {
        match tokio::time::timeout(self.config.cancel_grace, rx.recv()).await {
            Ok(delta) => Some(delta),
            Err(_) => {
                tracing::warn!(
                    message_id = %job.message_id,
                    "provider did not acknowledge cancel within grace period"
                );
                None
            }
        }
    }

    /// Record one content chunk and publish it.
    ///
    /// The first chunk moves the job to `Streaming` and announces the
    /// stream to the session.
    fn emit_chunk(
        &self,
        job: &JobHandle,
        assistant: &mut Message,
        part: ContentPart,
        submitted_at: Instant,
    ) {
        if job.state() == JobState::Queued && job.transition(JobState::Streaming) {
            let latency = u64::try_from(submitted_at.elapsed().as_millis()).unwrap_or(u64::MAX);
            assistant.first_token_latency_ms = Some(latency);
            self.streams.publish(
                job.session_id,
                &ServerEvent::StreamStart {
                    message_id: job.message_id,
                    role: MessageRole::Assistant,
                    provider: job.provider,
                    model: job.model.clone(),
                },
            );
        }

        assistant.push_part(part.clone());
        self.streams.publish(
            job.session_id,
            &ServerEvent::StreamChunk {
                message_id: job.message_id,
                chunk: part,
                chunk_index: job.next_chunk_index(),
            },
        );
    }

    /// Persist the terminal form of the assistant message and publish the
    /// terminal event. Partial content is kept on failure and cancel.
    async fn finalize(&self, job: &JobHandle, assistant: &mut Message) {
        let state = job.state();
        assistant.generating = false;

        let terminal_event = match &state {
            JobState::Completed => ServerEvent::StreamEnd {
                message_id: job.message_id,
                usage: assistant.usage,
                first_token_latency_ms: assistant.first_token_latency_ms,
            },
            JobState::Cancelled => {
                assistant.status.push(MessageStatus::info("stopped by user"));
                ServerEvent::StreamEnd {
                    message_id: job.message_id,
                    usage: assistant.usage,
                    first_token_latency_ms: assistant.first_token_latency_ms,
                }
            }
            JobState::Failed(e) => {
                assistant.status.push(MessageStatus::error(e.to_string()));
                assistant.error = Some(e.to_string());
                ServerEvent::StreamError {
                    message_id: job.message_id,
                    error: e.to_string(),
                }
            }
            JobState::Queued | JobState::Streaming => {
                tracing::error!(
                    message_id = %job.message_id,
                    state = ?state,
                    "finalize reached without terminal state"
                );
                return;
            }
        };

        if let Err(e) = self.store.update(assistant.clone()).await {
            tracing::error!(
                message_id = %job.message_id,
                error = %e,
                "failed to persist finalized message"
            );
        }

        self.streams.publish(job.session_id, &terminal_event);
        self.jobs.remove(job.message_id);

        tracing::info!(
            message_id = %job.message_id,
            state = ?state,
            parts = assistant.parts.len(),
            "generation finished"
        );
    }
}

/// Prompt context from the session history, skipping messages with no text
fn build_prompt_context(
    history: &[Message],
    settings: &crate::store::GenerationSettings,
) -> PromptContext {
    let messages = history
        .iter()
        .filter_map(|m| {
            let text = m.text();
            if text.is_empty() {
                None
            } else {
                Some(PromptMessage { role: m.role, text })
            }
        })
        .collect();

    PromptContext {
        messages,
        model: settings.model.clone(),
        params: settings.params,
        system: settings.system.clone(),
    }
}

fn validate_parts(parts: &[ContentPart]) -> Result<(), SubmitError> {
    if parts.is_empty() {
        return Err(SubmitError::Validation(
            "submission has no content parts".to_string(),
        ));
    }
    let has_content = parts.iter().any(|p| match p {
        ContentPart::Text { text } | ContentPart::Reasoning { text } => !text.trim().is_empty(),
        _ => true,
    });
    if !has_content {
        return Err(SubmitError::Validation(
            "submission is empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_empty() {
        assert!(matches!(
            validate_parts(&[]),
            Err(SubmitError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_rejects_whitespace_only() {
        let parts = vec![ContentPart::text("   ")];
        assert!(matches!(
            validate_parts(&parts),
            Err(SubmitError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_accepts_text() {
        assert!(validate_parts(&[ContentPart::text("hello")]).is_ok());
    }

    #[test]
    fn test_prompt_context_skips_textless_messages() {
        let session = SessionId::new();
        let history = vec![
            Message::user(session, vec![ContentPart::text("hello")]),
            Message::generating_assistant(session),
        ];
        let ctx = build_prompt_context(&history, &crate::store::GenerationSettings::default());
        assert_eq!(ctx.messages.len(), 1);
        assert_eq!(ctx.messages[0].text, "hello");
    }

    #[test]
    fn test_validate_accepts_non_text_parts() {
        let parts = vec![ContentPart::Image {
            key: "upload/1.png".to_string(),
        }];
        assert!(validate_parts(&parts).is_ok());
    }
}
