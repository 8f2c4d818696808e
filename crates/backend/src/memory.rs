use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ensure};
use tokio::sync::oneshot;

use super::error::{
    CancelledSnafu, CommandResult, InvalidInputSnafu, NotFoundSnafu, UnavailableSnafu,
};
use super::events::{LocalEventBus, ProcessingEvent, ProcessingFailure};
use super::ids::{AttachmentId, ChatEntryId, NotebookId};
use super::types::{
    Attachment, CHAT_HISTORY_LIMIT, ChatEntry, ChatRole, Notebook, PickedFile, ProcessingStatus,
};
use super::{AttachmentStore, BoxFuture, ChatStore, NotebookStore};

/// Names every command so tests can inject failures, hold calls and count them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendCommand {
    CreateNotebook,
    ListNotebooks,
    GetNotebook,
    DeleteNotebook,
    MarkNotebookAccessed,
    ChatHistory,
    SendMessage,
    Attachments,
    UploadFile,
    DeleteAttachment,
}

impl BackendCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateNotebook => "create_notebook",
            Self::ListNotebooks => "get_notebooks",
            Self::GetNotebook => "get_notebook",
            Self::DeleteNotebook => "delete_notebook",
            Self::MarkNotebookAccessed => "mark_notebook_accessed",
            Self::ChatHistory => "get_chat_history",
            Self::SendMessage => "send_message",
            Self::Attachments => "get_attachments",
            Self::UploadFile => "upload_file",
            Self::DeleteAttachment => "delete_attachment",
        }
    }
}

/// Keeps one call of a command parked until released or dropped.
#[derive(Debug)]
pub struct HeldCall {
    release: Option<oneshot::Sender<()>>,
}

impl HeldCall {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(release) = self.release.take() {
            let _ = release.send(());
        }
    }
}

impl Drop for HeldCall {
    fn drop(&mut self) {
        self.release_inner();
    }
}

type Responder = Arc<dyn Fn(&str) -> String + Send + Sync>;

#[derive(Default)]
struct MemoryState {
    notebooks: Vec<Notebook>,
    // Insertion order doubles as the tie-breaker for equal timestamps.
    chat_entries: Vec<ChatEntry>,
    attachments: Vec<Attachment>,
    picks: VecDeque<Option<PickedFile>>,
    failures: HashMap<BackendCommand, VecDeque<String>>,
    holds: HashMap<BackendCommand, VecDeque<oneshot::Receiver<()>>>,
    calls: HashMap<BackendCommand, usize>,
}

/// Process-local backend that honours the full command contract.
///
/// Ingestion is simulated: uploads start in `pending` and emit `processing-start`;
/// [`MemoryBackend::finish_ingestion`] settles them and emits the matching event.
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    events: LocalEventBus,
    responder: Responder,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_events(LocalEventBus::new())
    }

    pub fn with_events(events: LocalEventBus) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            events,
            responder: Arc::new(|message: &str| format!("Noted: {message}")),
        }
    }

    pub fn with_responder(
        mut self,
        responder: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.responder = Arc::new(responder);
        self
    }

    pub fn events(&self) -> &LocalEventBus {
        &self.events
    }

    /// Queues the next file-picker result; `None` means the user dismissed it.
    pub fn queue_pick(&self, picked: Option<PickedFile>) {
        self.lock().picks.push_back(picked);
    }

    /// Makes the next call of `command` fail with `reason`.
    pub fn fail_next(&self, command: BackendCommand, reason: impl Into<String>) {
        self.lock()
            .failures
            .entry(command)
            .or_default()
            .push_back(reason.into());
    }

    /// Parks the next call of `command` until the returned handle is released.
    pub fn hold(&self, command: BackendCommand) -> HeldCall {
        let (release, parked) = oneshot::channel();
        self.lock()
            .holds
            .entry(command)
            .or_default()
            .push_back(parked);
        HeldCall {
            release: Some(release),
        }
    }

    pub fn call_count(&self, command: BackendCommand) -> usize {
        self.lock().calls.get(&command).copied().unwrap_or(0)
    }

    pub fn attachment_status(&self, attachment_id: AttachmentId) -> Option<ProcessingStatus> {
        self.lock()
            .attachments
            .iter()
            .find(|attachment| attachment.id == attachment_id)
            .map(|attachment| attachment.status)
    }

    /// Settles ingestion for one attachment and emits the matching push event.
    pub fn finish_ingestion(
        &self,
        attachment_id: AttachmentId,
        outcome: Result<(), String>,
    ) -> CommandResult<()> {
        let status = match outcome {
            Ok(()) => ProcessingStatus::Ready,
            Err(_) => ProcessingStatus::Error,
        };

        {
            let mut state = self.lock();
            let attachment = state
                .attachments
                .iter_mut()
                .find(|attachment| attachment.id == attachment_id)
                .context(NotFoundSnafu {
                    stage: "memory-finish-ingestion",
                    entity: "attachment",
                    id: attachment_id.to_string(),
                })?;
            attachment.status = status;
        }

        let event = match outcome {
            Ok(()) => ProcessingEvent::ProcessingSuccess(attachment_id),
            Err(reason) => ProcessingEvent::ProcessingError(ProcessingFailure {
                id: attachment_id,
                reason,
            }),
        };
        self.events.emit(event);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self, command: BackendCommand) -> CommandResult<()> {
        let parked = {
            let mut state = self.lock();
            *state.calls.entry(command).or_default() += 1;
            state.holds.get_mut(&command).and_then(VecDeque::pop_front)
        };

        if let Some(parked) = parked {
            // A dropped HeldCall releases the call as well.
            let _ = parked.await;
        }

        let failure = self
            .lock()
            .failures
            .get_mut(&command)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(reason) => UnavailableSnafu {
                stage: command.name(),
                reason,
            }
            .fail(),
            None => Ok(()),
        }
    }

    fn ensure_notebook(
        state: &MemoryState,
        notebook_id: NotebookId,
        stage: &'static str,
    ) -> CommandResult<()> {
        ensure!(
            state
                .notebooks
                .iter()
                .any(|notebook| notebook.id == notebook_id),
            NotFoundSnafu {
                stage,
                entity: "notebook",
                id: notebook_id.to_string(),
            }
        );
        Ok(())
    }
}

impl NotebookStore for MemoryBackend {
    fn create_notebook(&self, title: String) -> BoxFuture<'_, CommandResult<Notebook>> {
        Box::pin(async move {
            self.enter(BackendCommand::CreateNotebook).await?;

            let title = title.trim().to_string();
            ensure!(
                !title.is_empty(),
                InvalidInputSnafu {
                    stage: "memory-create-notebook",
                    details: "notebook title must not be empty",
                }
            );

            let now = current_unix_timestamp_seconds();
            let notebook = Notebook {
                id: NotebookId::new_v4(),
                title,
                created_at: now,
                last_accessed: now,
            };
            self.lock().notebooks.push(notebook.clone());
            tracing::debug!(notebook_id = %notebook.id, "created notebook");
            Ok(notebook)
        })
    }

    fn list_notebooks(&self) -> BoxFuture<'_, CommandResult<Vec<Notebook>>> {
        Box::pin(async move {
            self.enter(BackendCommand::ListNotebooks).await?;
            let mut notebooks = self.lock().notebooks.clone();
            notebooks.sort_by(|left, right| right.last_accessed.cmp(&left.last_accessed));
            Ok(notebooks)
        })
    }

    fn get_notebook(&self, notebook_id: NotebookId) -> BoxFuture<'_, CommandResult<Notebook>> {
        Box::pin(async move {
            self.enter(BackendCommand::GetNotebook).await?;
            self.lock()
                .notebooks
                .iter()
                .find(|notebook| notebook.id == notebook_id)
                .cloned()
                .context(NotFoundSnafu {
                    stage: "memory-get-notebook",
                    entity: "notebook",
                    id: notebook_id.to_string(),
                })
        })
    }

    fn delete_notebook(&self, notebook_id: NotebookId) -> BoxFuture<'_, CommandResult<()>> {
        Box::pin(async move {
            self.enter(BackendCommand::DeleteNotebook).await?;

            let mut state = self.lock();
            Self::ensure_notebook(&state, notebook_id, "memory-delete-notebook")?;
            state.notebooks.retain(|notebook| notebook.id != notebook_id);
            state
                .chat_entries
                .retain(|entry| entry.notebook_id != notebook_id);
            state
                .attachments
                .retain(|attachment| attachment.notebook_id != notebook_id);
            Ok(())
        })
    }

    fn mark_notebook_accessed(
        &self,
        notebook_id: NotebookId,
    ) -> BoxFuture<'_, CommandResult<()>> {
        Box::pin(async move {
            self.enter(BackendCommand::MarkNotebookAccessed).await?;

            let mut state = self.lock();
            let notebook = state
                .notebooks
                .iter_mut()
                .find(|notebook| notebook.id == notebook_id)
                .context(NotFoundSnafu {
                    stage: "memory-mark-notebook-accessed",
                    entity: "notebook",
                    id: notebook_id.to_string(),
                })?;
            notebook.last_accessed = current_unix_timestamp_seconds();
            Ok(())
        })
    }
}

impl ChatStore for MemoryBackend {
    fn chat_history(
        &self,
        notebook_id: NotebookId,
    ) -> BoxFuture<'_, CommandResult<Vec<ChatEntry>>> {
        Box::pin(async move {
            self.enter(BackendCommand::ChatHistory).await?;

            let state = self.lock();
            let mut history = state
                .chat_entries
                .iter()
                .filter(|entry| entry.notebook_id == notebook_id)
                .cloned()
                .collect::<Vec<_>>();
            history.sort_by_key(|entry| entry.timestamp);
            history.truncate(CHAT_HISTORY_LIMIT);
            Ok(history)
        })
    }

    fn send_message(
        &self,
        notebook_id: NotebookId,
        message: String,
    ) -> BoxFuture<'_, CommandResult<ChatEntry>> {
        Box::pin(async move {
            self.enter(BackendCommand::SendMessage).await?;
            ensure!(
                !message.trim().is_empty(),
                InvalidInputSnafu {
                    stage: "memory-send-message",
                    details: "message must not be empty",
                }
            );

            let reply = (self.responder)(&message);
            let mut state = self.lock();
            Self::ensure_notebook(&state, notebook_id, "memory-send-message")?;

            let now = current_unix_timestamp_seconds();
            state.chat_entries.push(ChatEntry {
                id: ChatEntryId::new_v4(),
                notebook_id,
                role: ChatRole::User,
                message,
                timestamp: now,
            });
            let assistant = ChatEntry {
                id: ChatEntryId::new_v4(),
                notebook_id,
                role: ChatRole::Assistant,
                message: reply,
                timestamp: now,
            };
            state.chat_entries.push(assistant.clone());
            Ok(assistant)
        })
    }
}

impl AttachmentStore for MemoryBackend {
    fn attachments(
        &self,
        notebook_id: NotebookId,
    ) -> BoxFuture<'_, CommandResult<Vec<Attachment>>> {
        Box::pin(async move {
            self.enter(BackendCommand::Attachments).await?;

            let state = self.lock();
            // Reverse first so equal timestamps still list the newest insert first.
            let mut attachments = state
                .attachments
                .iter()
                .rev()
                .filter(|attachment| attachment.notebook_id == notebook_id)
                .cloned()
                .collect::<Vec<_>>();
            attachments.sort_by(|left, right| right.created_at.cmp(&left.created_at));
            Ok(attachments)
        })
    }

    fn upload_file(&self, notebook_id: NotebookId) -> BoxFuture<'_, CommandResult<Attachment>> {
        Box::pin(async move {
            self.enter(BackendCommand::UploadFile).await?;

            let attachment = {
                let mut state = self.lock();
                let picked = state
                    .picks
                    .pop_front()
                    .flatten()
                    .context(CancelledSnafu {
                        stage: "memory-upload-pick-file",
                    })?;
                let file_name = picked
                    .file_name()
                    .map(str::to_string)
                    .context(InvalidInputSnafu {
                        stage: "memory-upload-file-name",
                        details: "File not found.",
                    })?;
                Self::ensure_notebook(&state, notebook_id, "memory-upload-file")?;

                let attachment = Attachment {
                    id: AttachmentId::new_v4(),
                    notebook_id,
                    file_name,
                    file_type: picked.file_type(),
                    file_path: picked.path,
                    file_size: picked.size_bytes,
                    created_at: current_unix_timestamp_seconds(),
                    status: ProcessingStatus::Pending,
                };
                state.attachments.push(attachment.clone());
                attachment
            };

            self.events
                .emit(ProcessingEvent::ProcessingStart(attachment.id));
            tracing::debug!(
                notebook_id = %notebook_id,
                attachment_id = %attachment.id,
                file_name = %attachment.file_name,
                "registered upload for ingestion"
            );
            Ok(attachment)
        })
    }

    fn delete_attachment(&self, attachment_id: AttachmentId) -> BoxFuture<'_, CommandResult<()>> {
        Box::pin(async move {
            self.enter(BackendCommand::DeleteAttachment).await?;

            let mut state = self.lock();
            let before = state.attachments.len();
            state
                .attachments
                .retain(|attachment| attachment.id != attachment_id);
            ensure!(
                state.attachments.len() < before,
                NotFoundSnafu {
                    stage: "memory-delete-attachment",
                    entity: "attachment",
                    id: attachment_id.to_string(),
                }
            );
            Ok(())
        })
    }
}

fn current_unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProcessingEventKind;
    use crate::events::ProcessingEvents;

    #[tokio::test]
    async fn notebook_lifecycle_round_trips_through_listing() {
        let backend = MemoryBackend::new();
        let created = backend
            .create_notebook("Physics".to_string())
            .await
            .expect("create succeeds");
        assert!(created.created_at > 0);

        let listed = backend.list_notebooks().await.expect("list succeeds");
        assert!(listed.iter().any(|notebook| notebook.id == created.id));

        backend
            .delete_notebook(created.id)
            .await
            .expect("delete succeeds");
        let listed = backend.list_notebooks().await.expect("list succeeds");
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn send_message_persists_both_turns_in_order() {
        let backend = MemoryBackend::new().with_responder(|_| "Chapter 1 covers motion.".into());
        let notebook = backend
            .create_notebook("Physics".to_string())
            .await
            .expect("create succeeds");

        let reply = backend
            .send_message(notebook.id, "Summarize chapter 1".to_string())
            .await
            .expect("exchange succeeds");
        assert_eq!(reply.role, ChatRole::Assistant);

        let history = backend.chat_history(notebook.id).await.expect("history");
        let roles = history.iter().map(|entry| entry.role).collect::<Vec<_>>();
        assert_eq!(roles, vec![ChatRole::User, ChatRole::Assistant]);
        assert_eq!(history[0].message, "Summarize chapter 1");
        assert_eq!(history[1].message, "Chapter 1 covers motion.");
    }

    #[tokio::test]
    async fn chat_history_returns_the_oldest_entries_up_to_the_limit() {
        let backend = MemoryBackend::new().with_responder(|question| format!("re: {question}"));
        let notebook = backend
            .create_notebook("Physics".to_string())
            .await
            .expect("create succeeds");
        for turn in 0..60 {
            backend
                .send_message(notebook.id, format!("question {turn}"))
                .await
                .expect("exchange succeeds");
        }

        let history = backend.chat_history(notebook.id).await.expect("history");
        assert_eq!(history.len(), CHAT_HISTORY_LIMIT);
        assert_eq!(history[0].message, "question 0");
        assert_eq!(history[CHAT_HISTORY_LIMIT - 1].message, "re: question 49");
    }

    #[tokio::test]
    async fn dismissed_picker_is_reported_as_cancelled() {
        let backend = MemoryBackend::new();
        let notebook = backend
            .create_notebook("Physics".to_string())
            .await
            .expect("create succeeds");
        backend.queue_pick(None);

        let error = backend
            .upload_file(notebook.id)
            .await
            .expect_err("dismissed picker fails");
        assert!(error.is_cancelled());

        // An empty pick queue behaves like a dismissed dialog too.
        let error = backend
            .upload_file(notebook.id)
            .await
            .expect_err("empty queue fails");
        assert!(error.is_cancelled());
    }

    #[tokio::test]
    async fn ingestion_updates_status_and_emits_events() {
        let backend = MemoryBackend::new();
        let mut errors = backend
            .events()
            .subscribe(ProcessingEventKind::ProcessingError)
            .expect("subscribe");
        let notebook = backend
            .create_notebook("Physics".to_string())
            .await
            .expect("create succeeds");
        backend.queue_pick(Some(PickedFile::new("/tmp/notes.pdf", 512)));

        let attachment = backend.upload_file(notebook.id).await.expect("upload");
        assert_eq!(attachment.file_type, "pdf");
        assert_eq!(attachment.status, ProcessingStatus::Pending);

        backend
            .finish_ingestion(attachment.id, Err("corrupt file".to_string()))
            .expect("ingestion settles");
        assert_eq!(
            backend.attachment_status(attachment.id),
            Some(ProcessingStatus::Error)
        );
        assert_eq!(
            errors.try_recv(),
            Some(ProcessingEvent::ProcessingError(ProcessingFailure {
                id: attachment.id,
                reason: "corrupt file".to_string(),
            }))
        );
    }

    #[tokio::test]
    async fn injected_failure_applies_once_and_is_counted() {
        let backend = MemoryBackend::new();
        backend.fail_next(BackendCommand::ListNotebooks, "disk offline");

        let error = backend.list_notebooks().await.expect_err("injected failure");
        assert_eq!(error.reason(), "disk offline");
        assert!(backend.list_notebooks().await.is_ok());
        assert_eq!(backend.call_count(BackendCommand::ListNotebooks), 2);
    }

    #[tokio::test]
    async fn held_call_waits_for_release() {
        let backend = Arc::new(MemoryBackend::new());
        let held = backend.hold(BackendCommand::ListNotebooks);

        let task = tokio::spawn({
            let backend = backend.clone();
            async move { backend.list_notebooks().await }
        });
        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        held.release();
        let listed = task.await.expect("task joins").expect("list succeeds");
        assert!(listed.is_empty());
    }
}
