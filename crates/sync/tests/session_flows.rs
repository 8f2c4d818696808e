//! End-to-end session behaviour against the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use notebook_backend::{
    AttachmentStore, BackendCommand, ChatRole, ChatStore, LocalEventBus, MemoryBackend, Notebook,
    NotebookBackend, NotebookStore, PickedFile, ProcessingEvent, ProcessingEventKind,
    ProcessingFailure, ProcessingStatus,
};
use notebook_sync::{
    DeleteOutcome, LineOrigin, SessionContext, SessionError, SessionHandle, SessionSnapshot,
    Severity, SubmitOutcome, SubmitRejection, ToastQueue, mount,
};

struct Fixture {
    backend: Arc<MemoryBackend>,
    bus: LocalEventBus,
    toasts: ToastQueue,
    notebook: Notebook,
}

impl Fixture {
    async fn new() -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let bus = backend.events().clone();
        let notebook = backend
            .create_notebook("Physics".to_string())
            .await
            .expect("notebook created");
        Self {
            backend,
            bus,
            toasts: ToastQueue::default(),
            notebook,
        }
    }

    fn context(&self) -> SessionContext {
        SessionContext::new(
            Arc::clone(&self.backend) as Arc<dyn NotebookBackend>,
            Arc::new(self.bus.clone()),
            self.toasts.clone(),
        )
    }

    async fn mount_loaded(&self) -> SessionHandle {
        let session = mount(self.notebook.id, self.context()).expect("mounted");
        session.wait_for(fully_loaded).await.expect("initial load");
        session
    }

    fn toast_messages(&self, severity: Severity) -> Vec<String> {
        self.toasts
            .snapshot()
            .iter()
            .filter(|toast| toast.severity == severity)
            .map(|toast| toast.message.clone())
            .collect()
    }
}

fn fully_loaded(snapshot: &SessionSnapshot) -> bool {
    snapshot.transcript.loaded
        && snapshot.attachments.items.is_some()
        && !snapshot.attachments.loading
}

/// Lets in-flight driver work drain when no snapshot change is observable.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn upload_then_processing_error_shows_error_status_and_one_toast() {
    let fixture = Fixture::new().await;
    let session = fixture.mount_loaded().await;

    fixture
        .backend
        .queue_pick(Some(PickedFile::new("/home/user/notes.pdf", 4_096)));
    session.upload().await.expect("session running");

    let snapshot = session
        .wait_for(|snapshot| {
            snapshot
                .attachments
                .items
                .as_deref()
                .is_some_and(|items| items.iter().any(|item| item.file_name == "notes.pdf"))
        })
        .await
        .expect("upload listed");
    let uploaded = snapshot.attachments.items.as_deref().expect("loaded")[0].clone();
    assert_eq!(uploaded.status, ProcessingStatus::Pending);
    assert_eq!(uploaded.file_type, "pdf");
    assert_eq!(
        fixture.toast_messages(Severity::Success),
        vec!["Uploaded notes.pdf".to_string()]
    );

    fixture
        .backend
        .finish_ingestion(uploaded.id, Err("corrupt file".to_string()))
        .expect("attachment exists");

    let snapshot = session
        .wait_for(|snapshot| {
            snapshot
                .attachments
                .find(uploaded.id)
                .is_some_and(|item| item.status == ProcessingStatus::Error)
        })
        .await
        .expect("error status shown");
    assert_eq!(
        snapshot.attachments.find(uploaded.id).map(|item| item.file_name.as_str()),
        Some("notes.pdf")
    );

    let errors = fixture.toast_messages(Severity::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("corrupt file"));
}

#[tokio::test]
async fn redelivered_processing_error_raises_one_toast() {
    let fixture = Fixture::new().await;
    let session = fixture.mount_loaded().await;
    fixture
        .backend
        .queue_pick(Some(PickedFile::new("/home/user/notes.pdf", 4_096)));
    session.upload().await.expect("session running");
    let listed = session
        .wait_for(|snapshot| {
            snapshot
                .attachments
                .items
                .as_deref()
                .is_some_and(|items| !items.is_empty())
        })
        .await
        .expect("upload listed");
    let uploaded = listed.attachments.items.as_deref().expect("loaded")[0].clone();

    let failure = || {
        ProcessingEvent::ProcessingError(ProcessingFailure {
            id: uploaded.id,
            reason: "corrupt file".to_string(),
        })
    };
    assert_eq!(fixture.bus.emit(failure()), 1);
    assert_eq!(fixture.bus.emit(failure()), 1);

    session
        .wait_for(|snapshot| {
            snapshot
                .attachments
                .find(uploaded.id)
                .is_some_and(|item| item.status == ProcessingStatus::Error)
        })
        .await
        .expect("error status shown");
    settle().await;

    assert_eq!(
        fixture.toast_messages(Severity::Error),
        vec!["Failed to process file: corrupt file".to_string()]
    );
}

#[tokio::test]
async fn chat_exchange_shows_optimistic_turn_then_persisted_pair() {
    let fixture = Fixture::new().await;
    let session = fixture.mount_loaded().await;
    let held = fixture.backend.hold(BackendCommand::SendMessage);

    let outcome = session
        .submit("Summarize chapter 1")
        .await
        .expect("session running");
    assert_eq!(outcome, SubmitOutcome::Accepted);

    let pending = session.snapshot();
    assert!(pending.transcript.thinking);
    assert_eq!(pending.transcript.lines.len(), 1);
    assert_eq!(pending.transcript.lines[0].origin, LineOrigin::Optimistic);
    assert_eq!(pending.transcript.lines[0].role, ChatRole::User);
    assert_eq!(pending.transcript.lines[0].message, "Summarize chapter 1");

    held.release();
    let settled = session
        .wait_for(|snapshot| !snapshot.transcript.thinking && snapshot.transcript.lines.len() == 2)
        .await
        .expect("exchange settled");

    let lines = &settled.transcript.lines;
    assert!(
        lines
            .iter()
            .all(|line| matches!(line.origin, LineOrigin::Persisted(_)))
    );
    assert_eq!(lines[0].role, ChatRole::User);
    assert_eq!(lines[0].message, "Summarize chapter 1");
    assert_eq!(lines[1].role, ChatRole::Assistant);
}

#[tokio::test]
async fn second_submit_while_thinking_is_rejected_without_backend_call() {
    let fixture = Fixture::new().await;
    let session = fixture.mount_loaded().await;
    let held = fixture.backend.hold(BackendCommand::SendMessage);

    session.submit("first").await.expect("session running");
    let second = session.submit("second").await.expect("session running");
    assert_eq!(second, SubmitOutcome::Rejected(SubmitRejection::Thinking));

    let blank = session.submit("   ").await.expect("session running");
    assert_eq!(blank, SubmitOutcome::Rejected(SubmitRejection::Blank));

    let snapshot = session.snapshot();
    assert_eq!(snapshot.transcript.lines.len(), 1);
    assert_eq!(fixture.backend.call_count(BackendCommand::SendMessage), 1);

    drop(held);
    session
        .wait_for(|snapshot| !snapshot.transcript.thinking)
        .await
        .expect("exchange settled");
}

#[tokio::test]
async fn failed_exchange_drops_turn_and_toasts_reason() {
    let fixture = Fixture::new().await;
    let session = fixture.mount_loaded().await;
    fixture
        .backend
        .fail_next(BackendCommand::SendMessage, "model offline");

    session.submit("hello").await.expect("session running");
    let snapshot = session
        .wait_for(|snapshot| !snapshot.transcript.thinking)
        .await
        .expect("exchange settled");

    assert_eq!(snapshot.transcript.lines.len(), 1);
    assert_eq!(snapshot.transcript.lines[0].origin, LineOrigin::Greeting);
    assert_eq!(
        fixture.toast_messages(Severity::Error),
        vec!["model offline".to_string()]
    );
}

#[tokio::test]
async fn reload_without_changes_is_idempotent() {
    let fixture = Fixture::new().await;
    fixture
        .backend
        .send_message(fixture.notebook.id, "What is inertia?".to_string())
        .await
        .expect("exchange");
    let session = fixture.mount_loaded().await;
    let before = session.snapshot();

    session.reload().await.expect("session running");
    session.reload().await.expect("session running");
    let after = session
        .wait_for(|snapshot| !snapshot.transcript.loading && !snapshot.attachments.loading)
        .await
        .expect("reloaded");

    assert!(after.revision > before.revision);
    assert_eq!(fixture.backend.call_count(BackendCommand::ChatHistory), 3);
    assert_eq!(after.transcript, before.transcript);
    assert_eq!(after.attachments, before.attachments);
}

#[tokio::test]
async fn superseded_attachment_fetch_is_discarded() {
    let fixture = Fixture::new().await;
    let held = fixture.backend.hold(BackendCommand::Attachments);
    let session = mount(fixture.notebook.id, fixture.context()).expect("mounted");

    session.reload().await.expect("session running");
    let newest = session
        .wait_for(|snapshot| snapshot.attachments.items.is_some() && !snapshot.attachments.loading)
        .await
        .expect("newest fetch applied");
    assert_eq!(newest.attachments.items.as_deref().map(<[_]>::len), Some(0));

    // The held fetch resolves after this insert and would list it if it were applied.
    fixture
        .backend
        .queue_pick(Some(PickedFile::new("/tmp/late.txt", 12)));
    fixture
        .backend
        .upload_file(fixture.notebook.id)
        .await
        .expect("uploaded");
    held.release();
    settle().await;

    let snapshot = session.snapshot();
    assert_eq!(snapshot.attachments.items.as_deref().map(<[_]>::len), Some(0));
    assert_eq!(fixture.backend.call_count(BackendCommand::Attachments), 2);
}

#[tokio::test]
async fn processing_success_marks_ready_and_refetches() {
    let fixture = Fixture::new().await;
    let session = fixture.mount_loaded().await;
    fixture
        .backend
        .queue_pick(Some(PickedFile::new("/tmp/chapter.md", 512)));
    let uploaded = fixture
        .backend
        .upload_file(fixture.notebook.id)
        .await
        .expect("uploaded");

    fixture
        .backend
        .finish_ingestion(uploaded.id, Ok(()))
        .expect("attachment exists");

    let snapshot = session
        .wait_for(|snapshot| {
            snapshot
                .attachments
                .find(uploaded.id)
                .is_some_and(|item| item.status == ProcessingStatus::Ready)
        })
        .await
        .expect("ready shown");
    assert!(fixture.toasts.is_empty());
    assert_eq!(snapshot.attachments.items.as_deref().map(<[_]>::len), Some(1));
}

#[tokio::test]
async fn cancelled_upload_is_silent() {
    let fixture = Fixture::new().await;
    let session = fixture.mount_loaded().await;
    fixture.backend.queue_pick(None);

    session.upload().await.expect("session running");
    settle().await;

    assert_eq!(fixture.backend.call_count(BackendCommand::UploadFile), 1);
    assert!(fixture.toasts.is_empty());
    assert_eq!(
        session.snapshot().attachments.items.as_deref().map(<[_]>::len),
        Some(0)
    );
}

#[tokio::test]
async fn confirmed_delete_removes_attachment_after_refetch() {
    let fixture = Fixture::new().await;
    fixture
        .backend
        .queue_pick(Some(PickedFile::new("/tmp/notes.pdf", 64)));
    let uploaded = fixture
        .backend
        .upload_file(fixture.notebook.id)
        .await
        .expect("uploaded");
    let session = fixture.mount_loaded().await;

    let outcome = session
        .delete_attachment(uploaded.id, &uploaded.file_name)
        .await
        .expect("session running");
    assert_eq!(outcome, DeleteOutcome::Requested);

    session
        .wait_for(|snapshot| {
            snapshot
                .attachments
                .items
                .as_deref()
                .is_some_and(<[_]>::is_empty)
        })
        .await
        .expect("row removed");
}

#[tokio::test]
async fn failed_delete_keeps_row_and_toasts() {
    let fixture = Fixture::new().await;
    fixture
        .backend
        .queue_pick(Some(PickedFile::new("/tmp/notes.pdf", 64)));
    let uploaded = fixture
        .backend
        .upload_file(fixture.notebook.id)
        .await
        .expect("uploaded");
    let session = fixture.mount_loaded().await;
    fixture
        .backend
        .fail_next(BackendCommand::DeleteAttachment, "file is locked");

    session
        .delete_attachment(uploaded.id, &uploaded.file_name)
        .await
        .expect("session running");
    settle().await;

    assert_eq!(
        fixture.toast_messages(Severity::Error),
        vec!["file is locked".to_string()]
    );
    assert!(session.snapshot().attachments.find(uploaded.id).is_some());
}

#[tokio::test]
async fn late_events_after_unmount_are_dropped() {
    let fixture = Fixture::new().await;
    let session = fixture.mount_loaded().await;
    assert_eq!(fixture.bus.listener_count(), ProcessingEventKind::ALL.len());

    session.unmount().await;
    assert_eq!(fixture.bus.listener_count(), 0);

    fixture
        .backend
        .queue_pick(Some(PickedFile::new("/tmp/late.pdf", 1)));
    let late = fixture
        .backend
        .upload_file(fixture.notebook.id)
        .await
        .expect("uploaded");
    let delivered = fixture.bus.emit(ProcessingEvent::ProcessingSuccess(late.id));
    assert_eq!(delivered, 0);
    assert!(fixture.toasts.is_empty());
}

#[tokio::test]
async fn dropping_the_handle_also_unmounts() {
    let fixture = Fixture::new().await;
    let session = fixture.mount_loaded().await;
    drop(session);
    settle().await;

    assert_eq!(fixture.bus.listener_count(), 0);
}

#[tokio::test]
async fn failed_mount_releases_every_subscription() {
    let fixture = Fixture::new().await;
    fixture
        .bus
        .set_refused(ProcessingEventKind::ProcessingError, true);

    let error = mount(fixture.notebook.id, fixture.context()).expect_err("mount refused");
    assert!(matches!(error, SessionError::Subscribe { .. }));
    assert_eq!(fixture.bus.listener_count(), 0);
    assert_eq!(fixture.backend.call_count(BackendCommand::ChatHistory), 0);
}

#[tokio::test]
async fn switching_notebooks_keeps_sessions_isolated() {
    let fixture = Fixture::new().await;
    let other = fixture
        .backend
        .create_notebook("Chemistry".to_string())
        .await
        .expect("notebook created");
    fixture
        .backend
        .send_message(other.id, "Balance this equation".to_string())
        .await
        .expect("exchange");

    let first = fixture.mount_loaded().await;
    first.unmount().await;

    let second = mount(other.id, fixture.context()).expect("mounted");
    let snapshot = second.wait_for(fully_loaded).await.expect("loaded");
    assert_eq!(snapshot.notebook_id, other.id);
    assert_eq!(snapshot.transcript.lines.len(), 2);
    assert_eq!(fixture.bus.listener_count(), ProcessingEventKind::ALL.len());
}
