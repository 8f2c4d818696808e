use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::StreamExt;
use futures::stream::SelectAll;
use notebook_backend::{
    Attachment, AttachmentId, BoxFuture, ChatEntry, CommandError, CommandResult, EventSubscription,
    NotebookBackend, NotebookId, ProcessingEvent, ProcessingEventKind, ProcessingEvents,
};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::attachments::AttachmentEngine;
use crate::chat::{ChatEngine, ExchangeTicket, SubmitRejection, TranscriptView};
use crate::resource::LoadTicket;
use crate::settings::SyncSettings;
use crate::toast::ToastQueue;
use crate::{Effect, show_notice};

const INTENT_CAPACITY: usize = 32;

/// Interactive yes/no question asked before destructive actions.
pub trait ConfirmPrompt: Send + Sync {
    fn confirm<'a>(&'a self, message: &'a str) -> BoxFuture<'a, bool>;
}

/// Accepts every prompt. Used by headless shells.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysConfirm;

impl ConfirmPrompt for AlwaysConfirm {
    fn confirm<'a>(&'a self, _message: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async { true })
    }
}

/// Collaborators shared by every session a shell mounts.
#[derive(Clone)]
pub struct SessionContext {
    pub backend: Arc<dyn NotebookBackend>,
    pub events: Arc<dyn ProcessingEvents>,
    pub toasts: ToastQueue,
    pub settings: Arc<SyncSettings>,
    pub confirm: Arc<dyn ConfirmPrompt>,
}

impl SessionContext {
    pub fn new(
        backend: Arc<dyn NotebookBackend>,
        events: Arc<dyn ProcessingEvents>,
        toasts: ToastQueue,
    ) -> Self {
        Self {
            backend,
            events,
            toasts,
            settings: Arc::new(SyncSettings::default()),
            confirm: Arc::new(AlwaysConfirm),
        }
    }

    pub fn with_settings(mut self, settings: Arc<SyncSettings>) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_confirm(mut self, confirm: Arc<dyn ConfirmPrompt>) -> Self {
        self.confirm = confirm;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentsView {
    /// `None` until the first fetch succeeds.
    pub items: Option<Vec<Attachment>>,
    pub loading: bool,
    pub error: Option<String>,
}

impl AttachmentsView {
    pub fn find(&self, attachment_id: AttachmentId) -> Option<&Attachment> {
        self.items
            .as_deref()
            .and_then(|items| items.iter().find(|item| item.id == attachment_id))
    }
}

/// Immutable view of one mounted notebook, republished after every driver step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub notebook_id: NotebookId,
    pub revision: u64,
    pub mounted: bool,
    pub transcript: TranscriptView,
    pub attachments: AttachmentsView,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected(SubmitRejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Declined,
    Requested,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("notebook session is no longer running on `{stage}`"))]
    Closed { stage: &'static str },
    #[snafu(display("failed to subscribe to {event} on `{stage}`: {source}"))]
    Subscribe {
        stage: &'static str,
        event: &'static str,
        source: CommandError,
    },
}

enum Intent {
    Submit {
        text: String,
        ack: oneshot::Sender<SubmitOutcome>,
    },
    Upload {
        ack: oneshot::Sender<()>,
    },
    DeleteAttachment {
        attachment_id: AttachmentId,
        ack: oneshot::Sender<()>,
    },
    Reload {
        ack: oneshot::Sender<()>,
    },
}

enum Completion {
    Accessed(CommandResult<()>),
    History {
        ticket: LoadTicket,
        result: CommandResult<Vec<ChatEntry>>,
    },
    Attachments {
        ticket: LoadTicket,
        result: CommandResult<Vec<Attachment>>,
    },
    Exchanged {
        ticket: ExchangeTicket,
        result: CommandResult<ChatEntry>,
    },
    Uploaded(CommandResult<Attachment>),
    Deleted {
        attachment_id: AttachmentId,
        result: CommandResult<()>,
    },
}

enum Wake {
    Shutdown,
    Intent(Option<Intent>),
    Event(Option<ProcessingEvent>),
    Completed(Result<Completion, JoinError>),
}

/// Mounts a notebook: registers every push-event listener, starts the initial fetches
/// and spawns the driver task. Must be called inside a tokio runtime.
///
/// If any registration fails the ones already made are released before returning.
pub fn mount(notebook_id: NotebookId, ctx: SessionContext) -> Result<SessionHandle, SessionError> {
    let subscriptions = ProcessingEventKind::ALL
        .iter()
        .map(|kind| {
            ctx.events.subscribe(*kind).context(SubscribeSnafu {
                stage: "mount-subscribe",
                event: kind.name(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let (intent_tx, intent_rx) = mpsc::channel(INTENT_CAPACITY);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (revision_tx, revision_rx) = watch::channel(0);

    let mut driver = SessionDriver::new(notebook_id, ctx.clone(), revision_tx);
    driver.start();
    let published = Arc::clone(&driver.published);

    tracing::info!(notebook_id = %notebook_id, "mounted notebook session");
    let task = tokio::spawn(driver.run(intent_rx, shutdown_rx, subscriptions));

    Ok(SessionHandle {
        notebook_id,
        intents: intent_tx,
        shutdown: Some(shutdown_tx),
        driver: Some(task),
        published,
        revision: revision_rx,
        settings: ctx.settings,
        confirm: ctx.confirm,
    })
}

/// Shell-side handle to a mounted notebook. Dropping it unmounts the session.
pub struct SessionHandle {
    notebook_id: NotebookId,
    intents: mpsc::Sender<Intent>,
    shutdown: Option<oneshot::Sender<()>>,
    driver: Option<JoinHandle<()>>,
    published: Arc<ArcSwap<SessionSnapshot>>,
    revision: watch::Receiver<u64>,
    settings: Arc<SyncSettings>,
    confirm: Arc<dyn ConfirmPrompt>,
}

impl SessionHandle {
    pub fn notebook_id(&self) -> NotebookId {
        self.notebook_id
    }

    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.published.load_full()
    }

    pub async fn submit(&self, text: impl Into<String>) -> Result<SubmitOutcome, SessionError> {
        let text = text.into();
        self.request(|ack| Intent::Submit { text, ack }).await
    }

    /// Opens the picker through the backend. Resolves once the call is dispatched.
    pub async fn upload(&self) -> Result<(), SessionError> {
        self.request(|ack| Intent::Upload { ack }).await
    }

    /// Asks `Delete <display_name>?` first when confirmations are enabled.
    pub async fn delete_attachment(
        &self,
        attachment_id: AttachmentId,
        display_name: &str,
    ) -> Result<DeleteOutcome, SessionError> {
        if self.settings.confirm_deletes {
            let question = format!("Delete {display_name}?");
            if !self.confirm.confirm(&question).await {
                tracing::debug!(attachment_id = %attachment_id, "attachment delete declined");
                return Ok(DeleteOutcome::Declined);
            }
        }

        self.request(|ack| Intent::DeleteAttachment { attachment_id, ack }).await?;
        Ok(DeleteOutcome::Requested)
    }

    /// Refetches both the transcript and the attachment list.
    pub async fn reload(&self) -> Result<(), SessionError> {
        self.request(|ack| Intent::Reload { ack }).await
    }

    /// Resolves with the first published snapshot matching `predicate`.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<Arc<SessionSnapshot>, SessionError> {
        let mut revision = self.revision.clone();
        loop {
            let _seen = *revision.borrow_and_update();
            let snapshot = self.snapshot();
            if predicate(&snapshot) {
                return Ok(snapshot);
            }
            if !snapshot.mounted {
                return ClosedSnafu {
                    stage: "wait-for-snapshot",
                }
                .fail();
            }
            revision.changed().await.ok().context(ClosedSnafu {
                stage: "wait-for-snapshot",
            })?;
        }
    }

    /// Stops the driver and waits until every listener is released.
    pub async fn unmount(mut self) {
        self.signal_shutdown();
        let Some(driver) = self.driver.take() else {
            return;
        };
        if let Err(error) = driver.await {
            tracing::warn!(notebook_id = %self.notebook_id, error = %error, "session driver ended abnormally");
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Intent,
    ) -> Result<T, SessionError> {
        let (ack, acked) = oneshot::channel();
        self.intents
            .send(build(ack))
            .await
            .ok()
            .context(ClosedSnafu {
                stage: "send-intent",
            })?;
        acked.await.ok().context(ClosedSnafu {
            stage: "await-intent",
        })
    }

    fn signal_shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SessionHandle")
            .field("notebook_id", &self.notebook_id)
            .field("revision", &self.snapshot().revision)
            .finish()
    }
}

/// Sole owner of one session's engines.
struct SessionDriver {
    notebook_id: NotebookId,
    ctx: SessionContext,
    chat: ChatEngine,
    attachments: AttachmentEngine,
    tasks: JoinSet<Completion>,
    published: Arc<ArcSwap<SessionSnapshot>>,
    revision_tx: watch::Sender<u64>,
    revision: u64,
}

impl SessionDriver {
    fn new(notebook_id: NotebookId, ctx: SessionContext, revision_tx: watch::Sender<u64>) -> Self {
        let chat = ChatEngine::new(notebook_id);
        let attachments = AttachmentEngine::new(notebook_id);
        let initial = SessionSnapshot {
            notebook_id,
            revision: 0,
            mounted: true,
            transcript: chat.transcript(&ctx.settings.default_greeting),
            attachments: attachments_view(&attachments),
        };

        Self {
            notebook_id,
            ctx,
            chat,
            attachments,
            tasks: JoinSet::new(),
            published: Arc::new(ArcSwap::from_pointee(initial)),
            revision_tx,
            revision: 0,
        }
    }

    fn start(&mut self) {
        let backend = Arc::clone(&self.ctx.backend);
        let notebook_id = self.notebook_id;
        self.tasks.spawn(async move {
            Completion::Accessed(backend.mark_notebook_accessed(notebook_id).await)
        });
        self.load_history();
        self.load_attachments();
        self.publish(true);
    }

    async fn run(
        mut self,
        mut intents: mpsc::Receiver<Intent>,
        mut shutdown: oneshot::Receiver<()>,
        subscriptions: Vec<EventSubscription>,
    ) {
        let mut events: SelectAll<EventSubscription> = futures::stream::select_all(subscriptions);
        let mut events_open = true;

        loop {
            let wake = tokio::select! {
                biased;
                _ = &mut shutdown => Wake::Shutdown,
                intent = intents.recv() => Wake::Intent(intent),
                event = events.next(), if events_open => Wake::Event(event),
                Some(joined) = self.tasks.join_next() => Wake::Completed(joined),
            };

            match wake {
                Wake::Shutdown | Wake::Intent(None) => break,
                Wake::Intent(Some(intent)) => {
                    self.handle_intent(intent);
                    continue;
                }
                Wake::Event(Some(event)) => self.handle_event(event),
                Wake::Event(None) => {
                    tracing::warn!(notebook_id = %self.notebook_id, "processing event channel closed");
                    events_open = false;
                    continue;
                }
                Wake::Completed(Ok(completion)) => self.handle_completion(completion),
                Wake::Completed(Err(error)) => {
                    tracing::warn!(notebook_id = %self.notebook_id, error = %error, "backend task failed");
                    continue;
                }
            }
            self.publish(true);
        }

        drop(events);
        self.tasks.abort_all();
        self.publish(false);
        tracing::info!(notebook_id = %self.notebook_id, "unmounted notebook session");
    }

    /// Publishes before acknowledging so the caller observes the intent's effect.
    fn handle_intent(&mut self, intent: Intent) {
        match intent {
            Intent::Submit { text, ack } => {
                let outcome = match self.chat.begin_submit(&text) {
                    Ok(ticket) => {
                        let backend = Arc::clone(&self.ctx.backend);
                        let notebook_id = self.notebook_id;
                        self.tasks.spawn(async move {
                            Completion::Exchanged {
                                ticket,
                                result: backend.send_message(notebook_id, text).await,
                            }
                        });
                        SubmitOutcome::Accepted
                    }
                    Err(rejection) => {
                        tracing::debug!(notebook_id = %self.notebook_id, ?rejection, "submit rejected");
                        SubmitOutcome::Rejected(rejection)
                    }
                };
                self.publish(true);
                let _ = ack.send(outcome);
            }
            Intent::Upload { ack } => {
                let backend = Arc::clone(&self.ctx.backend);
                let notebook_id = self.notebook_id;
                self.tasks.spawn(async move {
                    Completion::Uploaded(backend.upload_file(notebook_id).await)
                });
                self.publish(true);
                let _ = ack.send(());
            }
            Intent::DeleteAttachment { attachment_id, ack } => {
                let backend = Arc::clone(&self.ctx.backend);
                self.tasks.spawn(async move {
                    Completion::Deleted {
                        attachment_id,
                        result: backend.delete_attachment(attachment_id).await,
                    }
                });
                self.publish(true);
                let _ = ack.send(());
            }
            Intent::Reload { ack } => {
                self.load_history();
                self.load_attachments();
                self.publish(true);
                let _ = ack.send(());
            }
        }
    }

    fn handle_event(&mut self, event: ProcessingEvent) {
        tracing::debug!(
            notebook_id = %self.notebook_id,
            event = event.kind().name(),
            attachment_id = %event.attachment_id(),
            "processing event"
        );
        let effects = self.attachments.apply_event(event);
        self.run_effects(effects, Self::load_attachments);
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Accessed(Ok(())) => {}
            Completion::Accessed(Err(error)) => {
                tracing::warn!(notebook_id = %self.notebook_id, error = %error, "failed to mark notebook accessed");
            }
            Completion::History { ticket, result } => {
                self.chat.finish_load(ticket, result);
            }
            Completion::Attachments { ticket, result } => {
                self.attachments.finish_load(ticket, result);
            }
            Completion::Exchanged { ticket, result } => {
                let effects = self.chat.settle(ticket, result);
                self.run_effects(effects, Self::load_history);
            }
            Completion::Uploaded(result) => {
                let effects = self.attachments.upload_settled(result);
                self.run_effects(effects, Self::load_attachments);
            }
            Completion::Deleted {
                attachment_id,
                result,
            } => {
                let effects = self.attachments.delete_settled(attachment_id, result);
                self.run_effects(effects, Self::load_attachments);
            }
        }
    }

    fn run_effects(&mut self, effects: Vec<Effect>, reload: fn(&mut Self)) {
        for effect in effects {
            match effect {
                Effect::Reload => reload(self),
                Effect::Notify(notice) => {
                    show_notice(&self.ctx.toasts, &self.ctx.settings, notice);
                }
            }
        }
    }

    fn load_history(&mut self) {
        let ticket = self.chat.begin_load();
        let backend = Arc::clone(&self.ctx.backend);
        let notebook_id = self.notebook_id;
        self.tasks.spawn(async move {
            Completion::History {
                ticket,
                result: backend.chat_history(notebook_id).await,
            }
        });
    }

    fn load_attachments(&mut self) {
        let ticket = self.attachments.begin_load();
        let backend = Arc::clone(&self.ctx.backend);
        let notebook_id = self.notebook_id;
        self.tasks.spawn(async move {
            Completion::Attachments {
                ticket,
                result: backend.attachments(notebook_id).await,
            }
        });
    }

    fn publish(&mut self, mounted: bool) {
        self.revision += 1;
        let snapshot = SessionSnapshot {
            notebook_id: self.notebook_id,
            revision: self.revision,
            mounted,
            transcript: self.chat.transcript(&self.ctx.settings.default_greeting),
            attachments: attachments_view(&self.attachments),
        };
        self.published.store(Arc::new(snapshot));
        self.revision_tx.send_replace(self.revision);
    }
}

fn attachments_view(engine: &AttachmentEngine) -> AttachmentsView {
    AttachmentsView {
        items: engine.view(),
        loading: engine.is_loading(),
        error: engine.last_error().map(str::to_string),
    }
}
