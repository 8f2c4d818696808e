pub mod attachments;
pub mod catalog;
pub mod chat;
pub mod reconcile;
pub mod resource;
pub mod session;
pub mod settings;
pub mod toast;

pub use attachments::{AttachmentEngine, StatusOverlay};
pub use catalog::{CatalogController, CatalogView, NotebookCatalog};
pub use chat::{
    ChatEngine, DEFAULT_GREETING, ExchangeState, ExchangeTicket, LineOrigin, OptimisticTurn,
    SubmitRejection, TranscriptLine, TranscriptView,
};
pub use reconcile::{OverlayPolicy, reconcile};
pub use resource::{LoadOutcome, LoadTicket, Loadable};
pub use session::{
    AlwaysConfirm, AttachmentsView, ConfirmPrompt, DeleteOutcome, SessionContext, SessionError,
    SessionHandle, SessionSnapshot, SubmitOutcome, mount,
};
pub use settings::{ConfigError, SettingsStore, SyncSettings};
pub use toast::{DEFAULT_TOAST_DURATION, Notice, Severity, Toast, ToastId, ToastQueue};

/// Follow-up work an engine asks its driver to perform after a state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Refetch the engine's authoritative list.
    Reload,
    Notify(Notice),
}

pub(crate) fn show_notice(toasts: &ToastQueue, settings: &SyncSettings, notice: Notice) -> ToastId {
    let duration = settings.duration_for(notice.severity);
    toasts.notify(notice, duration)
}
