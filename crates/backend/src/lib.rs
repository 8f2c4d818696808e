pub mod error;
pub mod events;
pub mod ids;
pub mod memory;
pub mod types;

use std::future::Future;
use std::pin::Pin;

pub use error::{CommandError, CommandResult, IdError, NO_FILE_SELECTED_REASON};
pub use events::{
    EventSubscription, LocalEventBus, ProcessingEvent, ProcessingEventKind, ProcessingEvents,
    ProcessingFailure,
};
pub use ids::{AttachmentId, ChatEntryId, NotebookId};
pub use memory::{BackendCommand, HeldCall, MemoryBackend};
pub use types::{
    Attachment, CHAT_HISTORY_LIMIT, ChatEntry, ChatRole, FALLBACK_FILE_TYPE, Notebook, PickedFile,
    ProcessingStatus,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait NotebookStore: Send + Sync {
    fn create_notebook(&self, title: String) -> BoxFuture<'_, CommandResult<Notebook>>;
    fn list_notebooks(&self) -> BoxFuture<'_, CommandResult<Vec<Notebook>>>;
    fn get_notebook(&self, notebook_id: NotebookId) -> BoxFuture<'_, CommandResult<Notebook>>;
    fn delete_notebook(&self, notebook_id: NotebookId) -> BoxFuture<'_, CommandResult<()>>;
    fn mark_notebook_accessed(&self, notebook_id: NotebookId)
    -> BoxFuture<'_, CommandResult<()>>;
}

pub trait ChatStore: Send + Sync {
    /// Oldest-first transcript, capped at [`CHAT_HISTORY_LIMIT`] entries.
    fn chat_history(&self, notebook_id: NotebookId) -> BoxFuture<'_, CommandResult<Vec<ChatEntry>>>;
    /// Runs one exchange and returns the assistant's persisted reply.
    fn send_message(
        &self,
        notebook_id: NotebookId,
        message: String,
    ) -> BoxFuture<'_, CommandResult<ChatEntry>>;
}

pub trait AttachmentStore: Send + Sync {
    /// Newest-first attachment list.
    fn attachments(&self, notebook_id: NotebookId)
    -> BoxFuture<'_, CommandResult<Vec<Attachment>>>;
    /// Opens the file picker and registers the chosen file for ingestion.
    fn upload_file(&self, notebook_id: NotebookId) -> BoxFuture<'_, CommandResult<Attachment>>;
    fn delete_attachment(&self, attachment_id: AttachmentId) -> BoxFuture<'_, CommandResult<()>>;
}

pub trait NotebookBackend: NotebookStore + ChatStore + AttachmentStore {}

impl<T> NotebookBackend for T where T: NotebookStore + ChatStore + AttachmentStore {}
