use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use notebook_backend::{CommandResult, Notebook, NotebookBackend, NotebookId};

use crate::resource::{LoadOutcome, LoadTicket, Loadable};
use crate::settings::SyncSettings;
use crate::toast::{Notice, ToastQueue};
use crate::{Effect, show_notice};

/// Home-screen notebook list.
#[derive(Debug, Clone, Default)]
pub struct NotebookCatalog {
    persisted: Loadable<Notebook>,
}

impl NotebookCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_load(&mut self) -> LoadTicket {
        self.persisted.begin()
    }

    pub fn finish_load(
        &mut self,
        ticket: LoadTicket,
        result: CommandResult<Vec<Notebook>>,
    ) -> LoadOutcome {
        let outcome = self.persisted.accept(ticket, result);
        match outcome {
            LoadOutcome::Replaced => tracing::debug!(
                notebook_count = self.persisted.items().map_or(0, <[Notebook]>::len),
                "notebook list replaced"
            ),
            LoadOutcome::Failed => tracing::warn!(
                error = self.persisted.last_error().unwrap_or_default(),
                "notebook list fetch failed"
            ),
            LoadOutcome::Stale => tracing::debug!(
                ticket = ticket.sequence(),
                "discarded stale notebook list fetch"
            ),
        }
        outcome
    }

    pub fn created(&mut self, result: &CommandResult<Notebook>) -> Vec<Effect> {
        match result {
            Ok(notebook) => {
                tracing::info!(notebook_id = %notebook.id, title = %notebook.title, "notebook created");
                vec![
                    Effect::Notify(Notice::success("Notebook created")),
                    Effect::Reload,
                ]
            }
            Err(error) => {
                tracing::warn!(error = %error, "notebook create failed");
                vec![Effect::Notify(Notice::error(format!(
                    "Failed to create: {}",
                    error.reason()
                )))]
            }
        }
    }

    pub fn deleted(&mut self, notebook_id: NotebookId, result: &CommandResult<()>) -> Vec<Effect> {
        match result {
            Ok(()) => {
                tracing::info!(notebook_id = %notebook_id, "notebook deleted");
                vec![
                    Effect::Notify(Notice::success("Notebook deleted")),
                    Effect::Reload,
                ]
            }
            Err(error) => {
                tracing::warn!(notebook_id = %notebook_id, error = %error, "notebook delete failed");
                vec![Effect::Notify(Notice::error(format!(
                    "Failed to delete: {}",
                    error.reason()
                )))]
            }
        }
    }

    pub fn notebooks(&self) -> Option<&[Notebook]> {
        self.persisted.items()
    }

    pub fn is_loading(&self) -> bool {
        self.persisted.is_loading()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.persisted.last_error()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogView {
    pub notebooks: Option<Vec<Notebook>>,
    pub loading: bool,
    pub error: Option<String>,
}

/// Drives a [`NotebookCatalog`] against the backend.
///
/// Calls may overlap; the catalog lock is never held across a backend await, and load
/// tickets keep the newest fetch authoritative.
pub struct CatalogController {
    backend: Arc<dyn NotebookBackend>,
    toasts: ToastQueue,
    settings: Arc<SyncSettings>,
    catalog: Mutex<NotebookCatalog>,
}

impl CatalogController {
    pub fn new(
        backend: Arc<dyn NotebookBackend>,
        toasts: ToastQueue,
        settings: Arc<SyncSettings>,
    ) -> Self {
        Self {
            backend,
            toasts,
            settings,
            catalog: Mutex::new(NotebookCatalog::new()),
        }
    }

    pub async fn load(&self) -> LoadOutcome {
        let ticket = self.lock().begin_load();
        let result = self.backend.list_notebooks().await;
        self.lock().finish_load(ticket, result)
    }

    /// Creates a notebook, falling back to the untitled title for blank input.
    pub async fn create(&self, title: &str) -> Option<Notebook> {
        let title = self.settings.resolve_title(title);
        let result = self.backend.create_notebook(title).await;
        let effects = self.lock().created(&result);
        self.run(effects).await;
        result.ok()
    }

    pub async fn delete(&self, notebook_id: NotebookId) -> bool {
        let result = self.backend.delete_notebook(notebook_id).await;
        let effects = self.lock().deleted(notebook_id, &result);
        self.run(effects).await;
        result.is_ok()
    }

    pub fn view(&self) -> CatalogView {
        let catalog = self.lock();
        CatalogView {
            notebooks: catalog.notebooks().map(<[Notebook]>::to_vec),
            loading: catalog.is_loading(),
            error: catalog.last_error().map(str::to_string),
        }
    }

    async fn run(&self, effects: Vec<Effect>) {
        let mut reload = false;
        for effect in effects {
            match effect {
                Effect::Notify(notice) => {
                    show_notice(&self.toasts, &self.settings, notice);
                }
                Effect::Reload => reload = true,
            }
        }
        if reload {
            self.load().await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, NotebookCatalog> {
        self.catalog.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
