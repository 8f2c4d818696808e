use std::collections::HashMap;

use notebook_backend::{
    Attachment, AttachmentId, CommandResult, NotebookId, ProcessingEvent, ProcessingStatus,
};

use crate::Effect;
use crate::reconcile::{OverlayPolicy, reconcile};
use crate::resource::{LoadOutcome, LoadTicket, Loadable};
use crate::toast::Notice;

/// Locally observed ingestion status, fresher than the last fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusOverlay {
    statuses: HashMap<AttachmentId, ProcessingStatus>,
}

impl StatusOverlay {
    /// Last write per id wins.
    pub fn record(&mut self, id: AttachmentId, status: ProcessingStatus) {
        self.statuses.insert(id, status);
    }

    pub fn get(&self, id: AttachmentId) -> Option<ProcessingStatus> {
        self.statuses.get(&id).copied()
    }

    pub fn forget(&mut self, id: AttachmentId) -> bool {
        self.statuses.remove(&id).is_some()
    }

    /// Drops entries the fetched records already agree with.
    pub fn prune_confirmed(&mut self, persisted: &[Attachment]) -> usize {
        let before = self.statuses.len();
        for attachment in persisted {
            if self.statuses.get(&attachment.id) == Some(&attachment.status) {
                self.statuses.remove(&attachment.id);
            }
        }
        before - self.statuses.len()
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

impl OverlayPolicy<Attachment> for StatusOverlay {
    fn patch(&self, item: &mut Attachment) {
        if let Some(status) = self.get(item.id) {
            item.status = status;
        }
    }
}

/// Persisted attachment list reconciled with the processing-status overlay.
#[derive(Debug, Clone)]
pub struct AttachmentEngine {
    notebook_id: NotebookId,
    persisted: Loadable<Attachment>,
    overlay: StatusOverlay,
}

impl AttachmentEngine {
    pub fn new(notebook_id: NotebookId) -> Self {
        Self {
            notebook_id,
            persisted: Loadable::new(),
            overlay: StatusOverlay::default(),
        }
    }

    pub fn notebook_id(&self) -> NotebookId {
        self.notebook_id
    }

    pub fn begin_load(&mut self) -> LoadTicket {
        self.persisted.begin()
    }

    pub fn finish_load(
        &mut self,
        ticket: LoadTicket,
        result: CommandResult<Vec<Attachment>>,
    ) -> LoadOutcome {
        let outcome = self.persisted.accept(ticket, result);
        match outcome {
            LoadOutcome::Replaced => {
                if let Some(persisted) = self.persisted.items() {
                    let pruned = self.overlay.prune_confirmed(persisted);
                    tracing::debug!(
                        notebook_id = %self.notebook_id,
                        attachment_count = persisted.len(),
                        pruned,
                        "attachment list replaced"
                    );
                }
            }
            LoadOutcome::Failed => {
                tracing::warn!(
                    notebook_id = %self.notebook_id,
                    error = self.persisted.last_error().unwrap_or_default(),
                    "attachment fetch failed"
                );
            }
            LoadOutcome::Stale => {
                tracing::debug!(
                    notebook_id = %self.notebook_id,
                    ticket = ticket.sequence(),
                    "discarded stale attachment fetch"
                );
            }
        }
        outcome
    }

    pub fn upload_settled(&mut self, result: CommandResult<Attachment>) -> Vec<Effect> {
        match result {
            Ok(attachment) => {
                self.overlay.record(attachment.id, ProcessingStatus::Pending);
                vec![
                    Effect::Notify(Notice::success(format!(
                        "Uploaded {}",
                        attachment.file_name
                    ))),
                    Effect::Reload,
                ]
            }
            Err(error) if error.is_cancelled() => Vec::new(),
            Err(error) => {
                tracing::warn!(notebook_id = %self.notebook_id, error = %error, "upload failed");
                vec![Effect::Notify(Notice::error(error.reason()))]
            }
        }
    }

    /// No optimistic removal: the row disappears only once a fetch confirms it.
    pub fn delete_settled(
        &mut self,
        attachment_id: AttachmentId,
        result: CommandResult<()>,
    ) -> Vec<Effect> {
        match result {
            Ok(()) => {
                self.overlay.forget(attachment_id);
                vec![Effect::Reload]
            }
            Err(error) => {
                tracing::warn!(
                    attachment_id = %attachment_id,
                    error = %error,
                    "attachment delete failed"
                );
                vec![Effect::Notify(Notice::error(error.reason()))]
            }
        }
    }

    pub fn apply_event(&mut self, event: ProcessingEvent) -> Vec<Effect> {
        match event {
            ProcessingEvent::ProcessingStart(id) => {
                self.overlay.record(id, ProcessingStatus::Pending);
                Vec::new()
            }
            ProcessingEvent::ProcessingSuccess(id) => {
                self.overlay.record(id, ProcessingStatus::Ready);
                vec![Effect::Reload]
            }
            ProcessingEvent::ProcessingError(failure) => {
                // Redelivery of an already shown failure; a retry passes through `Pending` first.
                let repeated = self.displayed_status(failure.id) == Some(ProcessingStatus::Error);
                self.overlay.record(failure.id, ProcessingStatus::Error);
                if repeated {
                    tracing::debug!(attachment_id = %failure.id, "duplicate processing error");
                    return Vec::new();
                }
                vec![Effect::Notify(Notice::error(format!(
                    "Failed to process file: {}",
                    failure.reason
                )))]
            }
        }
    }

    pub fn displayed_status(&self, attachment_id: AttachmentId) -> Option<ProcessingStatus> {
        self.overlay.get(attachment_id).or_else(|| {
            self.persisted.items().and_then(|items| {
                items
                    .iter()
                    .find(|attachment| attachment.id == attachment_id)
                    .map(|attachment| attachment.status)
            })
        })
    }

    /// Persisted rows with overlay statuses applied; `None` until the first fetch lands.
    pub fn view(&self) -> Option<Vec<Attachment>> {
        self.persisted
            .items()
            .map(|persisted| reconcile(persisted, &self.overlay))
    }

    pub fn overlay(&self) -> &StatusOverlay {
        &self.overlay
    }

    pub fn is_loading(&self) -> bool {
        self.persisted.is_loading()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.persisted.last_error()
    }
}
