use notebook_backend::{ChatEntry, ChatEntryId, ChatRole, CommandResult, NotebookId};

use crate::Effect;
use crate::reconcile::{OverlayPolicy, reconcile};
use crate::resource::{LoadOutcome, LoadTicket, Loadable};
use crate::toast::Notice;

pub const DEFAULT_GREETING: &str = "Hello! I've indexed your files.";

/// Identifies one chat round-trip so a late settlement cannot close a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeTicket(u64);

impl ExchangeTicket {
    pub fn sequence(&self) -> u64 {
        self.0
    }
}

/// Gate for the single outstanding chat request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeState {
    #[default]
    Idle,
    Submitting(ExchangeTicket),
}

impl ExchangeState {
    pub fn is_thinking(&self) -> bool {
        matches!(self, Self::Submitting(_))
    }

    pub fn active_ticket(&self) -> Option<ExchangeTicket> {
        match self {
            Self::Submitting(ticket) => Some(*ticket),
            Self::Idle => None,
        }
    }
}

/// Why a submit was refused. Refusals have no side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitRejection {
    Blank,
    Thinking,
}

/// A user turn shown before the backend has persisted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticTurn {
    pub role: ChatRole,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOrigin {
    Persisted(ChatEntryId),
    Optimistic,
    Greeting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptLine {
    pub origin: LineOrigin,
    pub role: ChatRole,
    pub message: String,
    pub timestamp: Option<i64>,
}

impl TranscriptLine {
    fn persisted(entry: &ChatEntry) -> Self {
        Self {
            origin: LineOrigin::Persisted(entry.id),
            role: entry.role,
            message: entry.message.clone(),
            timestamp: Some(entry.timestamp),
        }
    }

    fn greeting(message: &str) -> Self {
        Self {
            origin: LineOrigin::Greeting,
            role: ChatRole::Assistant,
            message: message.to_string(),
            timestamp: None,
        }
    }
}

/// Rendered transcript: persisted lines, then optimistic ones, or the greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptView {
    pub lines: Vec<TranscriptLine>,
    pub thinking: bool,
    pub error: Option<String>,
    pub loaded: bool,
    pub loading: bool,
}

struct PendingTurns<'a>(&'a [OptimisticTurn]);

impl OverlayPolicy<TranscriptLine> for PendingTurns<'_> {
    fn trailing(&self) -> Vec<TranscriptLine> {
        self.0
            .iter()
            .map(|turn| TranscriptLine {
                origin: LineOrigin::Optimistic,
                role: turn.role,
                message: turn.message.clone(),
                timestamp: None,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ChatEngine {
    notebook_id: NotebookId,
    persisted: Loadable<ChatEntry>,
    optimistic: Vec<OptimisticTurn>,
    exchange: ExchangeState,
    next_exchange: u64,
}

impl ChatEngine {
    pub fn new(notebook_id: NotebookId) -> Self {
        Self {
            notebook_id,
            persisted: Loadable::new(),
            optimistic: Vec::new(),
            exchange: ExchangeState::Idle,
            next_exchange: 0,
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
        result: CommandResult<Vec<ChatEntry>>,
    ) -> LoadOutcome {
        let outcome = self.persisted.accept(ticket, result);
        match outcome {
            LoadOutcome::Replaced => {
                if let Some(entries) = self.persisted.items_mut() {
                    // Stable: equal timestamps keep the backend's order.
                    entries.sort_by_key(|entry| entry.timestamp);
                    tracing::debug!(
                        notebook_id = %self.notebook_id,
                        entry_count = entries.len(),
                        "chat history replaced"
                    );
                }
            }
            LoadOutcome::Failed => {
                tracing::warn!(
                    notebook_id = %self.notebook_id,
                    error = self.persisted.last_error().unwrap_or_default(),
                    "chat history fetch failed"
                );
            }
            LoadOutcome::Stale => {
                tracing::debug!(
                    notebook_id = %self.notebook_id,
                    ticket = ticket.sequence(),
                    "discarded stale chat history fetch"
                );
            }
        }
        outcome
    }

    /// Records the optimistic turn and closes the gate until [`ChatEngine::settle`].
    pub fn begin_submit(&mut self, text: &str) -> Result<ExchangeTicket, SubmitRejection> {
        if text.trim().is_empty() {
            return Err(SubmitRejection::Blank);
        }
        if self.exchange.is_thinking() {
            return Err(SubmitRejection::Thinking);
        }

        self.next_exchange += 1;
        let ticket = ExchangeTicket(self.next_exchange);
        self.optimistic.push(OptimisticTurn {
            role: ChatRole::User,
            message: text.to_string(),
        });
        self.exchange = ExchangeState::Submitting(ticket);
        Ok(ticket)
    }

    /// Closes the exchange. The optimistic turn is dropped either way.
    pub fn settle(
        &mut self,
        ticket: ExchangeTicket,
        result: CommandResult<ChatEntry>,
    ) -> Vec<Effect> {
        if self.exchange.active_ticket() != Some(ticket) {
            tracing::debug!(
                notebook_id = %self.notebook_id,
                exchange = ticket.sequence(),
                "ignored settlement for inactive exchange"
            );
            return Vec::new();
        }

        self.exchange = ExchangeState::Idle;
        self.optimistic.clear();
        match result {
            Ok(reply) => {
                tracing::debug!(
                    notebook_id = %self.notebook_id,
                    reply_id = %reply.id,
                    "chat exchange settled"
                );
                vec![Effect::Reload]
            }
            Err(error) => {
                tracing::warn!(
                    notebook_id = %self.notebook_id,
                    error = %error,
                    "chat exchange failed"
                );
                vec![Effect::Notify(Notice::error(error.reason()))]
            }
        }
    }

    pub fn is_thinking(&self) -> bool {
        self.exchange.is_thinking()
    }

    pub fn exchange(&self) -> ExchangeState {
        self.exchange
    }

    pub fn optimistic(&self) -> &[OptimisticTurn] {
        &self.optimistic
    }

    pub fn is_loading(&self) -> bool {
        self.persisted.is_loading()
    }

    pub fn transcript(&self, greeting: &str) -> TranscriptView {
        let persisted = self
            .persisted
            .items()
            .unwrap_or_default()
            .iter()
            .map(TranscriptLine::persisted)
            .collect::<Vec<_>>();
        let mut lines = reconcile(&persisted, &PendingTurns(&self.optimistic));
        if lines.is_empty() {
            lines.push(TranscriptLine::greeting(greeting));
        }

        TranscriptView {
            lines,
            thinking: self.exchange.is_thinking(),
            error: self.persisted.last_error().map(str::to_string),
            loaded: self.persisted.is_loaded(),
            loading: self.persisted.is_loading(),
        }
    }
}
