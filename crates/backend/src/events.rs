use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use snafu::ensure;
use tokio::sync::mpsc;

use super::error::{CommandResult, UnavailableSnafu};
use super::ids::AttachmentId;

/// Push-event names emitted by background ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingEventKind {
    ProcessingStart,
    ProcessingSuccess,
    ProcessingError,
}

impl ProcessingEventKind {
    pub const ALL: [Self; 3] = [
        Self::ProcessingStart,
        Self::ProcessingSuccess,
        Self::ProcessingError,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ProcessingStart => "processing-start",
            Self::ProcessingSuccess => "processing-success",
            Self::ProcessingError => "processing-error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingFailure {
    pub id: AttachmentId,
    pub reason: String,
}

/// One push event; the serialized form is `{"event": <name>, "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ProcessingEvent {
    ProcessingStart(AttachmentId),
    ProcessingSuccess(AttachmentId),
    ProcessingError(ProcessingFailure),
}

impl ProcessingEvent {
    pub fn kind(&self) -> ProcessingEventKind {
        match self {
            Self::ProcessingStart(_) => ProcessingEventKind::ProcessingStart,
            Self::ProcessingSuccess(_) => ProcessingEventKind::ProcessingSuccess,
            Self::ProcessingError(_) => ProcessingEventKind::ProcessingError,
        }
    }

    pub fn attachment_id(&self) -> AttachmentId {
        match self {
            Self::ProcessingStart(id) | Self::ProcessingSuccess(id) => *id,
            Self::ProcessingError(failure) => failure.id,
        }
    }
}

type Release = Box<dyn FnOnce() + Send + 'static>;

/// Registration handle for one event kind.
///
/// Dropping the handle unregisters the listener, so every registration path has a
/// matching deregistration even when the owner bails out early.
pub struct EventSubscription {
    kind: ProcessingEventKind,
    events: mpsc::UnboundedReceiver<ProcessingEvent>,
    release: Option<Release>,
}

impl EventSubscription {
    pub fn new(
        kind: ProcessingEventKind,
        events: mpsc::UnboundedReceiver<ProcessingEvent>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            kind,
            events,
            release: Some(Box::new(release)),
        }
    }

    pub fn kind(&self) -> ProcessingEventKind {
        self.kind
    }

    pub async fn recv(&mut self) -> Option<ProcessingEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProcessingEvent> {
        self.events.try_recv().ok()
    }

    pub fn unsubscribe(mut self) {
        self.release_listener();
    }

    fn release_listener(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
        self.events.close();
    }
}

impl Stream for EventSubscription {
    type Item = ProcessingEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.release_listener();
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("EventSubscription")
            .field("kind", &self.kind)
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// Source of ingestion push events.
pub trait ProcessingEvents: Send + Sync {
    fn subscribe(&self, kind: ProcessingEventKind) -> CommandResult<EventSubscription>;
}

struct Listener {
    kind: ProcessingEventKind,
    sender: mpsc::UnboundedSender<ProcessingEvent>,
}

#[derive(Default)]
struct BusState {
    next_listener_id: u64,
    listeners: HashMap<u64, Listener>,
    refused_kinds: HashSet<ProcessingEventKind>,
}

/// In-process event channel with per-kind listeners.
#[derive(Clone, Default)]
pub struct LocalEventBus {
    state: Arc<Mutex<BusState>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `event` to every listener of its kind and returns the delivery count.
    pub fn emit(&self, event: ProcessingEvent) -> usize {
        let kind = event.kind();
        let mut state = lock_state(&self.state);
        let mut delivered = 0;
        state.listeners.retain(|_, listener| {
            if listener.kind != kind {
                return true;
            }
            match listener.sender.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });

        tracing::trace!(event = kind.name(), delivered, "emitted processing event");
        delivered
    }

    pub fn listener_count(&self) -> usize {
        lock_state(&self.state).listeners.len()
    }

    /// Makes future subscriptions for `kind` fail until re-enabled.
    pub fn set_refused(&self, kind: ProcessingEventKind, refused: bool) {
        let mut state = lock_state(&self.state);
        if refused {
            state.refused_kinds.insert(kind);
        } else {
            state.refused_kinds.remove(&kind);
        }
    }
}

impl ProcessingEvents for LocalEventBus {
    fn subscribe(&self, kind: ProcessingEventKind) -> CommandResult<EventSubscription> {
        let mut state = lock_state(&self.state);
        ensure!(
            !state.refused_kinds.contains(&kind),
            UnavailableSnafu {
                stage: "event-bus-subscribe",
                reason: format!("event channel refused listener for {}", kind.name()),
            }
        );

        let listener_id = state.next_listener_id;
        state.next_listener_id = state.next_listener_id.saturating_add(1);

        let (sender, receiver) = mpsc::unbounded_channel();
        state.listeners.insert(listener_id, Listener { kind, sender });

        let weak_state: Weak<Mutex<BusState>> = Arc::downgrade(&self.state);
        Ok(EventSubscription::new(kind, receiver, move || {
            if let Some(state) = weak_state.upgrade() {
                lock_state(&state).listeners.remove(&listener_id);
            }
        }))
    }
}

fn lock_state(state: &Mutex<BusState>) -> MutexGuard<'_, BusState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_wire_names() {
        let id = AttachmentId::new_v4();
        let event = ProcessingEvent::ProcessingError(ProcessingFailure {
            id,
            reason: "corrupt file".to_string(),
        });

        let value = serde_json::to_value(&event).expect("event serializes");
        assert_eq!(value["event"], "processing-error");
        assert_eq!(value["payload"]["reason"], "corrupt file");
        assert_eq!(value["payload"]["id"], id.to_string());

        let start = serde_json::to_value(ProcessingEvent::ProcessingStart(id)).expect("start");
        assert_eq!(start["event"], "processing-start");
        assert_eq!(start["payload"], id.to_string());
    }

    #[test]
    fn emit_reaches_only_listeners_of_matching_kind() {
        let bus = LocalEventBus::new();
        let mut start = bus
            .subscribe(ProcessingEventKind::ProcessingStart)
            .expect("subscribe start");
        let mut success = bus
            .subscribe(ProcessingEventKind::ProcessingSuccess)
            .expect("subscribe success");

        let id = AttachmentId::new_v4();
        assert_eq!(bus.emit(ProcessingEvent::ProcessingStart(id)), 1);

        assert_eq!(start.try_recv(), Some(ProcessingEvent::ProcessingStart(id)));
        assert_eq!(success.try_recv(), None);
    }

    #[test]
    fn dropping_subscription_unregisters_listener() {
        let bus = LocalEventBus::new();
        let first = bus
            .subscribe(ProcessingEventKind::ProcessingStart)
            .expect("subscribe");
        let second = bus
            .subscribe(ProcessingEventKind::ProcessingError)
            .expect("subscribe");
        assert_eq!(bus.listener_count(), 2);

        drop(first);
        assert_eq!(bus.listener_count(), 1);

        second.unsubscribe();
        assert_eq!(bus.listener_count(), 0);
        assert_eq!(
            bus.emit(ProcessingEvent::ProcessingStart(AttachmentId::new_v4())),
            0
        );
    }

    #[test]
    fn refused_kind_fails_subscription() {
        let bus = LocalEventBus::new();
        bus.set_refused(ProcessingEventKind::ProcessingError, true);

        let error = bus
            .subscribe(ProcessingEventKind::ProcessingError)
            .expect_err("refused kind must fail");
        assert!(!error.is_cancelled());
        assert_eq!(bus.listener_count(), 0);

        bus.set_refused(ProcessingEventKind::ProcessingError, false);
        assert!(bus.subscribe(ProcessingEventKind::ProcessingError).is_ok());
    }
}
