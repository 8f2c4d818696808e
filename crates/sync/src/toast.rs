use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use tokio::task::AbortHandle;

pub const DEFAULT_TOAST_DURATION: Duration = Duration::from_millis(3_000);

/// Toast identifier minted from the wall clock in milliseconds.
///
/// Ids never repeat: a call landing in the same millisecond as the previous one
/// takes the next free value instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ToastId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Severity {
    Success,
    Error,
    #[default]
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub id: ToastId,
    pub message: String,
    pub severity: Severity,
}

/// A user-facing notice requested by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub message: String,
    pub severity: Severity,
}

impl Notice {
    pub fn new(message: impl Into<String>, severity: Severity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(message, Severity::Success)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(message, Severity::Error)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(message, Severity::Info)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(message, Severity::Warning)
    }
}

struct QueueState {
    toasts: ArcSwap<Vec<Toast>>,
    last_id: AtomicU64,
    timers: Mutex<HashMap<ToastId, AbortHandle>>,
    default_duration: Duration,
}

impl QueueState {
    fn remove(&self, id: ToastId) -> bool {
        let mut removed = false;
        self.toasts.rcu(|toasts| {
            removed = toasts.iter().any(|toast| toast.id == id);
            toasts
                .iter()
                .filter(|toast| toast.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
        lock_timers(&self.timers).remove(&id);
        removed
    }
}

impl Drop for QueueState {
    fn drop(&mut self) {
        for (_, timer) in lock_timers(&self.timers).drain() {
            timer.abort();
        }
    }
}

/// Time-expiring list of toasts.
///
/// Clones share one queue. Every toast schedules a one-shot tokio timer, so showing a
/// toast must happen inside a tokio runtime.
#[derive(Clone)]
pub struct ToastQueue {
    state: Arc<QueueState>,
}

impl Default for ToastQueue {
    fn default() -> Self {
        Self::new(DEFAULT_TOAST_DURATION)
    }
}

impl ToastQueue {
    pub fn new(default_duration: Duration) -> Self {
        Self {
            state: Arc::new(QueueState {
                toasts: ArcSwap::from_pointee(Vec::new()),
                last_id: AtomicU64::new(0),
                timers: Mutex::new(HashMap::new()),
                default_duration,
            }),
        }
    }

    pub fn default_duration(&self) -> Duration {
        self.state.default_duration
    }

    pub fn show(&self, message: impl Into<String>, severity: Severity) -> ToastId {
        self.show_for(message, severity, self.state.default_duration)
    }

    pub fn show_for(
        &self,
        message: impl Into<String>,
        severity: Severity,
        duration: Duration,
    ) -> ToastId {
        let toast = Toast {
            id: self.mint_id(),
            message: message.into(),
            severity,
        };
        let id = toast.id;

        self.state.toasts.rcu(|toasts| {
            let mut next = Vec::clone(toasts);
            next.push(toast.clone());
            next
        });

        // Held while spawning so the timer cannot expire before its handle is recorded.
        let mut timers = lock_timers(&self.state.timers);
        let weak_state = Arc::downgrade(&self.state);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(state) = weak_state.upgrade() {
                state.remove(id);
            }
        });
        timers.insert(id, timer.abort_handle());

        tracing::trace!(toast_id = id.0, ?severity, ?duration, "toast shown");
        id
    }

    pub fn notify(&self, notice: Notice, duration: Duration) -> ToastId {
        self.show_for(notice.message, notice.severity, duration)
    }

    pub fn success(&self, message: impl Into<String>) -> ToastId {
        self.show(message, Severity::Success)
    }

    pub fn error(&self, message: impl Into<String>) -> ToastId {
        self.show(message, Severity::Error)
    }

    pub fn info(&self, message: impl Into<String>) -> ToastId {
        self.show(message, Severity::Info)
    }

    pub fn warning(&self, message: impl Into<String>) -> ToastId {
        self.show(message, Severity::Warning)
    }

    /// Removes one toast early. Unknown or already expired ids are a no-op.
    pub fn dismiss(&self, id: ToastId) -> bool {
        if let Some(timer) = lock_timers(&self.state.timers).remove(&id) {
            timer.abort();
        }
        self.state.remove(id)
    }

    pub fn clear(&self) {
        for (_, timer) in lock_timers(&self.state.timers).drain() {
            timer.abort();
        }
        self.state.toasts.store(Arc::new(Vec::new()));
    }

    /// Current toasts in creation order.
    pub fn snapshot(&self) -> Arc<Vec<Toast>> {
        self.state.toasts.load_full()
    }

    pub fn contains(&self, id: ToastId) -> bool {
        self.state.toasts.load().iter().any(|toast| toast.id == id)
    }

    pub fn len(&self) -> usize {
        self.state.toasts.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mint_id(&self) -> ToastId {
        let now = current_unix_millis();
        let previous = match self.state.last_id.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |last| Some(now.max(last.saturating_add(1))),
        ) {
            Ok(previous) | Err(previous) => previous,
        };
        ToastId(now.max(previous.saturating_add(1)))
    }
}

impl std::fmt::Debug for ToastQueue {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ToastQueue")
            .field("toasts", &self.snapshot())
            .field("default_duration", &self.state.default_duration)
            .finish()
    }
}

fn lock_timers(
    timers: &Mutex<HashMap<ToastId, AbortHandle>>,
) -> MutexGuard<'_, HashMap<ToastId, AbortHandle>> {
    timers.lock().unwrap_or_else(PoisonError::into_inner)
}

fn current_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}
