use crate::run::{RunSnapshot, RunStatus};
use crate::task::TaskRecord;
use crate::worker::WorkerStatus;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Events published by the kernel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum KernelEvent {
    /// A full snapshot of one run.
    Snapshot {
        /// Worktree the run belongs to.
        worktree_id: String,
        /// The snapshot payload.
        snapshot: RunSnapshot,
    },
    /// The run's lifecycle status changed.
    RunStatus {
        /// Worktree the run belongs to.
        worktree_id: String,
        /// Run identifier.
        run_id: String,
        /// New status.
        status: RunStatus,
    },
    /// The task list was reloaded.
    TasksUpdated {
        /// Worktree the run belongs to.
        worktree_id: String,
        /// Full task list.
        tasks: Vec<TaskRecord>,
    },
    /// One or more worker statuses changed.
    WorkersUpdated {
        /// Worktree the workers belong to.
        worktree_id: String,
        /// The changed statuses.
        workers: Vec<WorkerStatus>,
    },
    /// Normalised executor output from one worker.
    WorkerLog {
        /// Worktree the worker belongs to.
        worktree_id: String,
        /// Worker id.
        worker_id: String,
        /// Normalised chunk, newline-terminated lines.
        chunk: String,
    },
    /// A comment was appended to a task conversation.
    ConversationAppended {
        /// Worktree the run belongs to.
        worktree_id: String,
        /// Task the comment belongs to.
        task_id: String,
        /// Comment author.
        author: String,
        /// Comment body.
        message: String,
    },
}

type Listener = Arc<dyn Fn(&KernelEvent) + Send + Sync>;

struct BusInner {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

/// Single-process publish/subscribe channel for [`KernelEvent`]s.
///
/// Delivery is synchronous, best-effort, and in publication order with
/// respect to a single publisher; listeners must not block. The bus is not
/// persistent.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Deliver `event` to every current subscriber.
    pub fn publish(&self, event: &KernelEvent) {
        let listeners: Vec<Listener> = {
            let guard = self.inner.listeners.lock();
            guard.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in listeners {
            listener(event);
        }
    }

    /// Register a listener; the returned handle unsubscribes on drop or via
    /// [`Subscription::unsubscribe`].
    pub fn subscribe(&self, listener: impl Fn(&KernelEvent) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`EventBus::subscribe`].
pub struct Subscription {
    id: u64,
    inner: std::sync::Weak<BusInner>,
}

impl Subscription {
    /// Remove the listener now instead of at drop time.
    pub fn unsubscribe(self) {
        drop(self);
    }

    fn remove(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}
