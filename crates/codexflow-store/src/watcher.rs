use crate::task_store::TaskStore;
use codexflow_core::{CodexflowError, CodexflowResult, TaskRecord};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Quiet window an event burst must survive before a reload.
const STABILISE: Duration = Duration::from_millis(150);
/// Minimum interval between two successive snapshot emissions.
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Watches a run's `tasks/` tree and re-emits the full task list on change.
///
/// A fresh snapshot is emitted as soon as the watch is established; after
/// that, bursts of filesystem events are stabilised and debounced before the
/// store is re-scanned. Dropping the watcher stops the background thread.
pub struct TaskWatcher {
    // Dropping the watcher closes the event channel, which ends the thread;
    // the detached thread handle is kept only for debugging.
    _watcher: RecommendedWatcher,
    _thread: std::thread::JoinHandle<()>,
}

impl TaskWatcher {
    /// Start watching the store's tasks root.
    pub fn start<F>(store: TaskStore, on_change: F) -> CodexflowResult<Self>
    where
        F: Fn(Vec<TaskRecord>) + Send + Sync + 'static,
    {
        store.ensure_layout()?;
        let (tx, rx) = std_mpsc::channel();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        let _ = tx.send(());
                    }
                }
                Err(err) => warn!(error = %err, "task watcher event error"),
            })
            .map_err(|err| CodexflowError::Watch(format!("failed to create watcher: {err}")))?;

        let tasks_root = store.paths().tasks_root.clone();
        watcher
            .watch(&tasks_root, RecursiveMode::Recursive)
            .map_err(|err| {
                CodexflowError::Watch(format!("failed to watch {}: {err}", tasks_root.display()))
            })?;

        let thread = std::thread::spawn(move || {
            // Initial snapshot, before any event arrives.
            emit(&store, &on_change);
            let mut last_emit = Instant::now();

            while rx.recv().is_ok() {
                // Absorb the burst until it has been quiet for STABILISE.
                loop {
                    std::thread::sleep(STABILISE);
                    if rx.try_recv().is_err() {
                        break;
                    }
                    while rx.try_recv().is_ok() {}
                }

                let since = last_emit.elapsed();
                if since < DEBOUNCE {
                    std::thread::sleep(DEBOUNCE - since);
                    while rx.try_recv().is_ok() {}
                }
                last_emit = Instant::now();

                emit(&store, &on_change);
            }
            debug!("task watcher thread exiting");
        });

        Ok(Self {
            _watcher: watcher,
            _thread: thread,
        })
    }
}

fn emit<F>(store: &TaskStore, on_change: &F)
where
    F: Fn(Vec<TaskRecord>),
{
    match store.load_tasks() {
        Ok(tasks) => on_change(tasks),
        Err(err) => warn!(error = %err, "task reload failed; skipping emission"),
    }
}
