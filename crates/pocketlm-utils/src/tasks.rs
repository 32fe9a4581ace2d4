//! Supervised background tasks keyed by a caller-chosen string.
//!
//! Work that must outlive the caller's call stack (a model download, a
//! conversation summary) is registered here instead of being detached with a
//! bare `tokio::spawn`. The registry enforces one live task per key, lets
//! observers ask whether a key is running, and delivers a control signal to
//! the task through a `watch` channel.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Unique identifier for one spawned task; keys are reused, ids are not.
pub type TaskId = u64;

struct TaskEntry<S> {
    id: TaskId,
    handle: JoinHandle<()>,
    control_tx: watch::Sender<S>,
}

/// Receiving side of a task's control signal.
///
/// Tasks poll [`TaskControl::current`] at their own suspension points; the
/// signal never interrupts them.
#[derive(Debug, Clone)]
pub struct TaskControl<S> {
    rx: watch::Receiver<S>,
}

impl<S: Clone> TaskControl<S> {
    /// The most recently sent signal.
    pub fn current(&self) -> S {
        self.rx.borrow().clone()
    }

    /// Wait until the signal changes. Returns `false` once the registry side
    /// has been dropped.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// Registry of live background tasks, cheap to clone and share.
///
/// `S` is the control signal type; it starts at `S::default()`.
pub struct TaskRegistry<S = bool> {
    name: &'static str,
    tasks: Arc<Mutex<HashMap<String, TaskEntry<S>>>>,
    next_id: Arc<AtomicU64>,
}

impl<S> Clone for TaskRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tasks: Arc::clone(&self.tasks),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<S> TaskRegistry<S> {
    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|entry| !entry.handle.is_finished())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, entry)| !entry.handle.is_finished())
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TaskEntry<S>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| {
            warn!(registry = self.name, "task registry lock poisoned; recovering");
            poisoned.into_inner()
        })
    }
}

impl<S> std::fmt::Debug for TaskRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("name", &self.name)
            .field("live", &self.len())
            .finish()
    }
}

impl<S> TaskRegistry<S>
where
    S: Clone + Default + Send + Sync + 'static,
{
    /// `name` only shows up in logs.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn `make(control)` under `key`.
    ///
    /// Returns `None` without spawning when a task for `key` is still running.
    /// The entry removes itself when the future completes.
    pub fn spawn<F, Fut>(&self, key: impl Into<String>, make: F) -> Option<TaskId>
    where
        F: FnOnce(TaskControl<S>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let mut tasks = self.lock();

        if let Some(existing) = tasks.get(&key) {
            if !existing.handle.is_finished() {
                debug!(registry = self.name, key = %key, "task already running; spawn ignored");
                return None;
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (control_tx, control_rx) = watch::channel(S::default());
        let fut = make(TaskControl { rx: control_rx });

        let registry = self.clone();
        let finish_key = key.clone();
        // The lock is held until the entry is inserted, so `finish` cannot
        // run ahead of the insert even for futures that complete immediately.
        let handle = tokio::spawn(async move {
            fut.await;
            registry.finish(&finish_key, id);
        });

        tasks.insert(
            key.clone(),
            TaskEntry {
                id,
                handle,
                control_tx,
            },
        );
        debug!(registry = self.name, key = %key, task_id = id, "task spawned");
        Some(id)
    }

    /// Deliver `signal` to the task registered under `key`.
    pub fn signal(&self, key: &str, signal: S) -> bool {
        match self.lock().get(key) {
            Some(entry) => {
                entry.control_tx.send_replace(signal);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|entry| !entry.handle.is_finished())
    }

    /// Number of live tasks for `key` (0 or 1).
    pub fn count(&self, key: &str) -> usize {
        usize::from(self.is_running(key))
    }

    /// Hard-stop the task for `key` at its next await point.
    pub fn abort(&self, key: &str) -> bool {
        match self.lock().remove(key) {
            Some(entry) => {
                entry.handle.abort();
                debug!(registry = self.name, key = %key, task_id = entry.id, "task aborted");
                true
            }
            None => false,
        }
    }

    /// Abort every live task.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (key, entry) in drained {
            entry.handle.abort();
            debug!(registry = self.name, key = %key, "task aborted during shutdown");
        }
    }

    fn finish(&self, key: &str, id: TaskId) {
        let mut tasks = self.lock();
        // A newer task may already own the key after an abort + respawn.
        if tasks.get(key).is_some_and(|entry| entry.id == id) {
            tasks.remove(key);
        }
    }

}
