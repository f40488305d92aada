//! Sandbox Registry — process-wide `taskId → SandboxHandle` mapping
//! (spec.md §4.5). Not persisted; loss on restart is acceptable because
//! the orphan sweep reconciles provider-side state against tasks still
//! `processing` past their `maxDuration`.
//!
//! `dashmap::DashMap` is the same dependency `forge-runtime`'s Cargo.toml
//! pulls in for its own process-wide concurrent registry — there was no
//! source for that daemon in the retrieval pack, but the manifest entry
//! is itself the grounding for reaching for `dashmap` here rather than a
//! hand-rolled `Mutex<HashMap<_>>`.

use dashmap::DashMap;

use super::SandboxHandle;
use crate::task::TaskId;

#[derive(Default)]
pub struct SandboxRegistry {
    handles: DashMap<TaskId, SandboxHandle>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self { handles: DashMap::new() }
    }

    pub fn register(&self, handle: SandboxHandle) {
        self.handles.insert(handle.task_id.clone(), handle);
    }

    pub fn unregister(&self, task_id: &TaskId) -> Option<SandboxHandle> {
        self.handles.remove(task_id).map(|(_, v)| v)
    }

    pub fn get(&self, task_id: &TaskId) -> Option<SandboxHandle> {
        self.handles.get(task_id).map(|entry| entry.value().clone())
    }

    /// Handles older than `max_age` — the sweep candidate set. A handle
    /// surviving past its provider's `max_duration` is either a genuinely
    /// long-running task the caller should re-check against the Task
    /// Store's `processing` status, or an orphan the provider itself lost
    /// track of.
    pub fn stale(&self, max_age: chrono::Duration) -> Vec<SandboxHandle> {
        let cutoff = chrono::Utc::now() - max_age;
        self.handles
            .iter()
            .filter(|entry| entry.value().created_at < cutoff)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
