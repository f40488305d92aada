//! `DbHandle` — a cheap-to-clone async wrapper around a synchronous
//! `TaskDb`, so callers never block the Tokio reactor on a SQLite write.
//!
//! The teacher's `factory::db::DbHandle` is used throughout
//! `factory::agent_executor` and `factory::api` (`db.call(|db| ...)`,
//! `db.lock_sync()`) but its own definition was not present in the
//! retrieval pack — this reconstructs it from its call sites: `call`
//! runs a closure against the guarded `TaskDb` on a blocking thread
//! (SQLite calls are synchronous and can briefly block on disk I/O),
//! while `lock_sync` is for call sites already on a blocking thread
//! (e.g. inside another `spawn_blocking`) that need the guard directly.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;

use super::TaskDb;

#[derive(Clone)]
pub struct DbHandle(Arc<Mutex<TaskDb>>);

impl DbHandle {
    pub fn new(db: TaskDb) -> Self {
        Self(Arc::new(Mutex::new(db)))
    }

    /// Acquire the lock on the current thread. Panics if the lock is
    /// poisoned by a prior panicking holder — mirrors the teacher's
    /// `lock_sync()` which callers use only from already-blocking
    /// contexts where that panic propagation is acceptable.
    pub fn lock_sync(&self) -> MutexGuard<'_, TaskDb> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against the database on a blocking thread and await its
    /// result. This is the hot path used by the Executor and Admission
    /// Layer so a SQLite write never stalls other tasks' async work.
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&TaskDb) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.0);
        tokio::task::spawn_blocking(move || {
            let guard = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&guard)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_sync_returns_usable_guard() {
        let handle = DbHandle::new(TaskDb::new_in_memory().unwrap());
        let guard = handle.lock_sync();
        drop(guard);
    }

    #[tokio::test]
    async fn call_runs_closure_against_db() {
        let handle = DbHandle::new(TaskDb::new_in_memory().unwrap());
        let count = handle.call(|db| db.count_tasks_for_user("nobody")).await.unwrap();
        assert_eq!(count, 0);
    }
}
