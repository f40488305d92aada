//! `task/execute` event bus — the Admission Layer and follow-up endpoint
//! push task ids here; the worker pool drains them and drives the
//! Executor. At-most-one in-flight execution per task id, `retries: 0`
//! (spec.md §4.2): a failed Executor run reports a terminal `error`
//! status rather than being silently requeued.
//!
//! Grounded in `factory::server::start_server`'s `broadcast::channel` for
//! WS fanout, adapted from broadcast (many-subscriber) to mpsc
//! (single-consumer work queue) since this is a queue of work items, not
//! a notification stream; the in-flight dedup set reuses the same
//! `dashmap` dependency as the Sandbox Registry.

use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::task::TaskId;

#[derive(Debug, Clone)]
pub struct ExecuteEvent {
    pub task_id: TaskId,
}

#[derive(Clone)]
pub struct EventBus {
    sender: mpsc::UnboundedSender<ExecuteEvent>,
    in_flight: Arc<DashSet<TaskId>>,
}

/// `recv` takes `&self` (the receiver half is wrapped in an async mutex)
/// so the worker pool can hold one `Arc<EventReceiver>` shared between the
/// poll loop and the per-task completion callback that calls `mark_done`.
pub struct EventReceiver {
    receiver: AsyncMutex<mpsc::UnboundedReceiver<ExecuteEvent>>,
    in_flight: Arc<DashSet<TaskId>>,
}

impl EventBus {
    pub fn new() -> (Self, EventReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let in_flight = Arc::new(DashSet::new());
        (
            Self { sender, in_flight: in_flight.clone() },
            EventReceiver { receiver: AsyncMutex::new(receiver), in_flight },
        )
    }

    /// Emit a `task/execute` event. Returns `false` without enqueueing if
    /// this task id is already in flight — the dedup discipline that
    /// keeps two concurrent Executor runs from racing on one task's
    /// branch and log transcript.
    pub fn emit(&self, task_id: TaskId) -> bool {
        if !self.in_flight.insert(task_id.clone()) {
            return false;
        }
        // insert already failed to enqueue on error below leaves a leaked
        // in_flight entry only if the receiver is gone, which only happens
        // at process shutdown.
        self.sender.send(ExecuteEvent { task_id }).is_ok()
    }

    pub fn is_in_flight(&self, task_id: &TaskId) -> bool {
        self.in_flight.contains(task_id)
    }
}

impl EventReceiver {
    pub async fn recv(&self) -> Option<ExecuteEvent> {
        self.receiver.lock().await.recv().await
    }

    /// Called by the worker once an Executor run for this task reaches a
    /// terminal status, freeing it to be re-emitted by a later follow-up.
    pub fn mark_done(&self, task_id: &TaskId) {
        self.in_flight.remove(task_id);
    }
}
