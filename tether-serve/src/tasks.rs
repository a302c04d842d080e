//! In-memory task table for the task-control methods.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted, not yet running.
    Queued,
    /// Template executing.
    Running,
    /// Finished with a result.
    Done,
    /// Finished with an error.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

/// A tracked tool-call task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    /// Task id (`task-N`).
    pub id: String,
    /// Wire tool name that started it.
    pub tool: String,
    /// Current status.
    pub status: TaskStatus,
    /// Result value, once `Done`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error text, once `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct TaskEntry {
    snapshot: TaskSnapshot,
    cancel: CancellationToken,
}

/// Tracks every tool call accepted by the server. Results are retained
/// until the server shuts down so `tasks/result` can replay them.
#[derive(Default)]
pub struct TaskTable {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<String, TaskEntry>>,
}

impl TaskTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new task for `tool`; returns its id and cancel token.
    pub fn create(&self, tool: &str) -> (String, CancellationToken) {
        let id = format!("task-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let cancel = CancellationToken::new();
        let entry = TaskEntry {
            snapshot: TaskSnapshot {
                id: id.clone(),
                tool: tool.to_string(),
                status: TaskStatus::Queued,
                result: None,
                error: None,
            },
            cancel: cancel.clone(),
        };
        self.tasks.lock().expect("task lock poisoned").insert(id.clone(), entry);
        (id, cancel)
    }

    /// Mark a task running.
    pub fn mark_running(&self, id: &str) {
        self.update(id, |task| task.status = TaskStatus::Running);
    }

    /// Record a successful result.
    pub fn mark_done(&self, id: &str, result: Value) {
        self.update(id, |task| {
            task.status = TaskStatus::Done;
            task.result = Some(result);
        });
    }

    /// Record a failure.
    pub fn mark_failed(&self, id: &str, error: String) {
        self.update(id, |task| {
            task.status = TaskStatus::Failed;
            task.error = Some(error);
        });
    }

    /// Cancel a task: trips its token and marks it cancelled unless it
    /// already finished. Returns false for unknown ids.
    pub fn cancel(&self, id: &str) -> bool {
        let mut tasks = self.tasks.lock().expect("task lock poisoned");
        let Some(entry) = tasks.get_mut(id) else { return false };
        entry.cancel.cancel();
        if matches!(entry.snapshot.status, TaskStatus::Queued | TaskStatus::Running) {
            entry.snapshot.status = TaskStatus::Cancelled;
        }
        true
    }

    /// Snapshot one task.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<TaskSnapshot> {
        self.tasks.lock().expect("task lock poisoned").get(id).map(|e| e.snapshot.clone())
    }

    /// Snapshot every task, newest last by id.
    #[must_use]
    pub fn list(&self) -> Vec<TaskSnapshot> {
        let mut all: Vec<TaskSnapshot> = self
            .tasks
            .lock()
            .expect("task lock poisoned")
            .values()
            .map(|e| e.snapshot.clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    fn update(&self, id: &str, apply: impl FnOnce(&mut TaskSnapshot)) {
        if let Some(entry) = self.tasks.lock().expect("task lock poisoned").get_mut(id) {
            // A cancelled task stays cancelled; late completions are
            // recorded only as results.
            if entry.snapshot.status == TaskStatus::Cancelled {
                return;
            }
            apply(&mut entry.snapshot);
        }
    }
}
