use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::task::{FailureReason, Task, TaskFailure, TaskOutcome};

/// FIFO backlog of tasks waiting for an idle worker
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: VecDeque<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, task: Task) {
        self.tasks.push_back(task);
    }

    /// Put a task back at the head, e.g. when its worker died before receiving it
    pub fn push_front(&mut self, task: Task) {
        self.tasks.push_front(task);
    }

    pub fn pop_front(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Task> + '_ {
        self.tasks.drain(..)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Caller-side resolver plus the payload kept for failure reports
#[derive(Debug)]
pub struct PendingTask {
    /// Shared with the caller's handle; copied out only on failure
    pub payload: Arc<Value>,
    resolver: oneshot::Sender<TaskOutcome>,
}

impl PendingTask {
    pub fn new(payload: Arc<Value>, resolver: oneshot::Sender<TaskOutcome>) -> Self {
        Self { payload, resolver }
    }

    fn settle(self, task_id: &str, outcome: Result<Value, FailureReason>) {
        let payload = self.payload;
        let outcome = outcome.map_err(|reason| TaskFailure {
            task_id: task_id.to_string(),
            payload: Arc::try_unwrap(payload).unwrap_or_else(|shared| Value::clone(&shared)),
            reason,
        });
        // The caller may have dropped its handle
        if self.resolver.send(outcome).is_err() {
            debug!("Handle for task {} was dropped before it settled", task_id);
        }
    }

    /// Settle a task that never made it into the registry
    pub fn reject(self, task_id: &str, reason: FailureReason) {
        self.settle(task_id, Err(reason));
    }
}

/// Pending caller handles keyed by task id
///
/// An entry exists exactly while its task is submitted and unsettled.
#[derive(Debug, Default)]
pub struct CompletionRegistry {
    pending: HashMap<String, PendingTask>,
}

impl CompletionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. Hands the entry back if the id is already pending.
    pub fn insert(&mut self, task_id: &str, pending: PendingTask) -> Result<(), PendingTask> {
        if self.pending.contains_key(task_id) {
            return Err(pending);
        }
        self.pending.insert(task_id.to_string(), pending);
        Ok(())
    }

    /// Settle and remove an entry. Returns false if no entry existed.
    pub fn resolve(&mut self, task_id: &str, outcome: Result<Value, FailureReason>) -> bool {
        match self.pending.remove(task_id) {
            Some(pending) => {
                pending.settle(task_id, outcome);
                true
            }
            None => false,
        }
    }

    /// Fail every remaining entry
    pub fn fail_all(&mut self, reason: FailureReason) -> usize {
        let count = self.pending.len();
        for (task_id, pending) in self.pending.drain() {
            pending.settle(&task_id, Err(reason.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
