use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::protocol::WorkerError;

/// One unit of work submitted to the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Correlation id chosen by the caller
    pub id: String,
    /// Forwarded verbatim to the worker process
    pub payload: Value,
}

impl Task {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// Why a task did not produce a result
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FailureReason {
    /// The worker reported `failed`
    #[error("{0}")]
    Failed(WorkerError),
    /// The worker process died while holding the task
    #[error("worker {worker_id} exited unexpectedly (status: {})", describe_status(code))]
    WorkerCrashed { worker_id: usize, code: Option<i32> },
    /// Another task with the same id is still pending
    #[error("a task with this id is already pending")]
    DuplicateId,
    #[error("pool terminated")]
    Terminated,
}

fn describe_status(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "killed by signal".to_string(),
    }
}

/// Failure outcome of a task, paired with the payload it was submitted with
#[derive(Debug, Clone, PartialEq, Error)]
#[error("task {task_id} failed: {reason}")]
pub struct TaskFailure {
    pub task_id: String,
    pub payload: Value,
    #[source]
    pub reason: FailureReason,
}

impl TaskFailure {
    pub fn is_terminated(&self) -> bool {
        self.reason == FailureReason::Terminated
    }
}

pub type TaskOutcome = Result<Value, TaskFailure>;

/// Settles once the pool has observed the task's terminal outcome
#[derive(Debug)]
pub struct TaskHandle {
    task_id: String,
    /// Shared with the registry entry
    payload: Arc<Value>,
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub(crate) fn new(
        task_id: &str,
        payload: Arc<Value>,
        rx: oneshot::Receiver<TaskOutcome>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            payload,
            rx,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Wait for the outcome
    pub async fn wait(self) -> TaskOutcome {
        self.await
    }
}

impl Future for TaskHandle {
    type Output = TaskOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // The dispatcher is gone, so nothing can settle this task any more
            Poll::Ready(Err(_)) => Poll::Ready(Err(TaskFailure {
                task_id: self.task_id.clone(),
                payload: Value::clone(&self.payload),
                reason: FailureReason::Terminated,
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}
