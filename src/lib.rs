pub mod commands;
pub mod config;
pub mod fetch;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod runner;
pub mod task;
pub mod worker;

use clap::ValueEnum;

pub use pool::{Pool, PoolError, PoolEvent, PoolStats};
pub use task::{FailureReason, Task, TaskFailure, TaskHandle};

/// Task handlers a worker process can serve
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum HandlerKind {
    /// Download media with the external fetch tool (default)
    Fetch,
    /// Diagnostic handler whose payload scripts success, failure, crashes and hangs
    Probe,
}
