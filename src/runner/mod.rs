//! The worker-process side of the protocol.
//!
//! A worker reads task frames from stdin, runs them one at a time through a
//! [`TaskHandler`] and answers on stdout. It exits cleanly once stdin closes.

pub mod probe;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::protocol::{self, LogLevel, PoolMessage, WorkerError, WorkerMessage};

pub use probe::ProbeHandler;

/// The per-task work function run inside a worker process
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(
        &self,
        task_id: &str,
        payload: Value,
        reporter: &Reporter,
    ) -> Result<Value, WorkerError>;
}

/// Lets a handler stream progress and log messages for its current task.
///
/// Shares the ordered outbox with the terminal reply, so nothing a handler
/// reports can arrive after its task has settled.
#[derive(Debug, Clone)]
pub struct Reporter {
    task_id: String,
    outbox: mpsc::UnboundedSender<WorkerMessage>,
}

impl Reporter {
    pub(crate) fn new(task_id: &str, outbox: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self {
            task_id: task_id.to_string(),
            outbox,
        }
    }

    pub fn progress(&self, value: impl Into<Value>) {
        let _ = self.outbox.send(WorkerMessage::Progress {
            id: self.task_id.clone(),
            value: value.into(),
        });
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>, data: Value) {
        let _ = self.outbox.send(WorkerMessage::Log {
            level,
            message: message.into(),
            data,
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message, Value::Null);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message, Value::Null);
    }
}

/// Serve tasks over this process's stdin/stdout until stdin closes
pub async fn run_worker<H: TaskHandler>(handler: H) -> Result<()> {
    serve(&handler, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve tasks read from `input`, writing replies to `output`
pub async fn serve<H, R, W>(handler: &H, input: R, output: W) -> Result<()>
where
    H: TaskHandler + ?Sized,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let writer = tokio::spawn(async move {
        let mut writer = FramedWrite::new(output, protocol::codec());
        while let Some(message) = outbox_rx.recv().await {
            let frame = protocol::encode(&message)?;
            writer.send(frame).await?;
        }
        Ok::<_, anyhow::Error>(())
    });

    let mut reader = FramedRead::new(input, protocol::codec());
    while let Some(frame) = reader.next().await {
        let frame = frame?;
        let message = match protocol::decode::<PoolMessage>(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring unreadable message from pool: {}", e);
                continue;
            }
        };

        match message {
            PoolMessage::Task { id, payload } => {
                debug!("Running task {}", id);
                let reporter = Reporter::new(&id, outbox.clone());
                let reply = match handler.handle(&id, payload, &reporter).await {
                    Ok(result) => WorkerMessage::Completed { id, result },
                    Err(error) => WorkerMessage::Failed { id, error },
                };
                if outbox.send(reply).is_err() {
                    return Err(anyhow!("output to the pool is closed"));
                }
            }
        }
    }

    debug!("Input closed, flushing remaining replies");
    drop(outbox);
    writer.await??;
    Ok(())
}
