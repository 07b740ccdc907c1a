//! Worker records and the OS processes behind them.
//!
//! Each [`WorkerProcess`] is supervised by its own tokio task, which owns the
//! child, writes pool messages to its stdin, reads worker messages from its
//! stdout and reports a single [`WorkerEvent::Exited`] once the child is gone.

use futures::{SinkExt, StreamExt};
use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::protocol::{self, PoolMessage, WorkerMessage};
use crate::task::Task;

/// Environment variable telling a worker process which record it belongs to
pub const WORKER_ID_ENV: &str = "FETCHPOOL_WORKER_ID";

/// Something that happened to a worker process, as seen by the pool
#[derive(Debug)]
pub enum WorkerEvent {
    Message {
        worker_id: usize,
        generation: u64,
        message: WorkerMessage,
    },
    /// The process is gone. `intentional` is set when the pool asked it to stop.
    Exited {
        worker_id: usize,
        generation: u64,
        code: Option<i32>,
        intentional: bool,
    },
    /// A delayed respawn attempt is due
    RestartDue { worker_id: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy { task_id: String },
    /// No live process; waiting for respawn
    Crashed,
    Terminated,
}

/// Pool bookkeeping for one worker slot
///
/// The `id` is stable for the life of the pool; the process behind it is
/// replaced on every restart and `generation` tells the incarnations apart.
#[derive(Debug)]
pub struct WorkerRecord {
    pub id: usize,
    pub state: WorkerState,
    pub completed: u64,
    pub generation: u64,
    /// When the current process was started
    started_at: Instant,
    process: Option<WorkerProcess>,
}

impl WorkerRecord {
    /// Create the record and start its first process
    pub fn spawn(
        id: usize,
        config: &PoolConfig,
        events: &mpsc::UnboundedSender<WorkerEvent>,
    ) -> io::Result<Self> {
        let process = WorkerProcess::spawn(id, 0, config, events.clone())?;
        Ok(Self {
            id,
            state: WorkerState::Idle,
            completed: 0,
            generation: 0,
            started_at: Instant::now(),
            process: Some(process),
        })
    }

    /// Replace a dead process with a fresh one under the same id
    pub fn respawn(
        &mut self,
        config: &PoolConfig,
        events: &mpsc::UnboundedSender<WorkerEvent>,
    ) -> io::Result<()> {
        // The old handle is discarded; kill_on_drop reaps anything left of it
        self.process = None;
        self.generation += 1;
        let process = WorkerProcess::spawn(self.id, self.generation, config, events.clone())?;
        self.started_at = Instant::now();
        self.process = Some(process);
        self.state = WorkerState::Idle;
        Ok(())
    }

    /// How long the current (or last) process has been up
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_idle(&self) -> bool {
        self.state == WorkerState::Idle && self.process.is_some()
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.state, WorkerState::Busy { .. })
    }

    /// Task currently held by this worker
    pub fn in_flight(&self) -> Option<&str> {
        match &self.state {
            WorkerState::Busy { task_id } => Some(task_id),
            _ => None,
        }
    }

    /// Hand a task to the process. Gives the task back if the process is
    /// already gone, leaving the record marked crashed.
    pub fn assign(&mut self, task: Task) -> Result<(), Task> {
        let Some(process) = &self.process else {
            return Err(task);
        };

        let message = PoolMessage::Task {
            id: task.id.clone(),
            payload: task.payload.clone(),
        };
        if !process.send(message) {
            self.state = WorkerState::Crashed;
            return Err(task);
        }

        self.state = WorkerState::Busy { task_id: task.id };
        Ok(())
    }

    /// Record a terminal message. Returns false if the worker was not
    /// holding `task_id`.
    pub fn finish(&mut self, task_id: &str) -> bool {
        if self.in_flight() != Some(task_id) {
            return false;
        }
        self.state = WorkerState::Idle;
        self.completed += 1;
        true
    }

    /// Mark the process dead and hand back whatever task it was holding
    pub fn crash(&mut self) -> Option<String> {
        let stranded = match std::mem::replace(&mut self.state, WorkerState::Crashed) {
            WorkerState::Busy { task_id } => Some(task_id),
            _ => None,
        };
        self.process = None;
        stranded
    }

    /// Detach the live process for shutdown
    pub fn take_process(&mut self) -> Option<WorkerProcess> {
        self.state = WorkerState::Terminated;
        self.process.take()
    }
}

/// Handle to one live worker process
#[derive(Debug)]
pub struct WorkerProcess {
    outbox: mpsc::UnboundedSender<PoolMessage>,
    shutdown: Option<oneshot::Sender<()>>,
    supervisor: JoinHandle<()>,
}

impl WorkerProcess {
    pub fn spawn(
        worker_id: usize,
        generation: u64,
        config: &PoolConfig,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> io::Result<Self> {
        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(WORKER_ID_ENV, worker_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Spawning worker {}: {:?}", worker_id, cmd);
        let mut child = cmd.spawn()?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("worker stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout was not captured"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(worker_id, stderr));
        }

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let supervisor = Supervisor {
            worker_id,
            generation,
            grace: config.shutdown_grace,
            events,
        };
        let supervisor = tokio::spawn(supervisor.run(child, stdin, stdout, outbox_rx, shutdown_rx));

        info!("Worker {} started (pid {:?})", worker_id, pid);
        Ok(Self {
            outbox,
            shutdown: Some(shutdown_tx),
            supervisor,
        })
    }

    /// Queue a message for the process. Returns false if it is already gone.
    pub fn send(&self, message: PoolMessage) -> bool {
        self.outbox.send(message).is_ok()
    }

    /// Ask the process to exit, killing it after the grace period.
    /// Resolves once the process has been reaped.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.supervisor).await {
            warn!("Worker supervisor failed: {}", e);
        }
    }
}

/// How the supervisor's read loop ended
enum Ending {
    StdoutClosed,
    StreamBroken,
    ShutdownRequested,
}

struct Supervisor {
    worker_id: usize,
    generation: u64,
    grace: Duration,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl Supervisor {
    async fn run(
        self,
        mut child: Child,
        stdin: ChildStdin,
        stdout: ChildStdout,
        mut outbox: mpsc::UnboundedReceiver<PoolMessage>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut writer = FramedWrite::new(stdin, protocol::codec());
        let mut reader = FramedRead::new(stdout, protocol::codec());

        let ending = loop {
            tokio::select! {
                outgoing = outbox.recv() => match outgoing {
                    Some(message) => self.write(&mut writer, &message).await,
                    // The pool dropped this process
                    None => break Ending::ShutdownRequested,
                },
                frame = reader.next() => match frame {
                    Some(Ok(frame)) => self.forward(&frame),
                    Some(Err(e)) => {
                        warn!("Worker {} sent an unreadable frame: {}", self.worker_id, e);
                        break Ending::StreamBroken;
                    }
                    None => break Ending::StdoutClosed,
                },
                _ = &mut shutdown => break Ending::ShutdownRequested,
            }
        };

        let (code, intentional) = match ending {
            Ending::ShutdownRequested => {
                drop(reader);
                (self.stop(&mut child, writer).await, true)
            }
            Ending::StreamBroken => {
                let _ = child.start_kill();
                (wait_code(&mut child).await, false)
            }
            Ending::StdoutClosed => {
                tokio::select! {
                    code = wait_code(&mut child) => (code, false),
                    _ = &mut shutdown => (self.stop(&mut child, writer).await, true),
                }
            }
        };

        if intentional {
            debug!("Worker {} stopped (status {:?})", self.worker_id, code);
        } else {
            warn!("Worker {} exited unexpectedly (status {:?})", self.worker_id, code);
        }

        let _ = self.events.send(WorkerEvent::Exited {
            worker_id: self.worker_id,
            generation: self.generation,
            code,
            intentional,
        });
    }

    async fn write(
        &self,
        writer: &mut FramedWrite<ChildStdin, LengthDelimitedCodec>,
        message: &PoolMessage,
    ) {
        let frame = match protocol::encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode message for worker {}: {}", self.worker_id, e);
                return;
            }
        };
        // A failed write means the process is dying; its exit is reported separately
        if let Err(e) = writer.send(frame).await {
            warn!("Failed to write to worker {}: {}", self.worker_id, e);
        }
    }

    fn forward(&self, frame: &[u8]) {
        match protocol::decode::<WorkerMessage>(frame) {
            Ok(message) => {
                let _ = self.events.send(WorkerEvent::Message {
                    worker_id: self.worker_id,
                    generation: self.generation,
                    message,
                });
            }
            Err(e) => warn!("Discarding message from worker {}: {}", self.worker_id, e),
        }
    }

    /// Close stdin and give the process `grace` to exit before killing it
    async fn stop(
        &self,
        child: &mut Child,
        writer: FramedWrite<ChildStdin, LengthDelimitedCodec>,
    ) -> Option<i32> {
        drop(writer);
        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                warn!("Failed to wait for worker {}: {}", self.worker_id, e);
                None
            }
            Err(_) => {
                warn!(
                    "Worker {} did not exit within {:?}, killing it",
                    self.worker_id, self.grace
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill worker {}: {}", self.worker_id, e);
                }
                None
            }
        }
    }
}

async fn wait_code(child: &mut Child) -> Option<i32> {
    match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            warn!("Failed to wait for worker process: {}", e);
            None
        }
    }
}

async fn forward_stderr(worker_id: usize, stderr: ChildStderr) {
    let mut lines = protocol::lossy_lines(stderr);
    while let Some(Ok(line)) = lines.next().await {
        debug!("[worker {}] {}", worker_id, line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn test_config(program: &str, args: &[&str]) -> PoolConfig {
        PoolConfig::default()
            .with_size(1)
            .with_command(program, args.iter().copied())
            .with_shutdown_grace(Duration::from_millis(300))
    }

    #[tokio::test]
    async fn test_record_state_transitions() {
        let (events, _rx) = mpsc::unbounded_channel();
        let config = test_config("cat", &[]);
        let mut record = WorkerRecord::spawn(3, &config, &events).unwrap();
        assert!(record.is_idle());

        record.assign(Task::new("t1", Value::Null)).unwrap();
        assert!(record.is_busy());
        assert_eq!(record.in_flight(), Some("t1"));

        assert!(!record.finish("other"));
        assert!(record.finish("t1"));
        assert!(record.is_idle());
        assert_eq!(record.completed, 1);

        record.assign(Task::new("t2", Value::Null)).unwrap();
        assert_eq!(record.crash().as_deref(), Some("t2"));
        assert_eq!(record.state, WorkerState::Crashed);
        assert!(record.assign(Task::new("t3", Value::Null)).is_err());

        record.respawn(&config, &events).unwrap();
        assert_eq!(record.id, 3);
        assert_eq!(record.generation, 1);
        assert!(record.is_idle());

        if let Some(process) = record.take_process() {
            process.shutdown().await;
        }
        assert_eq!(record.state, WorkerState::Terminated);
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_reported() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let config = test_config("sh", &["-c", "exit 7"]);
        let _process = WorkerProcess::spawn(0, 5, &config, events).unwrap();

        match rx.recv().await.unwrap() {
            WorkerEvent::Exited {
                worker_id,
                generation,
                code,
                intentional,
            } => {
                assert_eq!(worker_id, 0);
                assert_eq!(generation, 5);
                assert_eq!(code, Some(7));
                assert!(!intentional);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_kills_unresponsive_process() {
        let (events, mut rx) = mpsc::unbounded_channel();
        // Ignores stdin entirely, so closing it does not stop the process
        let config = test_config("sleep", &["30"]);
        let process = WorkerProcess::spawn(1, 0, &config, events).unwrap();

        let started = std::time::Instant::now();
        process.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(10));

        match rx.recv().await.unwrap() {
            WorkerEvent::Exited { intentional, .. } => assert!(intentional),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let (events, _rx) = mpsc::unbounded_channel();
        let config = test_config("/nonexistent/fetchpool-worker", &[]);
        assert!(WorkerRecord::spawn(0, &config, &events).is_err());
    }
}
