//! The dispatcher: a single control loop that owns the task queue, the
//! completion registry and the worker table.
//!
//! [`Pool`] is a cheap, cloneable handle. All state lives in one tokio task
//! that reacts to caller commands and worker events in arrival order, so
//! assignment never races with itself.

use serde::Serialize;
use serde_json::Value;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use crate::config::PoolConfig;
use crate::protocol::{LogLevel, WorkerMessage};
use crate::queue::{CompletionRegistry, PendingTask, TaskQueue};
use crate::task::{FailureReason, Task, TaskHandle};
use crate::worker::{WorkerEvent, WorkerProcess, WorkerRecord, WorkerState};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool size must be at least 1")]
    InvalidSize,
    #[error("failed to start worker {worker_id}: {source}")]
    Spawn {
        worker_id: usize,
        #[source]
        source: io::Error,
    },
    #[error("pool has been terminated")]
    Terminated,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Number of worker records
    pub size: usize,
    pub active_workers: usize,
    pub queue_length: usize,
    /// Terminal messages observed across all workers
    pub completed: u64,
}

/// Notifications for subscribers, tagged with the originating worker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    TaskStarted {
        worker_id: usize,
        task_id: String,
    },
    Progress {
        worker_id: usize,
        task_id: String,
        value: Value,
    },
    Log {
        worker_id: usize,
        level: LogLevel,
        message: String,
        data: Value,
    },
    TaskFinished {
        worker_id: usize,
        task_id: String,
        success: bool,
    },
    WorkerRestarted {
        worker_id: usize,
        generation: u64,
    },
}

enum Command {
    Submit { task: Task, pending: PendingTask },
    Terminate { done: oneshot::Sender<()> },
}

/// Handle to a running pool of worker processes
#[derive(Debug, Clone)]
pub struct Pool {
    commands: mpsc::UnboundedSender<Command>,
    stats: watch::Receiver<PoolStats>,
    events: broadcast::Sender<PoolEvent>,
    closed: Arc<AtomicBool>,
}

impl Pool {
    /// Start `config.size` worker processes and the dispatcher.
    ///
    /// Must be called from within a tokio runtime. If any worker fails to
    /// start, the ones already running are shut down and the error returned.
    pub fn spawn(config: PoolConfig) -> Result<Self, PoolError> {
        if config.size == 0 {
            return Err(PoolError::InvalidSize);
        }

        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let mut workers = Vec::with_capacity(config.size);
        for worker_id in 0..config.size {
            match WorkerRecord::spawn(worker_id, &config, &worker_tx) {
                Ok(record) => workers.push(record),
                Err(source) => {
                    error!("Failed to start worker {}: {}", worker_id, source);
                    for record in &mut workers {
                        // Dropping the handle stops the process in the background
                        drop(record.take_process());
                    }
                    return Err(PoolError::Spawn { worker_id, source });
                }
            }
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let initial = PoolStats {
            size: workers.len(),
            ..PoolStats::default()
        };
        let (stats_tx, stats_rx) = watch::channel(initial);

        info!("Started pool with {} workers", workers.len());

        let dispatcher = Dispatcher {
            config,
            workers,
            queue: TaskQueue::new(),
            registry: CompletionRegistry::new(),
            completed: 0,
            worker_tx,
            stats: stats_tx,
            events: events.clone(),
        };
        tokio::spawn(dispatcher.run(command_rx, worker_rx));

        Ok(Self {
            commands: command_tx,
            stats: stats_rx,
            events,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Queue a task. Never blocks; the returned handle settles when the
    /// task's terminal outcome is known.
    pub fn submit(&self, task: Task) -> Result<TaskHandle, PoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Terminated);
        }

        let (tx, rx) = oneshot::channel();
        let payload = Arc::new(task.payload.clone());
        let handle = TaskHandle::new(&task.id, Arc::clone(&payload), rx);
        let pending = PendingTask::new(payload, tx);
        self.commands
            .send(Command::Submit { task, pending })
            .map_err(|_| PoolError::Terminated)?;
        Ok(handle)
    }

    pub fn stats(&self) -> PoolStats {
        *self.stats.borrow()
    }

    /// Stats that update as the dispatcher changes state.
    ///
    /// A task handle may settle before the stats reflecting it are published;
    /// use `wait_for` on the receiver to observe a specific state.
    pub fn watch_stats(&self) -> watch::Receiver<PoolStats> {
        self.stats.clone()
    }

    /// Receive progress, log and lifecycle events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn is_terminated(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fail everything still pending, stop every worker process and clear
    /// the pool. Safe to call more than once.
    pub async fn terminate(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let (done, finished) = oneshot::channel();
        if self.commands.send(Command::Terminate { done }).is_ok() {
            // An error here means the dispatcher already finished shutting down
            let _ = finished.await;
        }
    }
}

struct Dispatcher {
    config: PoolConfig,
    workers: Vec<WorkerRecord>,
    queue: TaskQueue,
    registry: CompletionRegistry,
    completed: u64,
    worker_tx: mpsc::UnboundedSender<WorkerEvent>,
    stats: watch::Sender<PoolStats>,
    events: broadcast::Sender<PoolEvent>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut worker_events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Submit { task, pending }) => self.submit(task, pending),
                    Some(Command::Terminate { done }) => {
                        self.terminate().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        debug!("All pool handles dropped");
                        self.terminate().await;
                        break;
                    }
                },
                Some(event) = worker_events.recv() => self.handle_worker_event(event),
            }
            self.publish_stats();
        }
    }

    fn submit(&mut self, task: Task, pending: PendingTask) {
        if let Err(pending) = self.registry.insert(&task.id, pending) {
            warn!("Rejecting task {}: a task with this id is pending", task.id);
            pending.reject(&task.id, FailureReason::DuplicateId);
            return;
        }
        debug!("Queued task {}", task.id);
        self.queue.push_back(task);
        self.dispatch();
    }

    /// Keep assigning while there is both queued work and an idle worker
    fn dispatch(&mut self) {
        while self.assign_next() {}
    }

    /// Pop the queue head onto the first idle worker. Returns false when
    /// nothing could be assigned.
    fn assign_next(&mut self) -> bool {
        if self.queue.is_empty() {
            return false;
        }
        let Some(index) = self.workers.iter().position(WorkerRecord::is_idle) else {
            return false;
        };
        let Some(task) = self.queue.pop_front() else {
            return false;
        };

        let worker = &mut self.workers[index];
        let task_id = task.id.clone();
        match worker.assign(task) {
            Ok(()) => {
                debug!("Assigned task {} to worker {}", task_id, worker.id);
                let worker_id = worker.id;
                self.emit(PoolEvent::TaskStarted { worker_id, task_id });
            }
            Err(task) => {
                // The process died before we noticed; its exit event will restart it
                warn!(
                    "Worker {} is gone, returning task {} to the queue",
                    worker.id, task_id
                );
                self.queue.push_front(task);
            }
        }
        true
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Message {
                worker_id,
                generation,
                message,
            } => {
                if !self.is_current(worker_id, generation) {
                    trace!("Ignoring message from retired worker {}", worker_id);
                    return;
                }
                self.handle_message(worker_id, message);
            }
            WorkerEvent::Exited {
                worker_id,
                generation,
                code,
                intentional,
            } => {
                if intentional || !self.is_current(worker_id, generation) {
                    return;
                }
                self.recover(worker_id, code);
            }
            WorkerEvent::RestartDue { worker_id } => self.restart(worker_id),
        }
    }

    fn handle_message(&mut self, worker_id: usize, message: WorkerMessage) {
        match message {
            WorkerMessage::Log {
                level,
                message,
                data,
            } => {
                match level {
                    LogLevel::Trace => trace!("[worker {}] {}", worker_id, message),
                    LogLevel::Debug => debug!("[worker {}] {}", worker_id, message),
                    LogLevel::Info => info!("[worker {}] {}", worker_id, message),
                    LogLevel::Warn => warn!("[worker {}] {}", worker_id, message),
                    LogLevel::Error => error!("[worker {}] {}", worker_id, message),
                }
                self.emit(PoolEvent::Log {
                    worker_id,
                    level,
                    message,
                    data,
                });
            }
            WorkerMessage::Progress { id, value } => {
                self.emit(PoolEvent::Progress {
                    worker_id,
                    task_id: id,
                    value,
                });
            }
            WorkerMessage::Completed { id, result } => self.settle(worker_id, id, Ok(result)),
            WorkerMessage::Failed { id, error } => {
                self.settle(worker_id, id, Err(FailureReason::Failed(error)))
            }
        }
    }

    /// Handle a terminal message: settle the caller, free the worker and
    /// feed it the next task
    fn settle(&mut self, worker_id: usize, task_id: String, outcome: Result<Value, FailureReason>) {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return;
        };
        if !worker.finish(&task_id) {
            warn!(
                "Worker {} reported an outcome for task {} it was not running",
                worker_id, task_id
            );
            return;
        }
        self.completed += 1;

        let success = outcome.is_ok();
        match &outcome {
            Ok(_) => info!("Task {} completed on worker {}", task_id, worker_id),
            Err(reason) => warn!("Task {} failed on worker {}: {}", task_id, worker_id, reason),
        }
        self.registry.resolve(&task_id, outcome);
        self.emit(PoolEvent::TaskFinished {
            worker_id,
            task_id,
            success,
        });
        self.dispatch();
    }

    /// A worker process died on its own: fail its task and bring it back.
    /// A process that did not outlive `restart_backoff` is restarted after
    /// the backoff, so a worker that dies on startup cannot spin.
    fn recover(&mut self, worker_id: usize, code: Option<i32>) {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return;
        };
        let uptime = worker.uptime();
        let stranded = worker.crash();
        warn!(
            "Worker {} crashed after {:?} (status {:?})",
            worker_id, uptime, code
        );

        if let Some(task_id) = stranded {
            self.registry
                .resolve(&task_id, Err(FailureReason::WorkerCrashed { worker_id, code }));
            self.emit(PoolEvent::TaskFinished {
                worker_id,
                task_id,
                success: false,
            });
        }

        if uptime < self.config.restart_backoff {
            self.schedule_restart(worker_id);
        } else {
            self.restart(worker_id);
        }
    }

    fn restart(&mut self, worker_id: usize) {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return;
        };
        if worker.state != WorkerState::Crashed {
            return;
        }

        match worker.respawn(&self.config, &self.worker_tx) {
            Ok(()) => {
                let generation = worker.generation;
                info!("Worker {} restarted", worker_id);
                self.emit(PoolEvent::WorkerRestarted {
                    worker_id,
                    generation,
                });
                self.dispatch();
            }
            Err(e) => {
                error!("Failed to restart worker {}: {}", worker_id, e);
                self.schedule_restart(worker_id);
            }
        }
    }

    /// Deliver a `RestartDue` for this worker once `restart_backoff` has passed
    fn schedule_restart(&self, worker_id: usize) {
        let delay = self.config.restart_backoff;
        debug!("Restarting worker {} in {:?}", worker_id, delay);
        let tx = self.worker_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(WorkerEvent::RestartDue { worker_id });
        });
    }

    async fn terminate(&mut self) {
        let queued = self.queue.len();
        for task in self.queue.drain() {
            self.registry.resolve(&task.id, Err(FailureReason::Terminated));
        }

        let mut processes: Vec<WorkerProcess> = Vec::with_capacity(self.workers.len());
        let mut abandoned = 0;
        for worker in &mut self.workers {
            if let Some(task_id) = worker.in_flight().map(str::to_string) {
                self.registry.resolve(&task_id, Err(FailureReason::Terminated));
                abandoned += 1;
            }
            if let Some(process) = worker.take_process() {
                processes.push(process);
            }
        }
        self.registry.fail_all(FailureReason::Terminated);

        info!(
            "Terminating pool: {} queued and {} running tasks abandoned, stopping {} workers",
            queued,
            abandoned,
            processes.len()
        );
        futures::future::join_all(processes.into_iter().map(WorkerProcess::shutdown)).await;

        self.workers.clear();
        self.publish_stats();
        info!("Pool terminated");
    }

    fn is_current(&self, worker_id: usize, generation: u64) -> bool {
        self.workers
            .get(worker_id)
            .is_some_and(|worker| worker.generation == generation)
    }

    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn publish_stats(&self) {
        let stats = PoolStats {
            size: self.workers.len(),
            active_workers: self.workers.iter().filter(|w| w.is_busy()).count(),
            queue_length: self.queue.len(),
            completed: self.completed,
        };
        self.stats.send_if_modified(|current| {
            if *current == stats {
                return false;
            }
            *current = stats;
            true
        });
    }
}
