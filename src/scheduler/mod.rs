// =============================================================================
// Queue & Worker Scheduler — task queues, coalescing, cooperative workers
// =============================================================================
//
// Five single-consumer queues drive the engine (buy, sell, monitor tasks,
// post-trade refresh, order monitor). Each worker is a spawned loop that
// awaits its queue and a command channel; `stop` finishes the in-flight task
// and exits, `stop_and_drain` empties the queue first. The monitor queue
// supports `schedule_latest`, which coalesces tasks by dedupe key so a slow
// consumer sees only the newest instance.
// =============================================================================

pub mod refresh_gate;

pub use refresh_gate::RefreshGate;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::types::Direction;

// ---------------------------------------------------------------------------
// Monitor tasks
// ---------------------------------------------------------------------------

/// Typed tasks consumed by the monitor worker.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorTask {
    AutoSymbolTick {
        underlying: String,
    },
    AutoSymbolSwitchDistance {
        underlying: String,
        direction: Direction,
    },
    UnrealizedLossCheck {
        underlying: String,
    },
    LiquidationDistanceCheck {
        underlying: String,
    },
    SeatRefresh {
        underlying: String,
        direction: Direction,
        seat_version: u32,
    },
}

impl MonitorTask {
    /// Coalescing key: only the newest task per key survives in the queue.
    pub fn dedupe_key(&self) -> String {
        match self {
            Self::AutoSymbolTick { underlying } => format!("auto-symbol:{underlying}"),
            Self::AutoSymbolSwitchDistance {
                underlying,
                direction,
            } => format!("switch-distance:{underlying}:{direction}"),
            Self::UnrealizedLossCheck { underlying } => format!("unrealized-loss:{underlying}"),
            Self::LiquidationDistanceCheck { underlying } => {
                format!("liquidation-distance:{underlying}")
            }
            Self::SeatRefresh {
                underlying,
                direction,
                ..
            } => format!("seat-refresh:{underlying}:{direction}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Task queue
// ---------------------------------------------------------------------------

struct Entry<T> {
    dedupe_key: Option<String>,
    task: T,
}

/// FIFO queue with an async consumer side and optional coalescing.
pub struct TaskQueue<T> {
    name: &'static str,
    inner: Mutex<VecDeque<Entry<T>>>,
    notify: Notify,
}

impl<T: Send> TaskQueue<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn push(&self, task: T) {
        self.inner.lock().push_back(Entry {
            dedupe_key: None,
            task,
        });
        self.notify.notify_one();
    }

    /// Replace any queued task with the same key, keeping queue position at
    /// the back.
    pub fn schedule_latest(&self, key: String, task: T) {
        let mut inner = self.inner.lock();
        inner.retain(|e| e.dedupe_key.as_ref() != Some(&key));
        inner.push_back(Entry {
            dedupe_key: Some(key),
            task,
        });
        drop(inner);
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().pop_front().map(|e| e.task)
    }

    /// Await the next task. Single-consumer.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(task) = self.try_pop() {
                return task;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.len();
        inner.clear();
        n
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    Run,
    Stop,
    Drain,
}

/// Spawn the canonical worker loop over `queue`.
///
/// The handler is awaited to completion for every task; commands are only
/// observed between tasks, so an in-flight task always finishes.
pub fn spawn_worker_loop<T, F, Fut>(
    name: &'static str,
    queue: Arc<TaskQueue<T>>,
    mut commands: watch::Receiver<WorkerCommand>,
    handler: F,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        info!(worker = name, "worker started");
        loop {
            // Copy the command out so the watch borrow never spans an await.
            let command = *commands.borrow();
            match command {
                WorkerCommand::Stop => break,
                WorkerCommand::Drain => {
                    while let Some(task) = queue.try_pop() {
                        handler(task).await;
                    }
                    break;
                }
                WorkerCommand::Run => {}
            }

            tokio::select! {
                changed = commands.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                task = queue.pop() => {
                    handler(task).await;
                }
            }
        }
        info!(worker = name, "worker exited");
    })
}

type SpawnFn = Box<dyn Fn(watch::Receiver<WorkerCommand>) -> JoinHandle<()> + Send + Sync>;

/// Lifecycle wrapper around one worker loop: start / stop / stop_and_drain /
/// restart.
pub struct Worker {
    name: &'static str,
    spawn_fn: SpawnFn,
    control: Mutex<Option<(watch::Sender<WorkerCommand>, JoinHandle<()>)>>,
}

impl Worker {
    pub fn new(name: &'static str, spawn_fn: SpawnFn) -> Self {
        Self {
            name,
            spawn_fn,
            control: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut control = self.control.lock();
        if control.is_some() {
            debug!(worker = self.name, "start ignored — already running");
            return;
        }
        let (tx, rx) = watch::channel(WorkerCommand::Run);
        let handle = (self.spawn_fn)(rx);
        *control = Some((tx, handle));
    }

    pub fn is_running(&self) -> bool {
        self.control.lock().is_some()
    }

    async fn shutdown(&self, command: WorkerCommand) {
        let taken = self.control.lock().take();
        if let Some((tx, handle)) = taken {
            let _ = tx.send(command);
            if let Err(e) = handle.await {
                debug!(worker = self.name, error = %e, "worker join error");
            }
        }
    }

    /// Finish the in-flight task (if any) and exit.
    pub async fn stop(&self) {
        self.shutdown(WorkerCommand::Stop).await;
    }

    /// Process everything already queued, then exit.
    pub async fn stop_and_drain(&self) {
        self.shutdown(WorkerCommand::Drain).await;
    }

    pub async fn restart(&self) {
        self.stop().await;
        self.start();
    }
}
