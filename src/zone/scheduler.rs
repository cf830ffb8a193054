//! Task routing across a zone's fixed worker pool.
//!
//! Submission is non-blocking: every policy resolves to an enqueue plus a
//! condvar signal, and nothing on the submitting thread ever calls into an
//! engine. Idle workers are preferred; stale idle entries are tolerated
//! and re-checked on pop rather than removed eagerly.

use std::collections::VecDeque;
use std::sync::{mpsc, Arc, Mutex};

use crate::engine::EngineFactory;
use crate::error::{ZoneError, ZoneResult};
use crate::zone::task::Task;
use crate::zone::worker::{Worker, WorkerCommand};
use crate::zone::{WorkerId, ZoneSettings};

/// FIFO of workers currently reporting idleness.
///
/// Entries may be stale (the worker took a directly-scheduled task since
/// reporting); consumers re-check the worker's actual state after popping.
pub(crate) struct IdleQueue {
    queue: Mutex<VecDeque<WorkerId>>,
}

impl IdleQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, id: WorkerId) {
        self.queue.lock().unwrap().push_back(id);
    }

    pub fn pop(&self) -> Option<WorkerId> {
        self.queue.lock().unwrap().pop_front()
    }
}

/// Partial broadcast-submission failure: `scheduled` workers already hold
/// the task, the rest never will.
#[derive(Debug, thiserror::Error)]
#[error("broadcast scheduling stopped after {scheduled} workers: {error}")]
pub(crate) struct BroadcastScheduleError {
    pub scheduled: usize,
    pub error: ZoneError,
}

pub(crate) struct Scheduler {
    zone_id: String,
    workers: Vec<Worker>,
    idle: Arc<IdleQueue>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("zone_id", &self.zone_id)
            .field("worker_count", &self.workers.len())
            .finish()
    }
}

impl Scheduler {
    /// Spawn all workers and wait until each has built its engine.
    ///
    /// The first engine-construction failure fails scheduler creation;
    /// already-started workers are torn down by the `Drop` impl.
    pub fn new(settings: &ZoneSettings, factory: Arc<dyn EngineFactory>) -> ZoneResult<Self> {
        let idle = Arc::new(IdleQueue::new());
        let (ready_tx, ready_rx) = mpsc::channel();

        let workers: Vec<Worker> = (0..settings.workers)
            .map(|id| {
                Worker::spawn(
                    settings,
                    id,
                    factory.clone(),
                    idle.clone(),
                    ready_tx.clone(),
                )
            })
            .collect();
        drop(ready_tx);

        let scheduler = Scheduler {
            zone_id: settings.id.clone(),
            workers,
            idle,
        };

        for _ in 0..settings.workers {
            match ready_rx.recv() {
                Ok((id, Ok(()))) => {
                    tracing::debug!(zone = %scheduler.zone_id, worker = id, "worker engine ready");
                }
                Ok((id, Err(err))) => {
                    tracing::error!(
                        zone = %scheduler.zone_id,
                        worker = id,
                        error = %err,
                        "worker engine failed to start"
                    );
                    return Err(ZoneError::Engine(err));
                }
                Err(_) => {
                    // A worker thread died before reporting; a scheduler
                    // invariant is broken.
                    panic!("worker readiness channel closed during scheduler startup");
                }
            }
        }

        Ok(scheduler)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Place the task on some worker: an idle one when available,
    /// otherwise the worker with the shortest queue (lowest id on ties).
    pub fn schedule(&self, task: Task) -> ZoneResult<()> {
        let task = Arc::new(task);

        while let Some(id) = self.idle.pop() {
            let shared = self.workers[id].shared();
            shared.clear_idle_flag();
            if shared.is_idle() {
                tracing::debug!(zone = %self.zone_id, worker = id, "scheduling on idle worker");
                return shared.enqueue(WorkerCommand::Run(task));
            }
            // Stale entry: the worker got work since reporting idle.
        }

        let target = self.shortest_queue();
        tracing::debug!(zone = %self.zone_id, worker = target, "scheduling on shortest queue");
        self.workers[target].shared().enqueue(WorkerCommand::Run(task))
    }

    /// Place the task on the given worker unconditionally.
    pub fn schedule_on_worker(&self, worker: WorkerId, task: Task) -> ZoneResult<()> {
        let shared = self
            .workers
            .get(worker)
            .ok_or(ZoneError::UnknownWorker { worker })?
            .shared();
        shared.enqueue(WorkerCommand::Run(Arc::new(task)))
    }

    /// Place the same shared task on every worker's queue exactly once.
    ///
    /// Each enqueue signals its worker immediately, so workers wake
    /// together as far as the OS scheduler is concerned.
    pub fn schedule_on_all_workers(&self, task: Arc<Task>) -> Result<(), BroadcastScheduleError> {
        for (scheduled, worker) in self.workers.iter().enumerate() {
            if let Err(error) = worker.shared().enqueue(WorkerCommand::Run(task.clone())) {
                return Err(BroadcastScheduleError { scheduled, error });
            }
        }
        Ok(())
    }

    fn shortest_queue(&self) -> WorkerId {
        let mut target = 0;
        let mut shortest = usize::MAX;
        for (id, worker) in self.workers.iter().enumerate() {
            let len = worker.shared().queue_len();
            if len < shortest {
                shortest = len;
                target = id;
            }
        }
        target
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        tracing::debug!(zone = %self.zone_id, "shutting down scheduler");
        for worker in &self.workers {
            worker.request_quit();
        }
        for worker in &mut self.workers {
            worker.join();
        }
    }
}
