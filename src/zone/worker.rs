//! Worker threads: one engine instance, one private task queue, one
//! cooperative event loop per worker.
//!
//! A worker consumes tasks one at a time in submission order. Between
//! tasks it pumps the engine's event loop so promise continuations and
//! engine timers make progress even under a saturated task queue; a
//! queued task always takes priority over further pumping.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::engine::{EngineError, EngineFactory, EventLoopPump, WorkerEngine};
use crate::error::{ZoneError, ZoneResult};
use crate::zone::scheduler::IdleQueue;
use crate::zone::task::{Task, WorkerScope};
use crate::zone::{WorkerId, ZoneSettings};

pub(crate) const STATE_STARTING: u8 = 0;
pub(crate) const STATE_IDLE: u8 = 1;
pub(crate) const STATE_BUSY: u8 = 2;
pub(crate) const STATE_DRAINING: u8 = 3;
pub(crate) const STATE_STOPPED: u8 = 4;

/// How long an idle worker sleeps between event-loop pumps while the
/// engine still reports pending work.
const PUMP_INTERVAL: Duration = Duration::from_millis(1);

pub(crate) enum WorkerCommand {
    Run(Arc<Task>),
    Quit,
}

/// Identity of the worker owning the current thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerContext {
    pub zone_id: String,
    pub worker_id: WorkerId,
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
}

/// The worker context of the calling thread, if it is a zone worker.
pub fn current_worker() -> Option<WorkerContext> {
    CURRENT_WORKER.with(|slot| slot.borrow().clone())
}

fn install_worker_context(context: WorkerContext) {
    CURRENT_WORKER.with(|slot| *slot.borrow_mut() = Some(context));
}

/// State shared between a worker's thread and its submitters.
pub(crate) struct WorkerShared {
    id: WorkerId,
    queue: Mutex<VecDeque<WorkerCommand>>,
    wakeup: Condvar,
    state: AtomicU8,
    shutdown: AtomicBool,
    /// True while this worker's id sits in the scheduler's idle queue;
    /// keeps the id enqueued at most once.
    idle_enqueued: AtomicBool,
    idle_queue: Arc<IdleQueue>,
    max_queue_depth: Option<usize>,
}

impl WorkerShared {
    /// Place a command on the queue and wake the worker.
    ///
    /// `Quit` jumps to the front so tasks queued behind it drain with
    /// `Terminated` instead of executing during teardown. Submissions
    /// after the quit sentinel are rejected.
    pub fn enqueue(&self, command: WorkerCommand) -> ZoneResult<()> {
        let mut queue = self.queue.lock().unwrap();
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ZoneError::Terminated);
        }
        match command {
            WorkerCommand::Run(_) => {
                if let Some(depth) = self.max_queue_depth {
                    if queue.len() >= depth {
                        return Err(ZoneError::QueueFull { worker: self.id });
                    }
                }
                queue.push_back(command);
            }
            WorkerCommand::Quit => {
                self.shutdown.store(true, Ordering::Release);
                queue.push_front(command);
            }
        }
        drop(queue);
        self.wakeup.notify_one();
        Ok(())
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Idle means: queue empty and not executing a task. Pending engine
    /// event-loop work does not make a worker busy.
    pub fn is_idle(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_IDLE && self.queue.lock().unwrap().is_empty()
    }

    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_STOPPED
    }

    /// Called by the scheduler when it pops this worker's idle entry.
    pub fn clear_idle_flag(&self) {
        self.idle_enqueued.store(false, Ordering::Release);
    }

    fn try_pop(&self) -> Option<WorkerCommand> {
        self.queue.lock().unwrap().pop_front()
    }

    fn enter_idle(&self) {
        self.state.store(STATE_IDLE, Ordering::Release);
        if self
            .idle_enqueued
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.idle_queue.push(self.id);
        }
    }
}

pub(crate) struct Worker {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn the worker thread. Engine construction happens on that
    /// thread; its outcome arrives on `ready_tx`.
    pub fn spawn(
        settings: &ZoneSettings,
        id: WorkerId,
        factory: Arc<dyn EngineFactory>,
        idle_queue: Arc<IdleQueue>,
        ready_tx: mpsc::Sender<(WorkerId, Result<(), EngineError>)>,
    ) -> Worker {
        let shared = Arc::new(WorkerShared {
            id,
            queue: Mutex::new(VecDeque::new()),
            wakeup: Condvar::new(),
            state: AtomicU8::new(STATE_STARTING),
            shutdown: AtomicBool::new(false),
            idle_enqueued: AtomicBool::new(false),
            idle_queue,
            max_queue_depth: settings.max_queue_depth,
        });

        let thread_shared = shared.clone();
        let thread_settings = settings.clone();
        let thread = thread::Builder::new()
            .name(format!("jszone-worker-{}-{}", settings.id, id))
            .spawn(move || worker_main(thread_shared, thread_settings, factory, ready_tx))
            .expect("failed to spawn worker thread");

        Worker {
            shared,
            thread: Some(thread),
        }
    }

    pub fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    pub fn request_quit(&self) {
        // Already-shut-down workers reject the sentinel; that is fine.
        let _ = self.shared.enqueue(WorkerCommand::Quit);
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn worker_main(
    shared: Arc<WorkerShared>,
    settings: ZoneSettings,
    factory: Arc<dyn EngineFactory>,
    ready_tx: mpsc::Sender<(WorkerId, Result<(), EngineError>)>,
) {
    let worker_id = shared.id;
    install_worker_context(WorkerContext {
        zone_id: settings.id.clone(),
        worker_id,
    });

    let mut engine = match factory.create_engine(&settings, worker_id) {
        Ok(engine) => {
            let _ = ready_tx.send((worker_id, Ok(())));
            engine
        }
        Err(err) => {
            shared.state.store(STATE_STOPPED, Ordering::Release);
            let _ = ready_tx.send((worker_id, Err(err)));
            return;
        }
    };
    drop(ready_tx);
    tracing::debug!(zone = %settings.id, worker = worker_id, "worker ready");

    loop {
        match next_command(&shared, engine.as_mut()) {
            WorkerCommand::Run(task) => {
                shared.state.store(STATE_BUSY, Ordering::Release);
                let mut scope = WorkerScope {
                    engine: engine.as_mut(),
                    worker_id,
                    zone_id: &settings.id,
                };
                task.execute(&mut scope);
            }
            WorkerCommand::Quit => break,
        }
    }

    drain(&shared, &settings.id);
}

/// Wait for the next command, pumping the engine's event loop while the
/// queue is empty. A queued command always wins over further pumping.
fn next_command(shared: &WorkerShared, engine: &mut dyn WorkerEngine) -> WorkerCommand {
    loop {
        if let Some(command) = shared.try_pop() {
            return command;
        }

        match engine.pump_event_loop() {
            EventLoopPump::Pending => {
                shared.enter_idle();
                let queue = shared.queue.lock().unwrap();
                if queue.is_empty() {
                    let _ = shared.wakeup.wait_timeout(queue, PUMP_INTERVAL).unwrap();
                }
            }
            EventLoopPump::Quiescent => {
                shared.enter_idle();
                let mut queue = shared.queue.lock().unwrap();
                while queue.is_empty() {
                    queue = shared.wakeup.wait(queue).unwrap();
                }
            }
        }
    }
}

fn drain(shared: &WorkerShared, zone_id: &str) {
    shared.state.store(STATE_DRAINING, Ordering::Release);
    let pending: Vec<WorkerCommand> = {
        let mut queue = shared.queue.lock().unwrap();
        queue.drain(..).collect()
    };

    let mut drained = 0usize;
    for command in pending {
        if let WorkerCommand::Run(task) = command {
            task.resolve_terminated();
            drained += 1;
        }
    }
    if drained > 0 {
        tracing::warn!(
            zone = zone_id,
            worker = shared.id,
            drained,
            "pending tasks terminated during shutdown"
        );
    }

    shared.state.store(STATE_STOPPED, Ordering::Release);
    tracing::debug!(zone = zone_id, worker = shared.id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockFactory;
    use crate::error::ResultCode;
    use crate::test_util::{call_spec, collecting_context};
    use crate::zone::task::{CallTask, Task};

    fn spawn_worker(factory: MockFactory, settings: &ZoneSettings) -> (Worker, Arc<IdleQueue>) {
        let idle = Arc::new(IdleQueue::new());
        let (ready_tx, ready_rx) = mpsc::channel();
        let worker = Worker::spawn(settings, 0, Arc::new(factory), idle.clone(), ready_tx);
        let (_, outcome) = ready_rx.recv().unwrap();
        outcome.unwrap();
        (worker, idle)
    }

    fn run_call(worker: &Worker, module: &str, function: &str, args: &[u8]) -> CallContextSlot {
        let (context, slot) = collecting_context(call_spec(module, function, args));
        worker
            .shared()
            .enqueue(WorkerCommand::Run(Arc::new(Task::Call(CallTask {
                context,
            }))))
            .unwrap();
        slot
    }

    type CallContextSlot = Arc<Mutex<Option<crate::error::TaskResult>>>;

    #[test]
    fn test_tasks_execute_in_submission_order() {
        let factory = MockFactory::default();
        let sink = factory.sink.clone();
        let settings = ZoneSettings::new("w-fifo", 1);
        let (mut worker, _idle) = spawn_worker(factory, &settings);

        for i in 0..10 {
            run_call(&worker, "test", "append", i.to_string().as_bytes());
        }

        thread::sleep(Duration::from_millis(100));
        let appended: Vec<String> = sink.lock().unwrap().iter().map(|(_, s)| s.clone()).collect();
        assert_eq!(
            appended,
            (0..10).map(|i| i.to_string()).collect::<Vec<_>>()
        );

        worker.request_quit();
        worker.join();
        assert!(worker.shared().is_stopped());
    }

    #[test]
    fn test_quit_drains_pending_tasks_with_terminated() {
        let factory = MockFactory::default();
        let settings = ZoneSettings::new("w-drain", 1);
        let (mut worker, _idle) = spawn_worker(factory, &settings);

        // Hold the worker busy so the following tasks stay queued.
        let spinning = run_call(&worker, "test", "spin", b"120");
        let queued_a = run_call(&worker, "test", "echo", b"a");
        let queued_b = run_call(&worker, "test", "echo", b"b");
        // Let the worker pick up the spin before the quit sentinel jumps
        // the queue.
        thread::sleep(Duration::from_millis(40));

        worker.request_quit();
        worker.join();

        assert_eq!(
            spinning.lock().unwrap().take().unwrap().code,
            ResultCode::Success
        );
        assert_eq!(
            queued_a.lock().unwrap().take().unwrap().code,
            ResultCode::Terminated
        );
        assert_eq!(
            queued_b.lock().unwrap().take().unwrap().code,
            ResultCode::Terminated
        );
    }

    #[test]
    fn test_enqueue_rejected_after_quit() {
        let factory = MockFactory::default();
        let settings = ZoneSettings::new("w-reject", 1);
        let (mut worker, _idle) = spawn_worker(factory, &settings);

        worker.request_quit();
        let (context, _slot) = collecting_context(call_spec("test", "echo", b""));
        let err = worker
            .shared()
            .enqueue(WorkerCommand::Run(Arc::new(Task::Call(CallTask {
                context,
            }))))
            .unwrap_err();
        assert!(matches!(err, ZoneError::Terminated));
        worker.join();
    }

    #[test]
    fn test_bounded_queue_reports_full() {
        let factory = MockFactory::default();
        let settings = ZoneSettings::new("w-bound", 1).with_max_queue_depth(2);
        let (mut worker, _idle) = spawn_worker(factory, &settings);

        // Busy worker; two slots fill, the third submission fails.
        let _spinning = run_call(&worker, "test", "spin", b"200");
        thread::sleep(Duration::from_millis(40));
        run_call(&worker, "test", "echo", b"1");
        run_call(&worker, "test", "echo", b"2");

        let (context, _slot) = collecting_context(call_spec("test", "echo", b"3"));
        let err = worker
            .shared()
            .enqueue(WorkerCommand::Run(Arc::new(Task::Call(CallTask {
                context,
            }))))
            .unwrap_err();
        assert!(matches!(err, ZoneError::QueueFull { worker: 0 }));

        worker.request_quit();
        worker.join();
    }

    #[test]
    fn test_idle_worker_reports_once() {
        let factory = MockFactory::default();
        let settings = ZoneSettings::new("w-idle", 1);
        let (mut worker, idle) = spawn_worker(factory, &settings);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(idle.pop(), Some(0));
        // Reported at most once while it stays idle.
        assert_eq!(idle.pop(), None);
        assert!(worker.shared().is_idle());

        worker.request_quit();
        worker.join();
    }

    #[test]
    fn test_pending_event_loop_work_completes_between_tasks() {
        let factory = MockFactory::default();
        let settings = ZoneSettings::new("w-pump", 1);
        let (mut worker, _idle) = spawn_worker(factory, &settings);

        // Promise-like call: execute returns immediately, completion comes
        // from a later event-loop pump.
        let sleeping = run_call(&worker, "test", "sleep", b"30");
        // The worker is not starved by an immediately queued task.
        let echoed = run_call(&worker, "test", "echo", b"x");

        thread::sleep(Duration::from_millis(120));
        assert_eq!(
            echoed.lock().unwrap().take().unwrap().code,
            ResultCode::Success
        );
        assert_eq!(
            sleeping.lock().unwrap().take().unwrap().code,
            ResultCode::Success
        );

        worker.request_quit();
        worker.join();
    }

    #[test]
    fn test_worker_context_installed_before_engine_creation() {
        struct ContextProbe {
            seen: Arc<Mutex<Option<WorkerContext>>>,
            inner: MockFactory,
        }
        impl EngineFactory for ContextProbe {
            fn create_engine(
                &self,
                settings: &ZoneSettings,
                worker: WorkerId,
            ) -> Result<Box<dyn WorkerEngine>, EngineError> {
                *self.seen.lock().unwrap() = current_worker();
                self.inner.create_engine(settings, worker)
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let probe = ContextProbe {
            seen: seen.clone(),
            inner: MockFactory::default(),
        };
        let settings = ZoneSettings::new("w-tls", 1);
        let idle = Arc::new(IdleQueue::new());
        let (ready_tx, ready_rx) = mpsc::channel();
        let mut worker = Worker::spawn(&settings, 0, Arc::new(probe), idle, ready_tx);
        ready_rx.recv().unwrap().1.unwrap();

        let context = seen.lock().unwrap().clone().expect("context installed");
        assert_eq!(context.zone_id, "w-tls");
        assert_eq!(context.worker_id, 0);
        // The submitting thread is not a worker.
        assert!(current_worker().is_none());

        worker.request_quit();
        worker.join();
    }

    #[test]
    fn test_engine_creation_failure_reported() {
        let factory = MockFactory {
            fail_engine_on: Some(0),
            ..MockFactory::default()
        };
        let settings = ZoneSettings::new("w-fail", 1);
        let idle = Arc::new(IdleQueue::new());
        let (ready_tx, ready_rx) = mpsc::channel();
        let mut worker = Worker::spawn(&settings, 0, Arc::new(factory), idle, ready_tx);

        let (id, outcome) = ready_rx.recv().unwrap();
        assert_eq!(id, 0);
        assert!(outcome.is_err());
        worker.join();
        assert!(worker.shared().is_stopped());
    }
}
