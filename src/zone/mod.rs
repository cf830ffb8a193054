//! Zones: named, reference-counted groups of worker VMs sharing settings.
//!
//! A zone owns a scheduler over a fixed pool of single-threaded workers.
//! Zones are created through the process-wide registry and looked up by
//! id; an entry holds only a weak reference, so a zone dies when the last
//! external handle drops and its slot is reaped on the next lookup.

mod call_context;
mod scheduler;
mod settings;
mod task;
pub(crate) mod timer;
mod worker;

pub use call_context::{CallContext, CallOptions, FunctionSpec};
pub use settings::{WorkerId, ZoneSettings};
pub use worker::{current_worker, WorkerContext};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::engine::EngineFactory;
use crate::error::{TaskResult, ZoneError, ZoneResult};
use scheduler::Scheduler;
use task::{CallTask, EvalCallback, EvalTask, Task, TimeoutTask};

static REGISTRY: Lazy<Mutex<HashMap<String, Weak<Zone>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn registry() -> std::sync::MutexGuard<'static, HashMap<String, Weak<Zone>>> {
    // A fatal bootstrap panics while the lock is held; the map is never
    // left mid-mutation, so recover the guard instead of propagating
    // poison.
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A named group of worker VMs with attached settings.
pub struct Zone {
    settings: ZoneSettings,
    scheduler: Scheduler,
}

impl Zone {
    /// Create a zone and register it under `settings.id`.
    ///
    /// Spawns and readies every worker, then synchronously evaluates the
    /// bootstrap script (from the settings or the factory) on all of them
    /// and blocks until each acknowledges. After `create` returns, every
    /// worker has a fully initialized engine.
    ///
    /// # Panics
    ///
    /// Panics if the bootstrap evaluation fails on any worker; a zone
    /// that cannot bootstrap is unusable.
    pub fn create(
        settings: ZoneSettings,
        factory: Arc<dyn EngineFactory>,
    ) -> ZoneResult<Arc<Zone>> {
        let mut zones = registry();

        if let Some(existing) = zones.get(&settings.id) {
            if existing.strong_count() > 0 {
                tracing::debug!(zone = %settings.id, "zone id already live");
                return Err(ZoneError::AlreadyExists {
                    id: settings.id.clone(),
                });
            }
        }

        let scheduler = Scheduler::new(&settings, factory.clone())?;
        let zone = Arc::new(Zone {
            settings,
            scheduler,
        });

        let bootstrap = zone
            .settings
            .bootstrap_script
            .clone()
            .or_else(|| factory.bootstrap_source());
        if let Some(source) = bootstrap {
            zone.run_bootstrap(source);
        }

        zones.insert(zone.settings.id.clone(), Arc::downgrade(&zone));
        tracing::debug!(zone = %zone.settings.id, workers = zone.settings.workers, "zone created");
        Ok(zone)
    }

    /// Look up a live zone by id, reaping the slot if the zone is gone.
    pub fn get(id: &str) -> Option<Arc<Zone>> {
        let mut zones = registry();
        match zones.get(id) {
            Some(weak) => match weak.upgrade() {
                Some(zone) => Some(zone),
                None => {
                    tracing::warn!(zone = id, "zone already destroyed; reaping registry entry");
                    zones.remove(id);
                    None
                }
            },
            None => None,
        }
    }

    pub fn id(&self) -> &str {
        &self.settings.id
    }

    pub fn settings(&self) -> &ZoneSettings {
        &self.settings
    }

    /// Dispatch a function call to some scheduler-chosen worker. The
    /// callback fires exactly once, from whichever thread completes the
    /// call (worker or timeout watchdog).
    pub fn execute(
        &self,
        spec: FunctionSpec,
        callback: impl FnOnce(TaskResult) + Send + 'static,
    ) -> ZoneResult<()> {
        tracing::debug!(
            zone = %self.settings.id,
            module = %spec.module,
            function = %spec.function,
            "execute"
        );
        self.scheduler.schedule(build_call_task(spec, callback))
    }

    /// Blocking variant of [`execute`](Zone::execute).
    pub fn execute_sync(&self, spec: FunctionSpec) -> ZoneResult<TaskResult> {
        let (tx, rx) = mpsc::channel();
        self.execute(spec, move |result| {
            let _ = tx.send(result);
        })?;
        rx.recv().map_err(|_| ZoneError::Terminated)
    }

    /// Dispatch the same function call to every worker. The callback
    /// fires once, with the result of the last worker to complete.
    pub fn broadcast(
        &self,
        spec: FunctionSpec,
        callback: impl FnOnce(TaskResult) + Send + 'static,
    ) -> ZoneResult<()> {
        tracing::debug!(
            zone = %self.settings.id,
            module = %spec.module,
            function = %spec.function,
            "broadcast"
        );
        let workers = self.settings.workers;
        let (counter, slot) = broadcast_completion(workers, callback);

        for id in 0..workers {
            let share_counter = counter.clone();
            let share_slot = slot.clone();
            let task = build_call_task(spec.clone(), move |result| {
                complete_share(&share_counter, &share_slot, 1, result);
            });
            if let Err(err) = self.scheduler.schedule_on_worker(id, task) {
                // Fold the unscheduled remainder into the counter so the
                // callback still fires exactly once.
                let failure = TaskResult::error(err.code(), err.to_string());
                complete_share(&counter, &slot, workers - id, failure);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Evaluate script source on every worker (shared task, one execution
    /// per worker). The callback fires once, last writer wins.
    pub fn broadcast_script(
        &self,
        source: impl Into<String>,
        callback: impl FnOnce(TaskResult) + Send + 'static,
    ) -> ZoneResult<()> {
        let workers = self.settings.workers;
        let (counter, slot) = broadcast_completion(workers, callback);

        let (eval_counter, eval_slot) = (counter.clone(), slot.clone());
        let eval_callback: EvalCallback = Arc::new(move |result: TaskResult| {
            complete_share(&eval_counter, &eval_slot, 1, result);
        });
        let task = Arc::new(Task::Eval(EvalTask {
            source: source.into(),
            origin: "<broadcast>".into(),
            callback: eval_callback,
        }));

        match self.scheduler.schedule_on_all_workers(task) {
            Ok(()) => Ok(()),
            Err(partial) => {
                let failure = TaskResult::error(partial.error.code(), partial.error.to_string());
                complete_share(&counter, &slot, workers - partial.scheduled, failure);
                Err(partial.error)
            }
        }
    }

    /// Synchronous bootstrap barrier: one shared eval task over all
    /// workers, completion counted down to a blocking channel.
    fn run_bootstrap(&self, source: String) {
        let workers = self.settings.workers;
        let (done_tx, done_rx) = mpsc::channel();
        let counter = Arc::new(AtomicUsize::new(workers));
        let failure: Arc<Mutex<Option<TaskResult>>> = Arc::new(Mutex::new(None));

        let callback: EvalCallback = Arc::new(move |result: TaskResult| {
            if !result.is_success() {
                let mut first = failure.lock().unwrap();
                if first.is_none() {
                    *first = Some(result.clone());
                }
            }
            if counter.fetch_sub(1, Ordering::AcqRel) == 1 {
                let outcome = failure.lock().unwrap().take().unwrap_or(result);
                let _ = done_tx.send(outcome);
            }
        });

        let task = Arc::new(Task::Eval(EvalTask {
            source,
            origin: "<bootstrap>".into(),
            callback,
        }));
        self.scheduler
            .schedule_on_all_workers(task)
            .unwrap_or_else(|err| {
                panic!(
                    "failed to schedule bootstrap on zone '{}': {err}",
                    self.settings.id
                )
            });

        let outcome = done_rx
            .recv()
            .expect("bootstrap completion channel closed");
        assert!(
            outcome.is_success(),
            "bootstrap failed on zone '{}': {}",
            self.settings.id,
            outcome.error_message
        );
        tracing::debug!(zone = %self.settings.id, "bootstrap completed on all workers");
    }
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("id", &self.settings.id)
            .field("workers", &self.settings.workers)
            .finish()
    }
}

type SharedCallback = Arc<Mutex<Option<Box<dyn FnOnce(TaskResult) + Send>>>>;

fn broadcast_completion(
    workers: usize,
    callback: impl FnOnce(TaskResult) + Send + 'static,
) -> (Arc<AtomicUsize>, SharedCallback) {
    let callback: Box<dyn FnOnce(TaskResult) + Send> = Box::new(callback);
    (
        Arc::new(AtomicUsize::new(workers)),
        Arc::new(Mutex::new(Some(callback))),
    )
}

/// Count down `shares` completions; whoever brings the counter to zero
/// runs the user callback with its result (last writer wins).
fn complete_share(
    counter: &AtomicUsize,
    slot: &SharedCallback,
    shares: usize,
    result: TaskResult,
) {
    if counter.fetch_sub(shares, Ordering::AcqRel) == shares {
        if let Some(callback) = slot.lock().unwrap().take() {
            callback(result);
        }
    }
}

fn build_call_task(
    spec: FunctionSpec,
    callback: impl FnOnce(TaskResult) + Send + 'static,
) -> Task {
    let timeout_ms = spec.options.timeout_ms;
    let call = CallTask {
        context: CallContext::new(spec, callback),
    };
    if timeout_ms > 0 {
        Task::Timeout(TimeoutTask {
            inner: call,
            timeout: Duration::from_millis(u64::from(timeout_ms)),
        })
    } else {
        Task::Call(call)
    }
}
