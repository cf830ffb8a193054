//! Units of work executed on worker threads.
//!
//! A task runs via `execute` on the consuming worker's thread, never
//! unwinds across that boundary, and reports its outcome through the
//! completion it carries. A task is complete when its completion fires,
//! which for promise-like calls happens after `execute` has already
//! returned control to the worker loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::engine::{FunctionResolveError, WorkerEngine};
use crate::error::{ResultCode, TaskResult};
use crate::zone::call_context::CallContext;
use crate::zone::timer;
use crate::zone::WorkerId;

/// Worker-side view handed to an executing task.
pub(crate) struct WorkerScope<'a> {
    pub(crate) engine: &'a mut dyn WorkerEngine,
    pub(crate) worker_id: WorkerId,
    pub(crate) zone_id: &'a str,
}

/// Callback type for script evaluations. A broadcast-shared eval task
/// executes once per worker, so the callback is `Fn`, invoked per
/// execution; once-semantics across the fan-out belong to the caller's
/// completion counter.
pub(crate) type EvalCallback = Arc<dyn Fn(TaskResult) + Send + Sync>;

pub(crate) enum Task {
    Eval(EvalTask),
    Call(CallTask),
    Timeout(TimeoutTask),
}

pub(crate) struct EvalTask {
    pub source: String,
    pub origin: String,
    pub callback: EvalCallback,
}

pub(crate) struct CallTask {
    pub context: CallContext,
}

/// Timeout decoration applies to call tasks only: their single-shot
/// completion makes a racing timer provably fire-once, and lets an early
/// completion disarm it. Eval tasks are broadcast-shared with a per-worker
/// `Fn` callback, which has no such state, so the type does not admit
/// decorating them.
pub(crate) struct TimeoutTask {
    pub inner: CallTask,
    pub timeout: Duration,
}

impl Task {
    pub fn execute(&self, scope: &mut WorkerScope<'_>) {
        match self {
            Task::Eval(task) => task.execute(scope),
            Task::Call(task) => task.execute(scope),
            Task::Timeout(task) => task.execute(scope),
        }
    }

    /// Resolve the task's completion with `Terminated`; used when a
    /// worker drains its queue during shutdown.
    pub fn resolve_terminated(&self) {
        match self {
            Task::Eval(task) => (task.callback)(TaskResult::terminated()),
            Task::Call(task) => {
                task.context.resolve(TaskResult::terminated());
            }
            Task::Timeout(task) => {
                task.inner.context.resolve(TaskResult::terminated());
            }
        }
    }
}

impl EvalTask {
    fn execute(&self, scope: &mut WorkerScope<'_>) {
        match scope.engine.evaluate(&self.source, &self.origin) {
            Ok(()) => (self.callback)(TaskResult::success(Bytes::new())),
            Err(err) => {
                tracing::debug!(
                    zone = scope.zone_id,
                    worker = scope.worker_id,
                    origin = %self.origin,
                    error = %err.message,
                    "script evaluation failed"
                );
                (self.callback)(TaskResult::error(
                    ResultCode::BroadcastScriptError,
                    err.message,
                ));
            }
        }
    }
}

impl CallTask {
    fn execute(&self, scope: &mut WorkerScope<'_>) {
        // On Ok the engine has taken over resolution, synchronously or
        // from a later event-loop turn.
        if let Err(err) = scope.engine.call_function(&self.context) {
            let code = match &err {
                FunctionResolveError::ModuleNotFound { .. } => ResultCode::ModuleNotFound,
                FunctionResolveError::FunctionNotFound { .. } => ResultCode::FunctionNotFound,
            };
            tracing::debug!(
                zone = scope.zone_id,
                worker = scope.worker_id,
                module = %self.context.spec().module,
                function = %self.context.spec().function,
                "function resolution failed"
            );
            self.context.resolve(TaskResult::error(code, err.to_string()));
        }
    }
}

impl TimeoutTask {
    fn execute(&self, scope: &mut WorkerScope<'_>) {
        let timeout_ms = self.timeout.as_millis().min(u32::MAX as u128) as u32;
        let context = self.inner.context.clone();
        let handle = timer::global().schedule(
            Instant::now() + self.timeout,
            Box::new(move || {
                context.resolve(TaskResult::timeout(timeout_ms));
            }),
        );
        // An early completion disarms the timer through the context.
        self.inner.context.arm_timer(handle);
        self.inner.execute(scope);
    }
}
