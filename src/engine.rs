//! Capability interface consumed from the JavaScript engine collaborator.
//!
//! The scheduler core never links an engine. Each worker thread asks an
//! [`EngineFactory`] for one [`WorkerEngine`] at startup and drives it
//! through three operations: evaluate source text, invoke a function by
//! spec, and pump the engine's own event loop. Everything else about the
//! embedding (isolate creation, module loading, value marshalling) stays
//! behind this seam.

use crate::zone::{CallContext, WorkerId, ZoneSettings};

/// Engine construction failure, reported through the worker readiness
/// channel and surfaced from `Zone::create`.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Compilation or first-turn exception from [`WorkerEngine::evaluate`].
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct EvalError {
    /// Textual form of the exception.
    pub message: String,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure to resolve a function spec on the worker's module registry.
#[derive(Debug, thiserror::Error)]
pub enum FunctionResolveError {
    #[error("module '{module}' not found")]
    ModuleNotFound { module: String },

    #[error("function '{function}' not found in module '{module}'")]
    FunctionNotFound { module: String, function: String },
}

/// Outcome of one event-loop pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLoopPump {
    /// More engine work (microtasks, timers, pending promises) remains;
    /// the worker should pump again soon.
    Pending,
    /// The event loop is drained; nothing will become ready without a new
    /// task.
    Quiescent,
}

/// One JavaScript engine instance, owned by exactly one worker thread.
///
/// Implementations are created on the worker's own thread (isolate
/// affinity) and are never touched by any other thread, so the trait does
/// not require `Send`.
pub trait WorkerEngine {
    /// Compile and run `source` under `origin` on this worker's isolate.
    ///
    /// Returns `Err` on a compilation failure or an exception thrown in
    /// the script's first synchronous turn. Asynchronous continuations the
    /// script schedules are driven later via [`pump_event_loop`].
    ///
    /// [`pump_event_loop`]: WorkerEngine::pump_event_loop
    fn evaluate(&mut self, source: &str, origin: &str) -> Result<(), EvalError>;

    /// Resolve `context.spec` on the module registry, unmarshall the
    /// argument payload, and invoke the function.
    ///
    /// On `Ok`, the engine has taken responsibility for resolving the
    /// context exactly once: synchronously for a plain return, or from a
    /// later event-loop turn when the call returned a promise-like. On
    /// `Err`, the context has not been touched and the caller resolves it.
    fn call_function(&mut self, context: &CallContext) -> Result<(), FunctionResolveError>;

    /// Advance pending microtasks and expired engine timers by one step.
    fn pump_event_loop(&mut self) -> EventLoopPump;
}

/// Creates one engine per worker, on the worker's thread.
pub trait EngineFactory: Send + Sync + 'static {
    /// Build the engine for `worker`. Invoked from the worker's own OS
    /// thread after the thread-local worker context is installed.
    fn create_engine(
        &self,
        settings: &ZoneSettings,
        worker: WorkerId,
    ) -> Result<Box<dyn WorkerEngine>, EngineError>;

    /// Source evaluated on every worker during the zone's bootstrap
    /// barrier when `ZoneSettings::bootstrap_script` is unset.
    fn bootstrap_source(&self) -> Option<String> {
        None
    }
}
