//! Error taxonomy for the zone-scheduler core.
//!
//! Two kinds of failure flow through the crate: synchronous submission-path
//! errors ([`ZoneError`]) returned directly to the caller, and task outcomes
//! ([`TaskResult`] carrying a [`ResultCode`]) delivered through completion
//! callbacks. Errors produced while a task runs never unwind through a
//! worker thread; they are captured into a `TaskResult`.

use bytes::Bytes;

use crate::engine::EngineError;
use crate::zone::WorkerId;

/// Outcome classification for a task or registry operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// The operation completed normally.
    Success,
    /// A zone with the requested id is already live.
    AlreadyExists,
    /// No live zone with the requested id.
    NotFound,
    /// The requested module could not be resolved on the worker.
    ModuleNotFound,
    /// The module resolved but does not export the requested function.
    FunctionNotFound,
    /// The JavaScript call threw; `error_message` carries the textual form.
    ExecutionError,
    /// A broadcast script failed to compile or threw in its first turn.
    BroadcastScriptError,
    /// The task's deadline elapsed before it completed.
    Timeout,
    /// The task was drained during zone shutdown without executing.
    Terminated,
    /// A scheduler invariant was violated; indicates a bug, not a runtime
    /// condition.
    InternalError,
}

impl ResultCode {
    /// Whether this code represents a successful outcome.
    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::Success)
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResultCode::Success => "success",
            ResultCode::AlreadyExists => "already_exists",
            ResultCode::NotFound => "not_found",
            ResultCode::ModuleNotFound => "module_not_found",
            ResultCode::FunctionNotFound => "function_not_found",
            ResultCode::ExecutionError => "execution_error",
            ResultCode::BroadcastScriptError => "broadcast_script_error",
            ResultCode::Timeout => "timeout",
            ResultCode::Terminated => "terminated",
            ResultCode::InternalError => "internal_error",
        };
        f.write_str(name)
    }
}

/// Result of a single task execution, delivered to the user callback.
///
/// On success `payload` holds the marshalled return value (possibly empty);
/// on failure `error_message` holds the textual form of the error.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub code: ResultCode,
    pub payload: Bytes,
    pub error_message: String,
}

impl TaskResult {
    /// Successful completion with a marshalled return payload.
    pub fn success(payload: Bytes) -> Self {
        Self {
            code: ResultCode::Success,
            payload,
            error_message: String::new(),
        }
    }

    /// Failed completion with the given code and error text.
    pub fn error(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            payload: Bytes::new(),
            error_message: message.into(),
        }
    }

    /// A task that exceeded its deadline.
    pub fn timeout(timeout_ms: u32) -> Self {
        Self::error(
            ResultCode::Timeout,
            format!("call exceeded timeout of {timeout_ms}ms"),
        )
    }

    /// A task drained during zone shutdown.
    pub fn terminated() -> Self {
        Self::error(ResultCode::Terminated, "zone is shutting down")
    }

    /// Whether the task completed successfully.
    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}

/// Synchronous submission-path error.
///
/// Everything that can go wrong before a task reaches a worker queue is
/// reported here; once a submission returns `Ok`, the outcome arrives
/// through the completion callback instead.
#[derive(Debug, thiserror::Error)]
pub enum ZoneError {
    #[error("a zone with id '{id}' already exists")]
    AlreadyExists { id: String },

    #[error("no zone with id '{id}'")]
    NotFound { id: String },

    #[error("worker {worker} task queue is full")]
    QueueFull { worker: WorkerId },

    #[error("no worker with id {worker}")]
    UnknownWorker { worker: WorkerId },

    #[error("zone is shutting down")]
    Terminated,

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

impl ZoneError {
    /// The `ResultCode` a host binary would map this error to.
    pub fn code(&self) -> ResultCode {
        match self {
            ZoneError::AlreadyExists { .. } => ResultCode::AlreadyExists,
            ZoneError::NotFound { .. } => ResultCode::NotFound,
            ZoneError::QueueFull { .. } | ZoneError::UnknownWorker { .. } => {
                ResultCode::InternalError
            }
            ZoneError::Terminated => ResultCode::Terminated,
            ZoneError::Engine(_) => ResultCode::InternalError,
        }
    }
}

/// Crate-wide result alias for submission-path operations.
pub type ZoneResult<T> = std::result::Result<T, ZoneError>;
