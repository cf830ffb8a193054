//! Per-invocation state shared between the submitter, the executing
//! worker, and the timeout watchdog.
//!
//! Whoever reaches completion first wins: the completion state is a
//! compare-and-set on an atomic word, so the user callback fires exactly
//! once and later attempts become no-ops. Resolving also disarms any
//! pending timeout so the timer entry does not linger until its deadline.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::TaskResult;
use crate::transport::TransportContext;
use crate::zone::timer::{self, TimerHandle};

/// Names the JavaScript function to invoke, with marshalled arguments.
#[derive(Debug, Clone)]
pub struct FunctionSpec {
    /// Module name resolved on the worker's module registry.
    pub module: String,
    /// Exported function name within the module.
    pub function: String,
    /// Opaque marshalled argument payload.
    pub arguments: Bytes,
    pub options: CallOptions,
}

impl FunctionSpec {
    pub fn new(module: impl Into<String>, function: impl Into<String>, arguments: Bytes) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            arguments,
            options: CallOptions::default(),
        }
    }

    /// Set the call timeout in milliseconds (0 disables).
    pub fn with_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.options.timeout_ms = timeout_ms;
        self
    }

    /// Attach the transport context handed through to the codec.
    pub fn with_transport_context(mut self, context: TransportContext) -> Self {
        self.options.transport_context = Some(context);
        self
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Milliseconds before the call resolves with a timeout; 0 disables.
    pub timeout_ms: u32,
    /// Opaque handle forwarded to the marshalling collaborator.
    pub transport_context: Option<TransportContext>,
}

const COMPLETION_PENDING: u8 = 0;
const COMPLETION_RESOLVED: u8 = 1;

type CompletionCallback = Box<dyn FnOnce(TaskResult) + Send>;

/// Single-shot completion state: CAS word, callback slot, armed timer.
struct Completion {
    state: AtomicU8,
    callback: Mutex<Option<CompletionCallback>>,
    armed_timer: Mutex<Option<TimerHandle>>,
}

impl Completion {
    fn new(callback: CompletionCallback) -> Self {
        Self {
            state: AtomicU8::new(COMPLETION_PENDING),
            callback: Mutex::new(Some(callback)),
            armed_timer: Mutex::new(None),
        }
    }

    fn resolve(&self, result: TaskResult) -> bool {
        if self
            .state
            .compare_exchange(
                COMPLETION_PENDING,
                COMPLETION_RESOLVED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            tracing::debug!(code = %result.code, "late completion discarded");
            return false;
        }

        if let Some(handle) = self.armed_timer.lock().unwrap().take() {
            timer::global().cancel(handle);
        }

        let callback = self
            .callback
            .lock()
            .unwrap()
            .take()
            .expect("completion callback taken without winning the state race");
        callback(result);
        true
    }

    fn is_resolved(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETION_RESOLVED
    }

    fn arm_timer(&self, handle: TimerHandle) {
        *self.armed_timer.lock().unwrap() = Some(handle);
        // The race where resolution lands between scheduling the timer and
        // storing the handle would leave the entry armed forever; re-check.
        if self.is_resolved() {
            if let Some(handle) = self.armed_timer.lock().unwrap().take() {
                timer::global().cancel(handle);
            }
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.is_resolved() && self.callback.get_mut().unwrap().is_some() {
            tracing::warn!("call completion dropped without resolving");
        }
    }
}

/// Shared per-invocation state: immutable spec plus single-shot completion.
///
/// Cloning is cheap and shares the completion state; any clone may resolve,
/// and exactly one resolution wins.
#[derive(Clone)]
pub struct CallContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    spec: FunctionSpec,
    completion: Completion,
}

impl CallContext {
    pub fn new(spec: FunctionSpec, callback: impl FnOnce(TaskResult) + Send + 'static) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                spec,
                completion: Completion::new(Box::new(callback)),
            }),
        }
    }

    pub fn spec(&self) -> &FunctionSpec {
        &self.inner.spec
    }

    /// Complete the invocation. The first caller wins and runs the user
    /// callback on its own thread; later calls return false and do nothing.
    pub fn resolve(&self, result: TaskResult) -> bool {
        self.inner.completion.resolve(result)
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.completion.is_resolved()
    }

    /// Register the timeout armed for this invocation so an early
    /// completion cancels it.
    pub(crate) fn arm_timer(&self, handle: TimerHandle) {
        self.inner.completion.arm_timer(handle);
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("module", &self.inner.spec.module)
            .field("function", &self.inner.spec.function)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultCode;
    use crate::test_util::call_spec;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn counting_context(spec: FunctionSpec) -> (CallContext, Arc<AtomicUsize>, Arc<Mutex<Option<TaskResult>>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let slot = Arc::new(Mutex::new(None));
        let (counted, stored) = (count.clone(), slot.clone());
        let context = CallContext::new(spec, move |result| {
            counted.fetch_add(1, Ordering::SeqCst);
            *stored.lock().unwrap() = Some(result);
        });
        (context, count, slot)
    }

    #[test]
    fn test_first_resolution_wins() {
        let (context, count, slot) = counting_context(call_spec("test", "echo", b""));

        assert!(context.resolve(TaskResult::success(Bytes::from_static(b"first"))));
        assert!(!context.resolve(TaskResult::timeout(10)));
        assert!(!context.resolve(TaskResult::terminated()));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let result = slot.lock().unwrap().take().unwrap();
        assert_eq!(result.code, ResultCode::Success);
        assert_eq!(&result.payload[..], b"first");
    }

    #[test]
    fn test_clones_share_completion() {
        let (context, count, _slot) = counting_context(call_spec("test", "echo", b""));
        let other = context.clone();

        assert!(other.resolve(TaskResult::success(Bytes::new())));
        assert!(context.is_resolved());
        assert!(!context.resolve(TaskResult::terminated()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resolution_races_from_two_threads() {
        for _ in 0..50 {
            let (context, count, _slot) = counting_context(call_spec("test", "echo", b""));
            let a = context.clone();
            let b = context.clone();
            let t1 = std::thread::spawn(move || a.resolve(TaskResult::success(Bytes::new())));
            let t2 = std::thread::spawn(move || b.resolve(TaskResult::timeout(1)));
            let won1 = t1.join().unwrap();
            let won2 = t2.join().unwrap();
            assert!(won1 ^ won2, "exactly one resolver must win");
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_resolve_cancels_armed_timer() {
        let (context, _count, _slot) = counting_context(call_spec("test", "echo", b""));

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_timer = fired.clone();
        let timer_context = context.clone();
        let handle = timer::global().schedule(
            Instant::now() + Duration::from_millis(40),
            Box::new(move || {
                fired_in_timer.fetch_add(1, Ordering::SeqCst);
                timer_context.resolve(TaskResult::timeout(40));
            }),
        );
        context.arm_timer(handle);

        assert!(context.resolve(TaskResult::success(Bytes::new())));
        std::thread::sleep(Duration::from_millis(90));
        assert_eq!(fired.load(Ordering::SeqCst), 0, "timer must be cancelled");
    }
}
