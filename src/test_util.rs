//! Shared helpers for the crate's tests.

use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::TaskResult;
use crate::zone::{CallContext, FunctionSpec};

pub(crate) type ResultSlot = Arc<Mutex<Option<TaskResult>>>;

/// A spec against the mock engine's `"test"` module (or any other).
pub(crate) fn call_spec(module: &str, function: &str, args: &[u8]) -> FunctionSpec {
    FunctionSpec::new(module, function, Bytes::copy_from_slice(args))
}

/// A call context whose result lands in the returned slot.
pub(crate) fn collecting_context(spec: FunctionSpec) -> (CallContext, ResultSlot) {
    let slot: ResultSlot = Arc::new(Mutex::new(None));
    let stored = slot.clone();
    let context = CallContext::new(spec, move |result| {
        *stored.lock().unwrap() = Some(result);
    });
    (context, slot)
}
