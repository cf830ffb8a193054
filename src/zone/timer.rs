//! Process-wide timer thread backing the timeout decorators.
//!
//! One thread serves every zone in the process. Deadlines live in a
//! min-heap; cancellation is lazy (a cancelled id is skipped when its
//! entry surfaces), which keeps cancel O(1) and avoids removal from the
//! heap. Callbacks run on the timer thread and must stay short: their only
//! job is resolving a timed-out completion.

use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use once_cell::sync::Lazy;

static TIMER: Lazy<TimerThread> = Lazy::new(TimerThread::spawn);

/// The shared timer instance, started on first use and never joined.
pub(crate) fn global() -> &'static TimerThread {
    &TIMER
}

/// Identifies one scheduled deadline for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TimerHandle(u64);

type TimerCallback = Box<dyn FnOnce() + Send>;

struct TimerEntry {
    deadline: Instant,
    id: u64,
    callback: Option<TimerCallback>,
}

// Heap ordering ignores the callback: earliest deadline first, ties broken
// by insertion id for determinism.
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match other.deadline.cmp(&self.deadline) {
            std::cmp::Ordering::Equal => other.id.cmp(&self.id),
            ord => ord,
        }
    }
}

struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    /// Ids currently in the heap; an id leaves the set when popped or
    /// cancelled, so `cancelled` stays bounded by live entries.
    scheduled: HashSet<u64>,
    cancelled: HashSet<u64>,
    next_id: u64,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

pub(crate) struct TimerThread {
    shared: Arc<TimerShared>,
}

impl TimerThread {
    fn spawn() -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                scheduled: HashSet::new(),
                cancelled: HashSet::new(),
                next_id: 0,
            }),
            wakeup: Condvar::new(),
        });

        let thread_shared = shared.clone();
        thread::Builder::new()
            .name("jszone-timer".to_string())
            .spawn(move || run_timer_loop(thread_shared))
            .expect("failed to spawn timer thread");

        Self { shared }
    }

    /// Schedule `callback` to run at `deadline`.
    pub fn schedule(&self, deadline: Instant, callback: TimerCallback) -> TimerHandle {
        let mut state = self.shared.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.scheduled.insert(id);
        state.heap.push(TimerEntry {
            deadline,
            id,
            callback: Some(callback),
        });
        drop(state);
        // The new deadline may be earlier than what the thread sleeps on.
        self.shared.wakeup.notify_one();
        TimerHandle(id)
    }

    /// Cancel a scheduled deadline. Returns false if it already fired or
    /// was already cancelled.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if state.scheduled.remove(&handle.0) {
            state.cancelled.insert(handle.0);
            true
        } else {
            false
        }
    }

}

fn run_timer_loop(shared: Arc<TimerShared>) {
    let mut state = shared.state.lock().unwrap();
    loop {
        let now = Instant::now();
        let mut due: Vec<TimerCallback> = Vec::new();

        while let Some(entry) = state.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let mut entry = state.heap.pop().unwrap();
            state.scheduled.remove(&entry.id);
            if state.cancelled.remove(&entry.id) {
                continue;
            }
            if let Some(callback) = entry.callback.take() {
                due.push(callback);
            }
        }

        if !due.is_empty() {
            drop(state);
            tracing::debug!(fired = due.len(), "timer deadlines elapsed");
            for callback in due {
                callback();
            }
            state = shared.state.lock().unwrap();
            continue;
        }

        state = match state.heap.peek().map(|entry| entry.deadline) {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(now);
                shared.wakeup.wait_timeout(state, wait).unwrap().0
            }
            None => shared.wakeup.wait(state).unwrap(),
        };
    }
}
