// SPDX-License-Identifier: PMPL-1.0-or-later
//! Task schedulers for store mutations.
//!
//! Without a scheduler every store mutation runs inline. A scheduler lets the
//! embedder batch or defer that work; tasks it has not yet run can be
//! cancelled by token.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Handle for cancelling a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancelToken(u64);

impl CancelToken {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

pub trait TaskScheduler: Send + Sync {
    /// Queue `task`. It may run before this returns.
    fn schedule(&self, task: Task) -> CancelToken;

    /// Drop a task that has not run yet. Unknown tokens are ignored.
    fn cancel(&self, token: CancelToken);
}

/// Runs each task as soon as it is scheduled.
#[derive(Debug, Default)]
pub struct ImmediateScheduler {
    next_token: AtomicU64,
}

impl ImmediateScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskScheduler for ImmediateScheduler {
    fn schedule(&self, task: Task) -> CancelToken {
        let token = CancelToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        task();
        token
    }

    fn cancel(&self, _token: CancelToken) {}
}

/// FIFO queue drained on demand with `run_pending`.
#[derive(Default)]
pub struct QueuedScheduler {
    next_token: AtomicU64,
    queue: Mutex<VecDeque<(CancelToken, Task)>>,
}

impl QueuedScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run queued tasks in order, including tasks they schedule. Returns the
    /// number of tasks run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        // The lock is released before each task runs: tasks may schedule more.
        while let Some((_, task)) = self.queue.lock().pop_front() {
            task();
            ran += 1;
        }
        ran
    }
}

impl TaskScheduler for QueuedScheduler {
    fn schedule(&self, task: Task) -> CancelToken {
        let token = CancelToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.queue.lock().push_back((token, task));
        token
    }

    fn cancel(&self, token: CancelToken) {
        self.queue.lock().retain(|(queued, _)| *queued != token);
    }
}

impl fmt::Debug for QueuedScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counting_task(count: &Arc<AtomicUsize>) -> Task {
        let count = Arc::clone(count);
        Box::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_immediate_runs_inline() {
        let count = Arc::new(AtomicUsize::new(0));
        ImmediateScheduler::new().schedule(counting_task(&count));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_queued_runs_on_demand_and_cancels() {
        let count = Arc::new(AtomicUsize::new(0));
        let scheduler = QueuedScheduler::new();
        scheduler.schedule(counting_task(&count));
        let cancelled = scheduler.schedule(counting_task(&count));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        scheduler.cancel(cancelled);
        assert_eq!(scheduler.run_pending(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
    }
}
