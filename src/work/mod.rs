//! Work queues: deferred execution in a dedicated worker thread.
//!
//! A work item is a reusable handler with an at-most-once pending flag:
//! submitting an already-queued item is a no-op, so a burst of submissions
//! produces exactly one execution. Cancellation follows the return-busy
//! contract: a queued item is removed and cancelled, an item whose handler
//! is already running reports [`SchedError::Busy`] instead of blocking the
//! canceller behind a possibly lower-priority worker.

use crate::arch::Arch;
use crate::errors::{SchedError, SchedResult, SpawnError};
use crate::kernel::Kernel;
use crate::sync::{Semaphore, WaitPrimitive};
use crate::thread::{JoinHandle, ThreadBuilder};
use crate::time::Timeout;
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use portable_atomic::{AtomicU64, AtomicU8, Ordering};

/// Work item life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkState {
    /// Not submitted anywhere.
    Idle = 0,
    /// In a queue's FIFO awaiting the worker.
    Queued = 1,
    /// Handler currently executing.
    Running = 2,
    /// Removed from the FIFO by a cancel; may be resubmitted.
    Cancelled = 3,
}

impl WorkState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkState::Idle,
            1 => WorkState::Queued,
            2 => WorkState::Running,
            3 => WorkState::Cancelled,
            _ => unreachable!("invalid work state {}", v),
        }
    }
}

/// A deferred unit of work: a handler plus its pending flag.
pub struct WorkItem {
    state: AtomicU8,
    handler: Box<dyn Fn() + Send + Sync>,
}

impl WorkItem {
    /// Create a work item around `handler`. The handle is shared: the
    /// caller keeps one clone embedded in its own structures and passes it
    /// to [`WorkQueue::submit`].
    pub fn new<F>(handler: F) -> Arc<WorkItem>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(WorkItem {
            state: AtomicU8::new(WorkState::Idle as u8),
            handler: Box::new(handler),
        })
    }

    /// Current life-cycle state.
    pub fn state(&self) -> WorkState {
        WorkState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn try_transition(&self, from: WorkState, to: WorkState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct WorkQueueInner {
    fifo: spin::Mutex<VecDeque<Arc<WorkItem>>>,
    pending: Semaphore,
    items_run: AtomicU64,
}

impl WorkQueueInner {
    fn process_one<A: Arch>(&self, kernel: &Kernel<A>, timeout: Timeout) -> bool {
        if self.pending.take(kernel, timeout).is_err() {
            return false;
        }
        let item = self.fifo.lock().pop_front();
        let item = match item {
            // A cancel raced ahead of us and emptied the FIFO.
            None => return false,
            Some(item) => item,
        };
        if !item.try_transition(WorkState::Queued, WorkState::Running) {
            // Cancelled between pop and execution.
            return false;
        }
        (item.handler)();
        item.state.store(WorkState::Idle as u8, Ordering::Release);
        self.items_run.fetch_add(1, Ordering::AcqRel);
        true
    }
}

/// A FIFO of work items drained by one dedicated worker thread.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<WorkQueueInner>,
}

impl WorkQueue {
    /// Create a work queue. Call [`start`](Self::start) to spawn its worker.
    pub fn new<A: Arch>(kernel: &Kernel<A>) -> Self {
        Self {
            inner: Arc::new(WorkQueueInner {
                fifo: spin::Mutex::new(VecDeque::new()),
                pending: Semaphore::new(kernel, 0, u32::MAX),
                items_run: AtomicU64::new(0),
            }),
        }
    }

    /// Spawn the dedicated worker thread. Its body blocks on an empty
    /// queue, runs one handler at a time, and yields between items so a
    /// long backlog cannot starve equal-priority threads.
    pub fn start<A: Arch>(
        &self,
        kernel: &'static Kernel<A>,
        builder: ThreadBuilder,
    ) -> Result<JoinHandle, SpawnError> {
        let inner = self.inner.clone();
        kernel.spawn_with(builder, move || loop {
            inner.process_one(kernel, Timeout::Forever);
            kernel.yield_now();
        })
    }

    /// Queue `item` for execution. Returns `false` without queuing if the
    /// item is already pending (at-most-once enqueue).
    pub fn submit<A: Arch>(&self, kernel: &Kernel<A>, item: &Arc<WorkItem>) -> bool {
        let claimed = item.try_transition(WorkState::Idle, WorkState::Queued)
            || item.try_transition(WorkState::Cancelled, WorkState::Queued);
        if !claimed {
            return false;
        }
        self.inner.fifo.lock().push_back(item.clone());
        log::trace!("work item submitted");
        // The counter tracks FIFO occupancy; memory runs out before the
        // semaphore limit can.
        let _ = self.inner.pending.give(kernel);
        true
    }

    /// Cancel `item`. A queued item is removed and reports `Ok`; an item
    /// whose handler is running reports [`SchedError::Busy`]. Cancelling
    /// an idle item is a no-op.
    pub fn cancel(&self, item: &Arc<WorkItem>) -> SchedResult<()> {
        let mut fifo = self.inner.fifo.lock();
        match item.state() {
            WorkState::Queued => {
                if item.try_transition(WorkState::Queued, WorkState::Cancelled) {
                    if let Some(pos) = fifo.iter().position(|w| Arc::ptr_eq(w, item)) {
                        fifo.remove(pos);
                    }
                    Ok(())
                } else {
                    // The worker claimed it between our check and the swap.
                    Err(SchedError::Busy)
                }
            }
            WorkState::Running => Err(SchedError::Busy),
            WorkState::Idle | WorkState::Cancelled => Ok(()),
        }
    }

    /// Number of items currently queued.
    pub fn pending(&self) -> usize {
        self.inner.fifo.lock().len()
    }

    /// Total handlers executed by this queue.
    pub fn items_run(&self) -> u64 {
        self.inner.items_run.load(Ordering::Acquire)
    }

    /// Pop and run at most one item, blocking up to `timeout` for one to
    /// arrive. Returns whether a handler ran. This is the worker loop's
    /// body, exposed for harnesses that pump the queue without a worker
    /// thread.
    pub fn process_one<A: Arch>(&self, kernel: &Kernel<A>, timeout: Timeout) -> bool {
        self.inner.process_one(kernel, timeout)
    }
}
