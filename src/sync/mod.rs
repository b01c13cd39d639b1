//! Synchronization primitives built on the scheduler's wait queues.
//!
//! Each primitive owns one wait queue and drives it through
//! `enter_wait`/`wake_one` under the scheduler lock, so the check-then-block
//! step is atomic with respect to concurrent gives and timeouts. Primitives
//! are expected to live as long as the kernel they were created against,
//! which is how RTOS synchronization objects are used in practice.

use crate::arch::Arch;
use crate::errors::{SchedError, SchedResult};
use crate::kernel::Kernel;
use crate::sched::{SchedulerState, WaitQueueId};
use crate::thread::Thread;
use crate::time::Timeout;
use portable_atomic::{AtomicU32, AtomicU64, Ordering};

/// Capability interface of a synchronization object: acquire with a
/// timeout, release waking a waiter.
pub trait WaitPrimitive {
    /// Acquire the resource, blocking up to `timeout`.
    fn take<A: Arch>(&self, kernel: &Kernel<A>, timeout: Timeout) -> SchedResult<()>;

    /// Release the resource, waking the best waiter if one exists.
    fn give<A: Arch>(&self, kernel: &Kernel<A>) -> SchedResult<()>;
}

/// Counting semaphore.
///
/// A give hands the token directly to the best waiter when one exists; the
/// count only grows while nobody is waiting.
pub struct Semaphore {
    queue: WaitQueueId,
    count: AtomicU32,
    limit: u32,
}

impl Semaphore {
    /// Create a semaphore with `initial` tokens and a maximum of `limit`.
    pub fn new<A: Arch>(kernel: &Kernel<A>, initial: u32, limit: u32) -> Self {
        assert!(limit >= 1, "semaphore limit must be at least one");
        assert!(initial <= limit, "initial count exceeds limit");
        Self {
            queue: kernel.create_wait_queue(),
            count: AtomicU32::new(initial),
            limit,
        }
    }

    /// Current token count.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }
}

impl WaitPrimitive for Semaphore {
    fn take<A: Arch>(&self, kernel: &Kernel<A>, timeout: Timeout) -> SchedResult<()> {
        let g = kernel.sched();
        // Plain loads/stores: the scheduler lock serializes all mutation.
        let count = self.count.load(Ordering::Relaxed);
        if count > 0 {
            self.count.store(count - 1, Ordering::Relaxed);
            return Ok(());
        }
        if timeout.is_no_wait() {
            return Err(SchedError::Busy);
        }
        kernel.block_current_on(g, self.queue, timeout)
    }

    fn give<A: Arch>(&self, kernel: &Kernel<A>) -> SchedResult<()> {
        let mut g = kernel.sched();
        if let Some((_, hint)) = g.wake_one(self.queue) {
            kernel.resched_after_wake(g, hint);
            return Ok(());
        }
        let count = self.count.load(Ordering::Relaxed);
        if count >= self.limit {
            return Err(SchedError::Busy);
        }
        self.count.store(count + 1, Ordering::Relaxed);
        Ok(())
    }
}

/// Ownership-tracked mutex with direct handoff.
///
/// Giving while a waiter exists transfers ownership to that waiter under
/// the scheduler lock; the lock is never observably free in between.
/// Recursive acquisition and release by a non-owner are rejected.
pub struct Mutex {
    queue: WaitQueueId,
    /// Raw id of the owning thread, 0 when free.
    owner: AtomicU64,
}

impl Mutex {
    /// Create an unowned mutex.
    pub fn new<A: Arch>(kernel: &Kernel<A>) -> Self {
        Self {
            queue: kernel.create_wait_queue(),
            owner: AtomicU64::new(0),
        }
    }

    /// Whether some thread currently owns the mutex.
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }

    /// Release under an already-held scheduler lock, handing ownership to
    /// the best waiter. Returns the woken waiter and its reschedule hint.
    fn give_locked(
        &self,
        sched: &mut SchedulerState,
        caller: u64,
    ) -> SchedResult<Option<(Thread, Option<usize>)>> {
        if caller == 0 || self.owner.load(Ordering::Relaxed) != caller {
            return Err(SchedError::InvalidState);
        }
        match sched.wake_one(self.queue) {
            Some((thread, hint)) => {
                self.owner.store(thread.id().raw(), Ordering::Relaxed);
                Ok(Some((thread, hint)))
            }
            None => {
                self.owner.store(0, Ordering::Relaxed);
                Ok(None)
            }
        }
    }
}

impl WaitPrimitive for Mutex {
    fn take<A: Arch>(&self, kernel: &Kernel<A>, timeout: Timeout) -> SchedResult<()> {
        let caller = kernel.current_thread_id();
        if caller == 0 {
            panic!("mutex operations require a running thread");
        }
        let g = kernel.sched();
        let owner = self.owner.load(Ordering::Relaxed);
        if owner == 0 {
            self.owner.store(caller, Ordering::Relaxed);
            return Ok(());
        }
        if owner == caller {
            // Recursive acquisition would self-deadlock.
            return Err(SchedError::InvalidState);
        }
        if timeout.is_no_wait() {
            return Err(SchedError::Busy);
        }
        // Ownership is assigned by the giver before we are woken.
        kernel.block_current_on(g, self.queue, timeout)
    }

    fn give<A: Arch>(&self, kernel: &Kernel<A>) -> SchedResult<()> {
        let caller = kernel.current_thread_id();
        let mut g = kernel.sched();
        match self.give_locked(&mut g, caller)? {
            Some((_, hint)) => {
                kernel.resched_after_wake(g, hint);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Condition variable used together with a [`Mutex`].
pub struct CondVar {
    queue: WaitQueueId,
}

impl CondVar {
    /// Create a condition variable.
    pub fn new<A: Arch>(kernel: &Kernel<A>) -> Self {
        Self {
            queue: kernel.create_wait_queue(),
        }
    }

    /// Atomically release `mutex` and wait for a notification, then
    /// reacquire the mutex before returning (also after a timeout).
    pub fn wait<A: Arch>(
        &self,
        kernel: &Kernel<A>,
        mutex: &Mutex,
        timeout: Timeout,
    ) -> SchedResult<()> {
        let caller = kernel.current_thread_id();
        let mut g = kernel.sched();
        let handoff = mutex.give_locked(&mut g, caller)?;
        if let Some((_, Some(cpu))) = handoff {
            if cpu != A::cpu_id() {
                A::kick_cpu(cpu);
            }
        }
        let result = kernel.block_current_on(g, self.queue, timeout);
        let reacquired = mutex.take(kernel, Timeout::Forever);
        result.and(reacquired)
    }

    /// Wake the best waiter. Returns whether one was woken.
    pub fn notify_one<A: Arch>(&self, kernel: &Kernel<A>) -> bool {
        let mut g = kernel.sched();
        match g.wake_one(self.queue) {
            Some((_, hint)) => {
                kernel.resched_after_wake(g, hint);
                true
            }
            None => false,
        }
    }

    /// Wake every waiter. Returns how many were woken.
    pub fn notify_all<A: Arch>(&self, kernel: &Kernel<A>) -> usize {
        let cpu = A::cpu_id();
        let mut g = kernel.sched();
        let woken = g.wake_all(self.queue);
        let count = woken.len();
        if count == 0 {
            return 0;
        }
        if g.should_preempt(cpu) {
            kernel.preempt_local(g);
        }
        count
    }
}
