//! Kernel: the scheduler state behind its spinlock, plus the context-switch
//! sequencing that turns scheduling decisions into running threads.
//!
//! The kernel owns everything; there is no file-scope scheduler state. A
//! single optional global registration exists so the thread entry
//! trampoline and convenience entry points can find the kernel from code
//! that cannot carry a reference.

use crate::arch::Arch;
use crate::config::SchedConfig;
use crate::errors::{SchedError, SchedResult, SpawnError};
use crate::mem::StackPool;
use crate::sched::{SchedStats, SchedulerState, SuspendAction, SwitchPair, WaitQueueId};
use crate::spinlock::{Claimant, SpinGuard, SpinLock};
use crate::thread::{JoinHandle, Thread, ThreadBuilder, ThreadId, ThreadInner, ThreadState, WaitOutcome};
use crate::time::{Duration, Instant, TickSource, Timeout};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::ptr;
use portable_atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

/// Optional global kernel registration for the thread trampoline.
static GLOBAL_KERNEL: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

type SchedGuard<'a, A> = SpinGuard<'a, SchedulerState, A>;

/// The threading kernel for architecture `A`.
pub struct Kernel<A: Arch> {
    state: SpinLock<SchedulerState>,
    stack_pool: StackPool,
    ticks: Arc<dyn TickSource>,
    sleep_queue: WaitQueueId,
    next_thread_id: AtomicU64,
    /// Mirror of each CPU's current thread id, readable without the lock.
    current_ids: Vec<AtomicU64>,
    irq_nesting: Vec<AtomicU32>,
    sched_lock_nesting: Vec<AtomicU32>,
    started: AtomicBool,
    _arch: PhantomData<A>,
}

// SAFETY: all interior state is lock- or atomic-protected.
unsafe impl<A: Arch> Send for Kernel<A> {}
unsafe impl<A: Arch> Sync for Kernel<A> {}

impl<A: Arch> Kernel<A> {
    /// Build a kernel with the given scheduling policy and tick source.
    pub fn new(config: SchedConfig, ticks: Arc<dyn TickSource>) -> Self {
        let mut state = SchedulerState::new(config);
        let sleep_queue = state.create_wait_queue();
        let per_cpu_u64 = || (0..config.num_cpus).map(|_| AtomicU64::new(0)).collect();
        let per_cpu_u32 = || (0..config.num_cpus).map(|_| AtomicU32::new(0)).collect();
        Self {
            state: SpinLock::new(state),
            stack_pool: StackPool::new(config.max_threads),
            ticks,
            sleep_queue,
            next_thread_id: AtomicU64::new(1),
            current_ids: per_cpu_u64(),
            irq_nesting: per_cpu_u32(),
            sched_lock_nesting: per_cpu_u32(),
            started: AtomicBool::new(false),
            _arch: PhantomData,
        }
    }

    /// Current tick-source reading.
    pub fn now(&self) -> Instant {
        self.ticks.now()
    }

    /// Snapshot of the scheduler's event counters.
    pub fn stats(&self) -> SchedStats {
        self.sched().stats()
    }

    /// Whether the executing CPU is in interrupt context.
    pub fn in_isr(&self) -> bool {
        self.irq_nesting[A::cpu_id()].load(Ordering::Acquire) > 0
    }

    fn claimant(&self) -> Claimant {
        let cpu = A::cpu_id();
        Claimant {
            cpu,
            thread: self.current_ids[cpu].load(Ordering::Acquire),
        }
    }

    pub(crate) fn sched(&self) -> SchedGuard<'_, A> {
        self.state.lock::<A>(self.claimant())
    }

    pub(crate) fn create_wait_queue(&self) -> WaitQueueId {
        self.sched().create_wait_queue()
    }

    pub(crate) fn current_thread_id(&self) -> u64 {
        self.current_ids[A::cpu_id()].load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Spawning
    // ------------------------------------------------------------------

    /// Spawn a thread with default stack and affinity at `priority`.
    pub fn spawn<F>(&self, f: F, priority: i8) -> Result<JoinHandle, SpawnError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_with(ThreadBuilder::new().priority(priority), f)
    }

    /// Spawn a thread configured by `builder`.
    ///
    /// Fails without constructing anything if the priority is out of range
    /// or no stack can be allocated.
    pub fn spawn_with<F>(&self, builder: ThreadBuilder, f: F) -> Result<JoinHandle, SpawnError>
    where
        F: FnOnce() + Send + 'static,
    {
        let priority = crate::thread::Priority::new(builder.priority)
            .ok_or(SpawnError::InvalidPriority(builder.priority))?;
        let stack = self
            .stack_pool
            .allocate(builder.stack_size)
            .ok_or(SpawnError::OutOfMemory)?;
        let stack_bottom = stack.stack_bottom();

        let id = ThreadId::new(self.next_thread_id.fetch_add(1, Ordering::AcqRel))
            .expect("thread ids start at one");
        let (thread, handle) = Thread::new(
            id,
            priority,
            builder.affinity,
            builder.name,
            Some(stack),
            Box::new(f),
        );

        let mut ctx = A::SavedContext::default();
        A::init_context(
            &mut ctx,
            thread_trampoline::<A>,
            stack_bottom,
            thread.inner_ptr() as usize,
        );
        thread.install_context(ctx);

        let mut g = self.sched();
        g.register_thread(&thread);
        let hint = g.make_ready(thread);
        self.resched_after_wake(g, hint);
        Ok(handle)
    }

    // ------------------------------------------------------------------
    // Scheduling entry points
    // ------------------------------------------------------------------

    /// Install and switch to the first thread. Called once per CPU after
    /// the embedder has spawned its initial threads.
    pub fn start_first_thread(&self) {
        let cpu = A::cpu_id();
        let mut g = self.sched();
        if g.current(cpu).is_some() {
            return;
        }
        self.started.store(true, Ordering::Release);
        if let Some(next) = g.pick_next_ready(cpu) {
            g.install_current(cpu, next.clone());
            self.run_switch(SwitchPair { prev: None, next }, g);
        }
    }

    /// Voluntarily give up the CPU to an equal- or higher-priority thread.
    pub fn yield_now(&self) {
        let cpu = A::cpu_id();
        if self.in_isr() || self.sched_lock_nesting[cpu].load(Ordering::Acquire) > 0 {
            return;
        }
        let mut g = self.sched();
        match g.yield_switch(cpu) {
            Some(pair) => self.run_switch(pair, g),
            None => drop(g),
        }
    }

    /// Block the calling thread for `duration` ticks.
    pub fn sleep(&self, duration: Duration) {
        if duration.ticks() == 0 {
            return;
        }
        let g = self.sched();
        // Natural expiry reports TimedOut; an explicit wake reports success.
        // Either way the sleep is over.
        let _ = self.block_current_on(g, self.sleep_queue, Timeout::After(duration));
    }

    /// Wake a WAITING thread early (sleep or any armed wait).
    pub fn wake(&self, thread: &Thread) -> SchedResult<()> {
        let mut g = self.sched();
        let hint = g.wake_thread(thread)?;
        self.resched_after_wake(g, hint);
        Ok(())
    }

    /// Remove `thread` from scheduling until [`resume`](Self::resume).
    pub fn suspend(&self, thread: &Thread) -> SchedResult<()> {
        let cpu = A::cpu_id();
        let mut g = self.sched();
        match g.suspend(thread)? {
            SuspendAction::Completed => drop(g),
            SuspendAction::NeedsSwitch(c) if c == cpu && !self.in_isr() => {
                g.clear_current(cpu);
                self.current_ids[cpu].store(0, Ordering::Release);
                self.switch_from_descheduled(g, thread);
            }
            SuspendAction::NeedsSwitch(c) => {
                drop(g);
                A::kick_cpu(c);
            }
        }
        Ok(())
    }

    /// Make a suspended thread runnable again.
    pub fn resume(&self, thread: &Thread) -> SchedResult<()> {
        let mut g = self.sched();
        let hint = g.resume(thread)?;
        self.resched_after_wake(g, hint);
        Ok(())
    }

    /// Defer preemption on this CPU until the matching
    /// [`sched_unlock`](Self::sched_unlock).
    pub fn sched_lock(&self) {
        self.sched_lock_nesting[A::cpu_id()].fetch_add(1, Ordering::AcqRel);
    }

    /// Undo one level of [`sched_lock`](Self::sched_lock); on the last
    /// level, any pending preemption happens immediately.
    pub fn sched_unlock(&self) {
        let cpu = A::cpu_id();
        let nesting = &self.sched_lock_nesting[cpu];
        let prev = nesting.load(Ordering::Acquire);
        if prev == 0 {
            panic!("scheduler not locked");
        }
        nesting.store(prev - 1, Ordering::Release);
        if prev == 1 && !self.in_isr() {
            let g = self.sched();
            self.preempt_local(g);
        }
    }

    /// The thread running on the calling CPU.
    pub fn current_thread(&self) -> Option<Thread> {
        let g = self.sched();
        g.current(A::cpu_id()).cloned()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Terminate `target`, waking all of its joiners. Idempotent.
    ///
    /// A thread aborting itself does not return from this call: the final
    /// context switch happens with interrupts masked, so no window exists
    /// in which an interrupt could reschedule onto the dying stack.
    pub fn abort(&self, target: &Thread) {
        let cpu = A::cpu_id();
        let mut g = self.sched();
        let outcome = g.abort(target);
        match outcome.was_current_on {
            Some(c) if c == cpu && !self.in_isr() => {
                g.clear_current(cpu);
                self.current_ids[cpu].store(0, Ordering::Release);
                self.switch_from_descheduled(g, target);
                // Reachable only through a no-op architecture.
            }
            Some(c) if c != cpu => {
                let kicks = self.remote_resched_mask(&g, cpu);
                drop(g);
                A::kick_cpu(c);
                self.kick_mask(kicks & !(1 << c));
            }
            _ => {
                // Aborted a non-running thread, or self-abort from ISR
                // context (completed at irq_exit). Joiners may warrant
                // preemption here or elsewhere.
                let kicks = self.remote_resched_mask(&g, cpu);
                if g.should_preempt(cpu) {
                    self.preempt_local(g);
                } else {
                    drop(g);
                }
                self.kick_mask(kicks);
            }
        }
    }

    /// Terminate the calling thread. Never returns on a real architecture.
    pub fn exit_current(&self) -> ! {
        let current = self
            .current_thread()
            .expect("exit_current outside thread context");
        self.abort(&current);
        unreachable!("aborted thread {} resumed", current.id());
    }

    /// Block until the thread behind `handle` is DEAD.
    ///
    /// All joiners of a thread are woken together when it dies.
    pub fn join(&self, handle: &JoinHandle, timeout: Timeout) -> SchedResult<()> {
        let target = handle.thread();
        let g = self.sched();
        if target.state() == ThreadState::Dead {
            return Ok(());
        }
        if target.id().raw() == self.current_thread_id() {
            panic!("thread {} cannot join itself", target.id());
        }
        if timeout.is_no_wait() {
            return Err(SchedError::Busy);
        }
        let queue = g
            .join_queue_of(target)
            .expect("live thread is registered with a join queue");
        self.block_current_on(g, queue, timeout)
    }

    // ------------------------------------------------------------------
    // Interrupt plumbing
    // ------------------------------------------------------------------

    /// Note entry into an interrupt handler on this CPU.
    pub fn irq_enter(&self) {
        self.irq_nesting[A::cpu_id()].fetch_add(1, Ordering::AcqRel);
    }

    /// Note exit from an interrupt handler; the outermost exit is a
    /// reschedule point.
    pub fn irq_exit(&self) {
        let cpu = A::cpu_id();
        let prev = self.irq_nesting[cpu].fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "irq_exit without matching irq_enter");
        if prev == 1 && self.sched_lock_nesting[cpu].load(Ordering::Acquire) == 0 {
            let g = self.sched();
            self.preempt_local(g);
        }
    }

    /// Run `f` synchronously in interrupt context on the calling CPU.
    ///
    /// The handler runs with interrupts masked and must not block; the
    /// call returns after the handler completes, passing through the
    /// usual end-of-interrupt reschedule point.
    pub fn irq_offload<F: FnOnce()>(&self, f: F) {
        let was_enabled = A::interrupts_enabled();
        A::disable_interrupts();
        self.irq_enter();
        f();
        self.irq_exit();
        if was_enabled {
            A::enable_interrupts();
        }
    }

    /// Advance scheduler time: expire wait deadlines and account time
    /// slices. Call from the timer interrupt (between `irq_enter` and
    /// `irq_exit`) or from a host test harness after moving the tick
    /// source.
    pub fn timer_tick(&self) {
        let cpu = A::cpu_id();
        let mut g = self.sched();
        let mask = g.handle_tick(self.ticks.now());
        let remote = mask & !(1 << cpu);
        if mask & (1 << cpu) != 0 {
            self.preempt_local(g);
        } else {
            drop(g);
        }
        self.kick_mask(remote);
    }

    // ------------------------------------------------------------------
    // Global registration
    // ------------------------------------------------------------------

    /// Register this kernel as the process-wide kernel used by the thread
    /// entry trampoline.
    ///
    /// # Safety
    ///
    /// The kernel must live for the remaining lifetime of the system, and
    /// no kernel of a different `Arch` type may ever be registered in the
    /// same process.
    pub unsafe fn register_global(&'static self) {
        GLOBAL_KERNEL.store(self as *const Self as *mut (), Ordering::Release);
    }

    /// The registered global kernel, if any.
    pub fn global() -> Option<&'static Self> {
        let ptr = GLOBAL_KERNEL.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: register_global guarantees liveness and type match.
            Some(unsafe { &*(ptr as *const Self) })
        }
    }

    // ------------------------------------------------------------------
    // Switch mechanics
    // ------------------------------------------------------------------

    /// Park the calling thread on `queue` and switch away; returns after
    /// the thread is switched back in, with the wait's outcome.
    pub(crate) fn block_current_on(
        &self,
        mut g: SchedGuard<'_, A>,
        queue: WaitQueueId,
        timeout: Timeout,
    ) -> SchedResult<()> {
        let cpu = A::cpu_id();
        if self.in_isr() {
            panic!("blocking call from interrupt context");
        }
        if self.sched_lock_nesting[cpu].load(Ordering::Acquire) > 0 {
            panic!("blocking call while scheduler is locked");
        }
        if timeout.is_no_wait() {
            return Err(SchedError::Busy);
        }
        let current = g
            .current(cpu)
            .cloned()
            .expect("blocking call outside thread context");
        let deadline = match timeout {
            Timeout::After(d) => Some(self.ticks.now() + d),
            _ => None,
        };
        g.enter_wait(&current, queue, deadline);
        self.current_ids[cpu].store(0, Ordering::Release);
        self.switch_from_descheduled(g, &current);

        match current.wait_outcome() {
            WaitOutcome::Completed => Ok(()),
            WaitOutcome::TimedOut => Err(SchedError::TimedOut),
            WaitOutcome::Aborted => Err(SchedError::InvalidState),
            WaitOutcome::Pending => {
                panic!("thread {} resumed without a wake event", current.id())
            }
        }
    }

    /// Preempt the calling thread if the scheduler says so, or finish
    /// vacating a CPU whose thread stopped running.
    pub(crate) fn preempt_local<'a>(&'a self, mut g: SchedGuard<'a, A>) {
        let cpu = A::cpu_id();
        if self.in_isr()
            || self.sched_lock_nesting[cpu].load(Ordering::Acquire) > 0
            || !self.started.load(Ordering::Acquire)
        {
            return;
        }
        if let Some(pair) = g.preempt_switch(cpu) {
            self.run_switch(pair, g);
            return;
        }
        // The executing thread may have been aborted remotely with nothing
        // ready to replace it: idle until work arrives.
        if g.current(cpu).is_none() && self.current_ids[cpu].load(Ordering::Acquire) != 0 {
            self.current_ids[cpu].store(0, Ordering::Release);
            loop {
                if let Some(next) = g.pick_next_ready(cpu) {
                    g.install_current(cpu, next.clone());
                    self.run_switch(SwitchPair { prev: None, next }, g);
                    return;
                }
                drop(g);
                A::wait_for_event();
                g = self.sched();
            }
        }
    }

    /// Complete a wake: preempt locally, or kick the hinted remote CPU.
    pub(crate) fn resched_after_wake(&self, g: SchedGuard<'_, A>, hint: Option<usize>) {
        let cpu = A::cpu_id();
        match hint {
            Some(c) if c == cpu => self.preempt_local(g),
            Some(c) => {
                drop(g);
                A::kick_cpu(c);
            }
            None => drop(g),
        }
    }

    /// Switch away from a thread that is no longer runnable (blocked,
    /// suspended, or dead), idling until a successor exists. If the
    /// descheduled thread was readied again before a successor was picked
    /// (a wake won the race), resume it without switching.
    fn switch_from_descheduled<'a>(&'a self, mut g: SchedGuard<'a, A>, descheduled: &Thread) {
        let cpu = A::cpu_id();
        loop {
            if let Some(next) = g.pick_next_ready(cpu) {
                g.install_current(cpu, next.clone());
                if next == *descheduled {
                    // We are already on this thread's stack.
                    self.current_ids[cpu].store(next.id().raw(), Ordering::Release);
                    return;
                }
                self.run_switch(
                    SwitchPair {
                        prev: Some(descheduled.clone()),
                        next,
                    },
                    g,
                );
                return;
            }
            // Idle until work arrives. Preemption stays deferred across the
            // wait: an end-of-interrupt reschedule here would abandon this
            // stack before the descheduled thread's context is saved.
            self.sched_lock_nesting[cpu].fetch_add(1, Ordering::AcqRel);
            drop(g);
            A::wait_for_event();
            self.sched_lock_nesting[cpu].fetch_sub(1, Ordering::AcqRel);
            g = self.sched();
        }
    }

    /// Perform the low-level switch for a decided pair. The scheduler lock
    /// is released first, but interrupts stay masked across the switch per
    /// the [`Arch::context_switch`] contract.
    fn run_switch(&self, pair: SwitchPair, g: SchedGuard<'_, A>) {
        let cpu = A::cpu_id();
        self.current_ids[cpu].store(pair.next.id().raw(), Ordering::Release);
        let next_ptr = pair.next.context_ptr::<A::SavedContext>();
        let mut scratch = A::SavedContext::default();
        let prev_ptr = match &pair.prev {
            Some(prev) => prev.context_ptr::<A::SavedContext>(),
            None => &mut scratch as *mut A::SavedContext,
        };
        g.unlock_stay_masked();
        // SAFETY: both contexts are pinned (thread handles or this stack
        // frame) and interrupts are masked.
        unsafe { A::context_switch(prev_ptr, next_ptr) };
        A::enable_interrupts();
    }

    /// CPUs other than `except` that currently warrant a reschedule.
    fn remote_resched_mask(&self, g: &SchedulerState, except: usize) -> u32 {
        let mut mask = 0;
        for cpu in 0..g.config().num_cpus {
            if cpu != except && g.should_preempt(cpu) {
                mask |= 1 << cpu;
            }
        }
        mask
    }

    fn kick_mask(&self, mask: u32) {
        let mut bits = mask;
        while bits != 0 {
            let cpu = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            A::kick_cpu(cpu);
        }
    }
}

/// First code every spawned thread executes.
fn thread_trampoline<A: Arch>(arg: usize) {
    // SAFETY: arg is the inner pointer of the thread now executing; the
    // scheduler holds a handle, so it is alive.
    let thread = unsafe { Thread::from_inner_ptr(arg as *const ThreadInner) };
    if let Some(entry) = thread.take_entry() {
        entry();
    }
    let id = thread.id();
    drop(thread);
    match Kernel::<A>::global() {
        Some(kernel) => kernel.exit_current(),
        None => {
            log::error!("thread {} finished with no registered kernel", id);
            loop {
                A::wait_for_event();
            }
        }
    }
}
