//! Thread handles and scheduling metadata.
//!
//! A [`Thread`] is a cheap clone over shared inner state. The scheduler
//! holds clones in its queues; [`JoinHandle`]s hold another. The inner state
//! (and with it the thread's stack) is freed only when the last clone drops,
//! so a joiner can never observe a freed stack.

use crate::config::{MAX_PRIORITY, MIN_PRIORITY};
use crate::mem::Stack;
use crate::time::Tick;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::any::Any;
use core::num::NonZeroU64;
use portable_atomic::{AtomicI8, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

pub mod builder;
pub mod handle;

pub use builder::ThreadBuilder;
pub use handle::JoinHandle;

/// Unique identifier for threads. Never reused, never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(NonZeroU64);

impl ThreadId {
    /// Create a thread ID from a nonzero value.
    pub fn new(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self)
    }

    /// Raw ID value.
    pub fn raw(self) -> u64 {
        self.0.get()
    }
}

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling priority.
///
/// Numerically lower is more urgent. Negative priorities are cooperative:
/// such a thread runs until it yields or blocks, and is never involuntarily
/// preempted. Non-negative priorities are preemptible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(i8);

impl Priority {
    /// Validate a raw priority against the configured range.
    pub fn new(raw: i8) -> Option<Self> {
        if (MIN_PRIORITY..=MAX_PRIORITY).contains(&raw) {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// Raw signed value.
    pub fn raw(self) -> i8 {
        self.0
    }

    /// Whether this priority is in the cooperative (non-preemptible) range.
    pub fn is_cooperative(self) -> bool {
        self.0 < 0
    }

    /// Index into per-level structures, `0` for the most urgent priority.
    pub(crate) fn index(self) -> usize {
        (self.0 as isize - MIN_PRIORITY as isize) as usize
    }
}

/// Thread execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// In a run queue, eligible to be picked.
    Ready = 0,
    /// Installed as some CPU's current thread.
    Running = 1,
    /// Parked on exactly one wait queue.
    Waiting = 2,
    /// Removed from scheduling until resumed.
    Suspended = 3,
    /// Terminated; joiners have been (or are being) woken.
    Dead = 4,
}

impl ThreadState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ThreadState::Ready,
            1 => ThreadState::Running,
            2 => ThreadState::Waiting,
            3 => ThreadState::Suspended,
            4 => ThreadState::Dead,
            _ => unreachable!("invalid thread state {}", v),
        }
    }
}

/// Verdict of a finished wait: which of the racing resolutions won.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WaitOutcome {
    /// Still waiting (or never waited).
    Pending = 0,
    /// Woken by a give/notify/join-completion.
    Completed = 1,
    /// The armed deadline fired first.
    TimedOut = 2,
    /// The wait queue was destroyed or the thread was aborted.
    Aborted = 3,
}

impl WaitOutcome {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WaitOutcome::Pending,
            1 => WaitOutcome::Completed,
            2 => WaitOutcome::TimedOut,
            3 => WaitOutcome::Aborted,
            _ => unreachable!("invalid wait outcome {}", v),
        }
    }
}

/// Which container currently holds the thread, for double-insertion checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum QueueLocation {
    Nowhere = 0,
    RunQueue = 1,
    WaitQueue = 2,
}

/// Architecture-opaque saved register state.
///
/// The scheduler never looks inside; the kernel installs the concrete
/// context type for its architecture and hands raw pointers to the
/// context-switch trampoline.
pub(crate) struct ContextBlob(Option<Box<dyn Any + Send>>);

impl ContextBlob {
    const fn empty() -> Self {
        Self(None)
    }

    pub(crate) fn install<C: Send + 'static>(&mut self, ctx: C) {
        self.0 = Some(Box::new(ctx));
    }

    pub(crate) fn get_or_default<C: Send + Default + 'static>(&mut self) -> &mut C {
        if self.0.is_none() {
            self.0 = Some(Box::new(C::default()));
        }
        self.0
            .as_mut()
            .and_then(|b| (&mut **b).downcast_mut::<C>())
            .expect("thread context installed for a different architecture")
    }
}

/// Shared inner thread state.
pub struct ThreadInner {
    id: ThreadId,
    base_priority: Priority,
    priority: AtomicI8,
    state: AtomicU8,
    affinity: AtomicU32,
    cpu: AtomicUsize,
    location: AtomicU8,
    /// Raw id of the wait queue this thread is parked on, 0 when none.
    waiting_on: AtomicU64,
    /// Armed deadline plus one, 0 when no timeout is armed.
    deadline: AtomicU64,
    wait_result: AtomicU8,
    /// Raw id of this thread's join wait queue, 0 before registration.
    join_queue: AtomicU64,
    name: spin::Mutex<Option<String>>,
    entry: spin::Mutex<Option<Box<dyn FnOnce() + Send>>>,
    context: spin::Mutex<ContextBlob>,
    stack: Option<Stack>,
}

/// Handle to a thread; clones share the same inner state.
pub struct Thread {
    inner: Arc<ThreadInner>,
}

impl Clone for Thread {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Thread {}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id())
            .field("priority", &self.priority().raw())
            .field("state", &self.state())
            .finish()
    }
}

impl Thread {
    /// Create a thread and its join handle.
    pub(crate) fn new(
        id: ThreadId,
        priority: Priority,
        affinity: u32,
        name: Option<String>,
        stack: Option<Stack>,
        entry: Box<dyn FnOnce() + Send>,
    ) -> (Thread, JoinHandle) {
        let inner = Arc::new(ThreadInner {
            id,
            base_priority: priority,
            priority: AtomicI8::new(priority.raw()),
            state: AtomicU8::new(ThreadState::Ready as u8),
            affinity: AtomicU32::new(affinity),
            cpu: AtomicUsize::new(0),
            location: AtomicU8::new(QueueLocation::Nowhere as u8),
            waiting_on: AtomicU64::new(0),
            deadline: AtomicU64::new(0),
            wait_result: AtomicU8::new(WaitOutcome::Pending as u8),
            join_queue: AtomicU64::new(0),
            name: spin::Mutex::new(name),
            entry: spin::Mutex::new(Some(entry)),
            context: spin::Mutex::new(ContextBlob::empty()),
            stack,
        });
        let thread = Thread {
            inner: inner.clone(),
        };
        let handle = JoinHandle::new(Thread { inner });
        (thread, handle)
    }

    /// The thread's unique identifier.
    pub fn id(&self) -> ThreadId {
        self.inner.id
    }

    /// Thread name, if one was set.
    pub fn name(&self) -> Option<String> {
        self.inner.name.lock().clone()
    }

    /// Current execution state.
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    /// Effective scheduling priority.
    pub fn priority(&self) -> Priority {
        // The stored value was validated when set.
        Priority(self.inner.priority.load(Ordering::Acquire))
    }

    /// Priority assigned at spawn, unaffected by inheritance boosts.
    pub fn base_priority(&self) -> Priority {
        self.inner.base_priority
    }

    /// CPU-affinity bitmask.
    pub fn affinity(&self) -> u32 {
        self.inner.affinity.load(Ordering::Acquire)
    }

    /// Whether this thread may run on `cpu`.
    pub fn allows_cpu(&self, cpu: usize) -> bool {
        self.affinity() & (1 << cpu) != 0
    }

    /// Restrict the thread to the CPUs set in `mask`. Takes effect at the
    /// next pick.
    pub fn set_affinity(&self, mask: u32) {
        self.inner.affinity.store(mask, Ordering::Release);
    }

    /// Index of the CPU this thread last ran on.
    pub fn last_cpu(&self) -> usize {
        self.inner.cpu.load(Ordering::Acquire)
    }

    pub(crate) fn set_cpu(&self, cpu: usize) {
        self.inner.cpu.store(cpu, Ordering::Release);
    }

    /// Whether the thread has not yet reached the Dead state.
    pub fn is_alive(&self) -> bool {
        self.state() != ThreadState::Dead
    }

    pub(crate) fn mark_enqueued(&self, location: QueueLocation) {
        let prev = self
            .inner
            .location
            .swap(location as u8, Ordering::AcqRel);
        if prev != QueueLocation::Nowhere as u8 {
            log::error!("thread {} inserted into a second queue", self.id());
            panic!("thread {} is already a member of a queue", self.id());
        }
    }

    pub(crate) fn mark_dequeued(&self) {
        self.inner
            .location
            .store(QueueLocation::Nowhere as u8, Ordering::Release);
    }

    pub(crate) fn wait_outcome(&self) -> WaitOutcome {
        WaitOutcome::from_u8(self.inner.wait_result.load(Ordering::Acquire))
    }

    pub(crate) fn set_wait_outcome(&self, outcome: WaitOutcome) {
        self.inner.wait_result.store(outcome as u8, Ordering::Release);
    }

    pub(crate) fn waiting_on(&self) -> u64 {
        self.inner.waiting_on.load(Ordering::Acquire)
    }

    pub(crate) fn set_waiting_on(&self, queue: u64) {
        self.inner.waiting_on.store(queue, Ordering::Release);
    }

    pub(crate) fn deadline(&self) -> Option<Tick> {
        match self.inner.deadline.load(Ordering::Acquire) {
            0 => None,
            v => Some(v - 1),
        }
    }

    pub(crate) fn set_deadline(&self, deadline: Option<Tick>) {
        let encoded = deadline.map(|t| t + 1).unwrap_or(0);
        self.inner.deadline.store(encoded, Ordering::Release);
    }

    pub(crate) fn join_queue(&self) -> u64 {
        self.inner.join_queue.load(Ordering::Acquire)
    }

    pub(crate) fn set_join_queue(&self, queue: u64) {
        self.inner.join_queue.store(queue, Ordering::Release);
    }

    /// Whether the stack canary is intact.
    pub fn check_stack_integrity(&self) -> bool {
        self.inner
            .stack
            .as_ref()
            .map(|s| s.check_canary())
            .unwrap_or(true)
    }

    pub(crate) fn install_context<C: Send + 'static>(&self, ctx: C) {
        self.inner.context.lock().install(ctx);
    }

    /// Raw pointer to the saved context for the context-switch trampoline.
    ///
    /// The pointer outlives the internal lock because the blob is pinned by
    /// this thread's shared inner state, which the scheduler keeps alive for
    /// as long as the thread can be switched to.
    pub(crate) fn context_ptr<C: Send + Default + 'static>(&self) -> *mut C {
        let mut blob = self.inner.context.lock();
        blob.get_or_default::<C>() as *mut C
    }

    pub(crate) fn take_entry(&self) -> Option<Box<dyn FnOnce() + Send>> {
        self.inner.entry.lock().take()
    }

    pub(crate) fn inner_ptr(&self) -> *const ThreadInner {
        Arc::as_ptr(&self.inner)
    }

    /// Rebuild a handle from a pointer produced by [`inner_ptr`].
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `inner_ptr` on a thread that is still alive
    /// (the scheduler holds a clone).
    pub(crate) unsafe fn from_inner_ptr(ptr: *const ThreadInner) -> Thread {
        // SAFETY: per contract the inner is alive; bump the count for this clone.
        unsafe { Arc::increment_strong_count(ptr) };
        Thread {
            inner: unsafe { Arc::from_raw(ptr) },
        }
    }

    #[cfg(test)]
    pub(crate) fn test_thread(id: u64, priority: i8) -> Thread {
        let prio = Priority::new(priority).expect("test priority in range");
        let (thread, _handle) = Thread::new(
            ThreadId::new(id).expect("nonzero test id"),
            prio,
            u32::MAX,
            None,
            None,
            Box::new(|| {}),
        );
        thread
    }
}
