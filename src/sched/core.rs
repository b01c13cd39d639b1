//! Scheduler core: thread state transitions, timeouts, and preemption.
//!
//! [`SchedulerState`] is an explicitly constructed object guarded by one
//! scheduler spinlock. Every method takes `&mut self`, which doubles as
//! proof the lock is held; nothing in here blocks or re-enters the
//! scheduler, so critical sections stay bounded.
//!
//! SMP model: a single run queue shared by all CPUs under the one lock.
//! Per-thread affinity masks decide eligibility at pick time, and methods
//! that ready a thread report which CPU (if any) should be interrupted to
//! pick it up.

use crate::config::SchedConfig;
use crate::errors::{SchedError, SchedResult};
use crate::sched::run_queue::RunQueue;
use crate::sched::wait_queue::WaitQueue;
use crate::thread::{Priority, Thread, ThreadId, ThreadState, WaitOutcome};
use crate::time::{Instant, Tick};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use log::{debug, trace};

/// Identifier of a wait queue registered with the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitQueueId(u64);

impl WaitQueueId {
    pub(crate) fn raw(self) -> u64 {
        self.0
    }
}

/// Scheduler event counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchedStats {
    pub context_switches: u64,
    pub preemptions: u64,
    pub timeouts_fired: u64,
    pub threads_spawned: u64,
    pub threads_aborted: u64,
}

/// A decided context switch: save into `prev` (if any), resume `next`.
pub struct SwitchPair {
    pub prev: Option<Thread>,
    pub next: Thread,
}

/// Result of an abort: where the target was running and which joiners
/// became ready.
pub struct AbortOutcome {
    pub was_current_on: Option<usize>,
    pub joiners: Vec<Thread>,
}

/// What the caller must still do to complete a suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendAction {
    /// The thread was parked without a context switch.
    Completed,
    /// The thread is running on the given CPU, which must switch away.
    NeedsSwitch(usize),
}

struct CpuSlot {
    current: Option<Thread>,
    slice_left: u32,
    slice_expired: bool,
}

/// The scheduler's shared mutable state.
pub struct SchedulerState {
    config: SchedConfig,
    run_queue: RunQueue,
    cpus: Vec<CpuSlot>,
    wait_queues: BTreeMap<u64, WaitQueue>,
    next_queue_id: u64,
    /// Armed wait deadlines, ordered by (tick, thread id).
    timeouts: BTreeMap<(Tick, ThreadId), Thread>,
    stats: SchedStats,
}

impl SchedulerState {
    /// Create a fresh scheduler for `config.num_cpus` CPUs, all idle.
    pub fn new(config: SchedConfig) -> Self {
        let mut cpus = Vec::with_capacity(config.num_cpus);
        for _ in 0..config.num_cpus {
            cpus.push(CpuSlot {
                current: None,
                slice_left: 0,
                slice_expired: false,
            });
        }
        Self {
            config,
            run_queue: RunQueue::new(),
            cpus,
            wait_queues: BTreeMap::new(),
            next_queue_id: 1,
            timeouts: BTreeMap::new(),
            stats: SchedStats::default(),
        }
    }

    /// The configuration this scheduler was built with.
    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    /// Event counters so far.
    pub fn stats(&self) -> SchedStats {
        self.stats
    }

    /// The shared run queue.
    pub fn run_queue(&self) -> &RunQueue {
        &self.run_queue
    }

    // ------------------------------------------------------------------
    // Wait-queue registry
    // ------------------------------------------------------------------

    /// Register a new, empty wait queue.
    pub fn create_wait_queue(&mut self) -> WaitQueueId {
        let id = self.next_queue_id;
        self.next_queue_id += 1;
        self.wait_queues.insert(id, WaitQueue::new());
        WaitQueueId(id)
    }

    /// Tear down a wait queue, readying every waiter with an aborted
    /// outcome. Returns the threads made ready.
    pub fn destroy_wait_queue(&mut self, queue: WaitQueueId) -> Vec<Thread> {
        let mut q = match self.wait_queues.remove(&queue.0) {
            Some(q) => q,
            None => return Vec::new(),
        };
        let mut woken = Vec::new();
        while let Some(t) = q.pop_front() {
            self.cancel_timeout(&t);
            t.set_waiting_on(0);
            t.set_wait_outcome(WaitOutcome::Aborted);
            self.ready_thread(t.clone());
            woken.push(t);
        }
        woken
    }

    /// Number of threads parked on `queue`.
    pub fn waiter_count(&self, queue: WaitQueueId) -> usize {
        self.wait_queues.get(&queue.0).map_or(0, |q| q.len())
    }

    // ------------------------------------------------------------------
    // Current-thread slots
    // ------------------------------------------------------------------

    /// The thread running on `cpu`, if any.
    pub fn current(&self, cpu: usize) -> Option<&Thread> {
        self.cpus[cpu].current.as_ref()
    }

    /// Whether `cpu` has no current thread.
    pub fn is_idle(&self, cpu: usize) -> bool {
        self.cpus[cpu].current.is_none()
    }

    /// Install `thread` as the running thread on `cpu`.
    pub fn install_current(&mut self, cpu: usize, thread: Thread) {
        trace!("cpu {} now running thread {}", cpu, thread.id());
        thread.set_state(ThreadState::Running);
        thread.set_cpu(cpu);
        let slice = self.config.time_slice.unwrap_or(0);
        let slot = &mut self.cpus[cpu];
        slot.slice_left = slice;
        slot.slice_expired = false;
        slot.current = Some(thread);
        self.stats.context_switches += 1;
    }

    /// Vacate `cpu`'s current slot without readying the thread.
    pub fn clear_current(&mut self, cpu: usize) {
        self.cpus[cpu].current = None;
    }

    // ------------------------------------------------------------------
    // Readying and picking
    // ------------------------------------------------------------------

    /// Mark `thread` READY and queue it. Returns the CPU that should be
    /// interrupted to pick it up, if readying it warrants preemption or
    /// fills an idle CPU.
    pub fn make_ready(&mut self, thread: Thread) -> Option<usize> {
        self.ready_thread(thread)
    }

    fn ready_thread(&mut self, thread: Thread) -> Option<usize> {
        thread.set_state(ThreadState::Ready);
        let hint = self.resched_hint(&thread);
        trace!(
            "thread {} ready (prio {}, resched hint {:?})",
            thread.id(),
            thread.priority().raw(),
            hint
        );
        self.run_queue.push_back(thread);
        hint
    }

    /// CPU worth interrupting for a newly ready `thread`: an idle eligible
    /// CPU first, else the eligible CPU running the least urgent
    /// preemptible thread that `thread` outranks. Cooperative currents are
    /// never preempted.
    fn resched_hint(&self, thread: &Thread) -> Option<usize> {
        for cpu in 0..self.config.num_cpus {
            if thread.allows_cpu(cpu) && self.cpus[cpu].current.is_none() {
                return Some(cpu);
            }
        }
        let mut target: Option<(usize, i8)> = None;
        for cpu in 0..self.config.num_cpus {
            if !thread.allows_cpu(cpu) {
                continue;
            }
            if let Some(cur) = &self.cpus[cpu].current {
                let p = cur.priority();
                if p.is_cooperative() || thread.priority().raw() >= p.raw() {
                    continue;
                }
                if target.map_or(true, |(_, worst)| p.raw() > worst) {
                    target = Some((cpu, p.raw()));
                }
            }
        }
        target.map(|(cpu, _)| cpu)
    }

    /// Remove and return the highest-priority READY thread eligible for
    /// `cpu`; `None` means the CPU should idle.
    pub fn pick_next_ready(&mut self, cpu: usize) -> Option<Thread> {
        self.run_queue.pop_for_cpu(cpu)
    }

    /// Priority of the best READY thread eligible for `cpu`.
    pub fn best_eligible(&self, cpu: usize) -> Option<Priority> {
        self.run_queue.best_priority_for_cpu(cpu)
    }

    /// Whether `cpu` should switch at its next reschedule point: it is
    /// idle with work available, its current thread stopped running, or a
    /// strictly more urgent thread is ready and the current thread is
    /// preemptible.
    pub fn should_preempt(&self, cpu: usize) -> bool {
        let best = self.best_eligible(cpu);
        match &self.cpus[cpu].current {
            None => best.is_some(),
            Some(cur) => {
                if cur.state() != ThreadState::Running {
                    return true;
                }
                if cur.priority().is_cooperative() {
                    return false;
                }
                match best {
                    Some(p) if p.raw() < cur.priority().raw() => true,
                    Some(p) => {
                        p.raw() == cur.priority().raw() && self.cpus[cpu].slice_expired
                    }
                    None => false,
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Switch decisions
    // ------------------------------------------------------------------

    /// Voluntary yield on `cpu`: the current thread goes to the tail of
    /// its priority level if a thread of equal or better priority is
    /// ready. Returns the switch to perform, or `None` to keep running.
    pub fn yield_switch(&mut self, cpu: usize) -> Option<SwitchPair> {
        let cur = self.cpus[cpu].current.clone()?;
        let best = self.best_eligible(cpu)?;
        if best.raw() > cur.priority().raw() {
            return None;
        }
        let next = self
            .run_queue
            .pop_for_cpu(cpu)
            .expect("eligible thread observed under the same lock");
        self.cpus[cpu].current = None;
        cur.set_state(ThreadState::Ready);
        self.run_queue.push_back(cur.clone());
        self.install_current(cpu, next.clone());
        Some(SwitchPair {
            prev: Some(cur),
            next,
        })
    }

    /// Involuntary reschedule on `cpu`, honoring cooperative priorities
    /// and the time-slice rotation flag. A preempted running thread is
    /// reinserted at the head of its level (it keeps its turn) unless its
    /// slice expired, in which case it rotates to the tail.
    pub fn preempt_switch(&mut self, cpu: usize) -> Option<SwitchPair> {
        let cur = match self.cpus[cpu].current.clone() {
            Some(cur) => cur,
            None => {
                let next = self.run_queue.pop_for_cpu(cpu)?;
                self.install_current(cpu, next.clone());
                return Some(SwitchPair { prev: None, next });
            }
        };

        let cur_running = cur.state() == ThreadState::Running;
        if cur_running && cur.priority().is_cooperative() {
            return None;
        }

        let slice_expired = self.cpus[cpu].slice_expired;
        let best = self.best_eligible(cpu);
        let preempted_by_higher = best.map_or(false, |p| p.raw() < cur.priority().raw());
        let rotate = best.map_or(false, |p| p.raw() == cur.priority().raw()) && slice_expired;

        if cur_running && !preempted_by_higher && !rotate {
            return None;
        }

        let next = match self.run_queue.pop_for_cpu(cpu) {
            Some(next) => next,
            None => {
                // Nothing to run; vacate only if the current thread is no
                // longer runnable.
                if !cur_running {
                    self.cpus[cpu].current = None;
                }
                return None;
            }
        };

        self.cpus[cpu].current = None;
        if cur_running {
            cur.set_state(ThreadState::Ready);
            if preempted_by_higher {
                self.run_queue.push_front(cur.clone());
            } else {
                self.run_queue.push_back(cur.clone());
            }
            self.stats.preemptions += 1;
        }
        self.install_current(cpu, next.clone());
        Some(SwitchPair {
            prev: Some(cur),
            next,
        })
    }

    // ------------------------------------------------------------------
    // Waiting and waking
    // ------------------------------------------------------------------

    /// Atomically move `thread` from runnable to WAITING on `queue`,
    /// arming a timeout if `deadline` is finite.
    ///
    /// # Panics
    ///
    /// Panics if the queue does not exist or the thread is neither
    /// running nor ready — both are scheduler-invariant violations.
    pub fn enter_wait(&mut self, thread: &Thread, queue: WaitQueueId, deadline: Option<Instant>) {
        match thread.state() {
            ThreadState::Running => {
                for cpu in 0..self.config.num_cpus {
                    if self.cpus[cpu].current.as_ref() == Some(thread) {
                        self.cpus[cpu].current = None;
                    }
                }
            }
            ThreadState::Ready => {
                self.run_queue.remove(thread);
            }
            state => panic!("thread {} cannot wait from state {:?}", thread.id(), state),
        }

        thread.set_state(ThreadState::Waiting);
        thread.set_wait_outcome(WaitOutcome::Pending);
        thread.set_waiting_on(queue.0);
        self.wait_queues
            .get_mut(&queue.0)
            .unwrap_or_else(|| panic!("thread {} waiting on unknown queue", thread.id()))
            .insert(thread.clone());

        if let Some(dl) = deadline {
            thread.set_deadline(Some(dl.ticks()));
            self.timeouts.insert((dl.ticks(), thread.id()), thread.clone());
        }
        trace!(
            "thread {} waiting on queue {} (deadline {:?})",
            thread.id(),
            queue.0,
            deadline
        );
    }

    /// Wake the best waiter on `queue`: cancel its timeout, mark it READY,
    /// and queue it. Returns the thread and a reschedule hint.
    pub fn wake_one(&mut self, queue: WaitQueueId) -> Option<(Thread, Option<usize>)> {
        let q = self
            .wait_queues
            .get_mut(&queue.0)
            .expect("wake on unknown queue");
        let thread = q.pop_front()?;
        self.cancel_timeout(&thread);
        thread.set_waiting_on(0);
        thread.set_wait_outcome(WaitOutcome::Completed);
        let hint = self.ready_thread(thread.clone());
        Some((thread, hint))
    }

    /// Wake every waiter on `queue`. Returns the threads made ready.
    pub fn wake_all(&mut self, queue: WaitQueueId) -> Vec<Thread> {
        let mut woken = Vec::new();
        while let Some((thread, _)) = self.wake_one(queue) {
            woken.push(thread);
        }
        woken
    }

    /// Wake a specific WAITING thread regardless of queue position.
    pub fn wake_thread(&mut self, thread: &Thread) -> SchedResult<Option<usize>> {
        if thread.state() != ThreadState::Waiting {
            return Err(SchedError::InvalidState);
        }
        let qid = thread.waiting_on();
        if let Some(q) = self.wait_queues.get_mut(&qid) {
            q.remove(thread);
        }
        self.cancel_timeout(thread);
        thread.set_waiting_on(0);
        thread.set_wait_outcome(WaitOutcome::Completed);
        Ok(self.ready_thread(thread.clone()))
    }

    fn cancel_timeout(&mut self, thread: &Thread) {
        if let Some(deadline) = thread.deadline() {
            self.timeouts.remove(&(deadline, thread.id()));
            thread.set_deadline(None);
        }
    }

    // ------------------------------------------------------------------
    // Tick processing
    // ------------------------------------------------------------------

    /// Expire wait deadlines up to `now` and account the running time
    /// slice on each CPU. Returns a bitmask of CPUs that should pass
    /// through a reschedule point.
    ///
    /// A timeout firing here and a concurrent wake are serialized by the
    /// scheduler lock: whichever path runs first moves the thread out of
    /// WAITING and records its outcome; the loser finds nothing to do.
    pub fn handle_tick(&mut self, now: Instant) -> u32 {
        let mut mask = 0u32;

        loop {
            let key = match self.timeouts.first_key_value() {
                Some((&key, _)) => key,
                None => break,
            };
            if key.0 > now.ticks() {
                break;
            }
            let thread = self
                .timeouts
                .remove(&key)
                .expect("key observed under the same lock");
            let qid = thread.waiting_on();
            if let Some(q) = self.wait_queues.get_mut(&qid) {
                q.remove(&thread);
            }
            thread.set_waiting_on(0);
            thread.set_deadline(None);
            thread.set_wait_outcome(WaitOutcome::TimedOut);
            self.stats.timeouts_fired += 1;
            debug!("thread {} wait timed out at tick {}", thread.id(), key.0);
            if let Some(cpu) = self.ready_thread(thread) {
                mask |= 1 << cpu;
            }
        }

        if let Some(slice) = self.config.time_slice {
            for cpu in 0..self.config.num_cpus {
                let cur = match &self.cpus[cpu].current {
                    Some(cur) if !cur.priority().is_cooperative() => cur.clone(),
                    _ => continue,
                };
                let expired = {
                    let slot = &mut self.cpus[cpu];
                    if slot.slice_left > 0 {
                        slot.slice_left -= 1;
                    }
                    slot.slice_left == 0
                };
                if expired {
                    self.cpus[cpu].slice_left = slice;
                    if self.run_queue.has_eligible_at(cur.priority(), cpu) {
                        self.cpus[cpu].slice_expired = true;
                        mask |= 1 << cpu;
                    }
                }
            }
        }

        mask
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Register a freshly spawned thread: give it a join queue and count it.
    pub fn register_thread(&mut self, thread: &Thread) {
        let queue = self.create_wait_queue();
        thread.set_join_queue(queue.raw());
        self.stats.threads_spawned += 1;
    }

    /// Join queue of `thread`, if it is still alive and registered.
    pub fn join_queue_of(&self, thread: &Thread) -> Option<WaitQueueId> {
        match thread.join_queue() {
            0 => None,
            id => Some(WaitQueueId(id)),
        }
    }

    /// Terminate `thread`: strip it from every queue, cancel its timeout,
    /// mark it DEAD, and wake all joiners. Idempotent.
    pub fn abort(&mut self, thread: &Thread) -> AbortOutcome {
        if thread.state() == ThreadState::Dead {
            return AbortOutcome {
                was_current_on: None,
                joiners: Vec::new(),
            };
        }

        match thread.state() {
            ThreadState::Ready => {
                self.run_queue.remove(thread);
            }
            ThreadState::Waiting => {
                let qid = thread.waiting_on();
                if let Some(q) = self.wait_queues.get_mut(&qid) {
                    q.remove(thread);
                }
                self.cancel_timeout(thread);
                thread.set_waiting_on(0);
            }
            ThreadState::Running | ThreadState::Suspended => {}
            ThreadState::Dead => unreachable!(),
        }

        let was_current_on = (0..self.config.num_cpus)
            .find(|&cpu| self.cpus[cpu].current.as_ref() == Some(thread));

        thread.set_state(ThreadState::Dead);

        let joiners = match thread.join_queue() {
            0 => Vec::new(),
            jq => {
                let woken = self.wake_all(WaitQueueId(jq));
                self.wait_queues.remove(&jq);
                thread.set_join_queue(0);
                woken
            }
        };

        self.stats.threads_aborted += 1;
        debug!(
            "thread {} aborted ({} joiners woken, was current on {:?})",
            thread.id(),
            joiners.len(),
            was_current_on
        );
        AbortOutcome {
            was_current_on,
            joiners,
        }
    }

    /// Park `thread` until resumed. Suspending a WAITING thread is
    /// rejected; cancel the wait first.
    pub fn suspend(&mut self, thread: &Thread) -> SchedResult<SuspendAction> {
        match thread.state() {
            ThreadState::Ready => {
                self.run_queue.remove(thread);
                thread.set_state(ThreadState::Suspended);
                Ok(SuspendAction::Completed)
            }
            ThreadState::Running => {
                thread.set_state(ThreadState::Suspended);
                let cpu = (0..self.config.num_cpus)
                    .find(|&cpu| self.cpus[cpu].current.as_ref() == Some(thread))
                    .expect("running thread must be current on some cpu");
                Ok(SuspendAction::NeedsSwitch(cpu))
            }
            ThreadState::Suspended => Ok(SuspendAction::Completed),
            ThreadState::Waiting | ThreadState::Dead => Err(SchedError::InvalidState),
        }
    }

    /// Make a SUSPENDED thread READY again. Returns a reschedule hint.
    pub fn resume(&mut self, thread: &Thread) -> SchedResult<Option<usize>> {
        if thread.state() != ThreadState::Suspended {
            return Err(SchedError::InvalidState);
        }
        Ok(self.ready_thread(thread.clone()))
    }
}
