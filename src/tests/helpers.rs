//! Test helper utilities and fixtures.

use crate::arch::NoOpArch;
use crate::config::SchedConfig;
use crate::kernel::Kernel;
use crate::sched::SchedulerState;
use crate::thread::Thread;
use crate::time::MockTicks;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// A fresh scheduler with time-slicing disabled.
pub(crate) fn fresh_sched(num_cpus: usize) -> SchedulerState {
    SchedulerState::new(SchedConfig::new(num_cpus))
}

/// A fresh scheduler with equal-priority round-robin enabled.
pub(crate) fn fresh_sched_with_slice(num_cpus: usize, slice: u32) -> SchedulerState {
    SchedulerState::new(SchedConfig::new(num_cpus).with_time_slice(slice))
}

/// A host-testable kernel and its manually driven tick source.
pub(crate) struct TestKernel {
    pub(crate) kernel: Kernel<NoOpArch>,
    pub(crate) ticks: Arc<MockTicks>,
}

pub(crate) fn test_kernel() -> TestKernel {
    test_kernel_with(SchedConfig::new(1))
}

pub(crate) fn test_kernel_with(config: SchedConfig) -> TestKernel {
    let ticks = Arc::new(MockTicks::new());
    TestKernel {
        kernel: Kernel::new(config, ticks.clone()),
        ticks,
    }
}

/// A kernel with one spawned thread installed as current, so operations
/// that require a thread context can run on the host stack.
pub(crate) fn started_kernel() -> TestKernel {
    let fixture = test_kernel();
    fixture.kernel.spawn(|| {}, 0).expect("spawn main");
    fixture.kernel.start_first_thread();
    fixture
}

/// Register and ready one thread per `(id, priority)` spec, in order.
pub(crate) fn ready_threads(sched: &mut SchedulerState, specs: &[(u64, i8)]) -> Vec<Thread> {
    specs
        .iter()
        .map(|&(id, prio)| {
            let t = Thread::test_thread(id, prio);
            sched.register_thread(&t);
            sched.make_ready(t.clone());
            t
        })
        .collect()
}

/// Pop the run queue dry for `cpu`, recording the order of thread ids.
pub(crate) fn drain_order(sched: &mut SchedulerState, cpu: usize) -> Vec<u64> {
    let mut order = Vec::new();
    while let Some(t) = sched.pick_next_ready(cpu) {
        order.push(t.id().raw());
    }
    order
}

/// Small deterministic generator for stress tests.
pub(crate) struct Lcg(u64);

impl Lcg {
    pub(crate) fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub(crate) fn next_u64(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0
    }

    pub(crate) fn next_range(&mut self, min: u64, max: u64) -> u64 {
        min + self.next_u64() % (max - min)
    }

    pub(crate) fn next_bool(&mut self) -> bool {
        self.next_u64() & 1 == 0
    }
}
