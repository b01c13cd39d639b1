//! Property tests for queue ordering and spinlock misuse detection.

use super::helpers::*;
use crate::arch::NoOpArch;
use crate::spinlock::{Claimant, SpinLock};
use crate::thread::Thread;
use alloc::vec::Vec;
use proptest::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};

proptest! {
    /// Equal-priority threads drain in exactly their insertion order.
    #[test]
    fn fifo_preserved_for_equal_priorities(count in 1usize..40) {
        let mut sched = fresh_sched(1);
        let specs: Vec<(u64, i8)> = (1..=count as u64).map(|id| (id, 5)).collect();
        let _threads = ready_threads(&mut sched, &specs);
        let expected: Vec<u64> = (1..=count as u64).collect();
        prop_assert_eq!(drain_order(&mut sched, 0), expected);
    }

    /// Draining the run queue yields priorities in non-decreasing order,
    /// and insertion order within each priority level (a stable sort).
    #[test]
    fn drain_is_priority_sorted_and_stable(prios in prop::collection::vec(-16i8..=15, 1..40)) {
        let mut sched = fresh_sched(1);
        let specs: Vec<(u64, i8)> = prios
            .iter()
            .enumerate()
            .map(|(i, &p)| (i as u64 + 1, p))
            .collect();
        let _threads = ready_threads(&mut sched, &specs);

        let mut expected = specs.clone();
        expected.sort_by_key(|&(_, p)| p); // stable: ties keep insertion order
        let expected_ids: Vec<u64> = expected.iter().map(|&(id, _)| id).collect();
        prop_assert_eq!(drain_order(&mut sched, 0), expected_ids);
    }

    /// The run queue's count stays consistent under removals.
    #[test]
    fn run_queue_len_consistent(prios in prop::collection::vec(-16i8..=15, 1..30), removals in prop::collection::vec(any::<prop::sample::Index>(), 0..10)) {
        let mut sched = fresh_sched(1);
        let threads: Vec<Thread> = prios
            .iter()
            .enumerate()
            .map(|(i, &p)| Thread::test_thread(i as u64 + 1, p))
            .collect();
        for t in &threads {
            sched.register_thread(t);
            sched.make_ready(t.clone());
        }

        let mut removed = 0usize;
        for idx in removals {
            let t = &threads[idx.index(threads.len())];
            // Abort strips the thread from the run queue exactly once.
            let before = sched.run_queue().contains(t);
            sched.abort(t);
            if before {
                removed += 1;
            }
        }
        prop_assert_eq!(sched.run_queue().len(), threads.len() - removed);
        prop_assert_eq!(drain_order(&mut sched, 0).len(), threads.len() - removed);
    }

    /// Releasing from a different (CPU, thread) than the holder is
    /// detected in 100% of attempts.
    #[test]
    fn wrong_claimant_release_always_detected(
        cpu in 0usize..4,
        thread in 1u64..100,
        other_cpu in 0usize..4,
        other_thread in 1u64..100,
    ) {
        prop_assume!(cpu != other_cpu || thread != other_thread);
        let lock = SpinLock::new(());
        let owner = Claimant { cpu, thread };
        let key = lock.acquire::<NoOpArch>(owner);

        let forged = Claimant { cpu: other_cpu, thread: other_thread };
        let result = catch_unwind(AssertUnwindSafe(|| {
            lock.release::<NoOpArch>(forged, key);
        }));
        prop_assert!(result.is_err(), "forged release must panic");

        // The true owner can still release.
        lock.release::<NoOpArch>(owner, key);
        prop_assert!(!lock.is_locked());
    }

    /// Releasing an already-released lock is detected in 100% of attempts.
    #[test]
    fn double_release_always_detected(cpu in 0usize..4, thread in 1u64..100) {
        let lock = SpinLock::new(());
        let who = Claimant { cpu, thread };
        let key = lock.acquire::<NoOpArch>(who);
        lock.release::<NoOpArch>(who, key);

        let result = catch_unwind(AssertUnwindSafe(|| {
            lock.release::<NoOpArch>(who, key);
        }));
        prop_assert!(result.is_err(), "double release must panic");
    }

    /// Relocking on the holding CPU is detected in 100% of attempts.
    #[test]
    fn same_cpu_relock_always_detected(cpu in 0usize..4, thread in 1u64..100, second_thread in 1u64..100) {
        let lock = SpinLock::new(());
        let who = Claimant { cpu, thread };
        let key = lock.acquire::<NoOpArch>(who);

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _ = lock.acquire::<NoOpArch>(Claimant { cpu, thread: second_thread });
        }));
        prop_assert!(result.is_err(), "same-cpu relock must panic");

        lock.release::<NoOpArch>(who, key);
    }
}
