//! Scenario tests for the documented scheduler properties.

use super::helpers::*;
use crate::errors::SchedError;
use crate::thread::{Thread, ThreadState, WaitOutcome};
use crate::time::{Duration, Instant, Timeout};
use alloc::vec::Vec;

#[test]
fn priority_5_5_3_scenario() {
    // Three threads at priorities {5, 5, 3}: the priority-3 thread runs
    // first and exclusively until it blocks; afterwards the two priority-5
    // threads alternate strictly in spawn order.
    let mut sched = fresh_sched(1);
    let threads = ready_threads(&mut sched, &[(1, 5), (2, 5), (3, 3)]);

    let first = sched.pick_next_ready(0).unwrap();
    assert_eq!(first.id().raw(), 3);
    sched.install_current(0, first.clone());

    // Yielding does not hand the CPU to lower-urgency threads.
    assert!(sched.yield_switch(0).is_none());
    assert_eq!(sched.current(0).unwrap().id().raw(), 3);

    // The priority-3 thread blocks; the priority-5 threads now alternate
    // in spawn order on every yield.
    let q = sched.create_wait_queue();
    sched.enter_wait(&first, q, None);
    let next = sched.pick_next_ready(0).unwrap();
    assert_eq!(next.id().raw(), 1);
    sched.install_current(0, next);

    let mut order = Vec::new();
    for _ in 0..6 {
        let pair = sched.yield_switch(0).expect("peer is always ready");
        order.push(pair.next.id().raw());
    }
    assert_eq!(order, [2, 1, 2, 1, 2, 1]);
    drop(threads);
}

#[test]
fn fifo_tie_break_follows_insertion_order() {
    let mut sched = fresh_sched(1);
    let specs: Vec<(u64, i8)> = (1..=8).map(|id| (id, 4)).collect();
    let _threads = ready_threads(&mut sched, &specs);
    assert_eq!(drain_order(&mut sched, 0), [1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn wake_before_deadline_wins() {
    // Thread A waits with a 100-tick deadline; the give arrives at tick 50.
    let mut sched = fresh_sched(1);
    let threads = ready_threads(&mut sched, &[(1, 5)]);
    let a = &threads[0];
    let q = sched.create_wait_queue();
    sched.enter_wait(a, q, Some(Instant::from_ticks(100)));

    sched.handle_tick(Instant::from_ticks(50));
    assert_eq!(a.state(), ThreadState::Waiting);

    let (woken, _) = sched.wake_one(q).unwrap();
    assert_eq!(woken.id(), a.id());
    assert_eq!(a.wait_outcome(), WaitOutcome::Completed);

    // The deadline later passes without effect: exactly one resolution.
    sched.handle_tick(Instant::from_ticks(150));
    assert_eq!(a.wait_outcome(), WaitOutcome::Completed);
    assert_eq!(sched.stats().timeouts_fired, 0);
}

#[test]
fn deadline_before_wake_wins() {
    // Same scenario with the give delayed to tick 150.
    let mut sched = fresh_sched(1);
    let threads = ready_threads(&mut sched, &[(1, 5)]);
    let a = &threads[0];
    let q = sched.create_wait_queue();
    sched.enter_wait(a, q, Some(Instant::from_ticks(100)));

    sched.handle_tick(Instant::from_ticks(150));
    assert_eq!(a.state(), ThreadState::Ready);
    assert_eq!(a.wait_outcome(), WaitOutcome::TimedOut);
    assert_eq!(sched.stats().timeouts_fired, 1);

    // The late give finds nobody to wake.
    assert!(sched.wake_one(q).is_none());
    assert_eq!(a.wait_outcome(), WaitOutcome::TimedOut);
}

#[test]
fn self_abort_leaves_no_reachable_references() {
    let mut sched = fresh_sched(1);
    let threads = ready_threads(&mut sched, &[(1, 5), (2, 6), (3, 7)]);
    let victim = sched.pick_next_ready(0).unwrap();
    assert_eq!(victim.id().raw(), 1);
    sched.install_current(0, victim.clone());

    // Another thread waits on a queue, and one joiner waits on the victim.
    let q = sched.create_wait_queue();
    sched.enter_wait(&threads[1], q, None);
    let join_q = sched.join_queue_of(&victim).unwrap();
    sched.enter_wait(&threads[2], join_q, Some(Instant::from_ticks(500)));

    let outcome = sched.abort(&victim);
    assert_eq!(outcome.was_current_on, Some(0));
    assert_eq!(outcome.joiners.len(), 1);
    assert_eq!(outcome.joiners[0].id().raw(), 3);

    // No queue holds the victim; the joiner was woken with success.
    assert_eq!(victim.state(), ThreadState::Dead);
    assert!(!sched.run_queue().contains(&victim));
    assert_eq!(sched.waiter_count(q), 1, "unrelated waiter untouched");
    assert_eq!(threads[2].wait_outcome(), WaitOutcome::Completed);

    // The joiner's timeout was cancelled along with the wake.
    sched.clear_current(0);
    assert_eq!(sched.handle_tick(Instant::from_ticks(1000)), 0);

    // Aborting again is a no-op.
    let again = sched.abort(&victim);
    assert!(again.was_current_on.is_none());
    assert!(again.joiners.is_empty());
}

#[test]
fn abort_wakes_every_joiner() {
    let mut sched = fresh_sched(1);
    let threads = ready_threads(&mut sched, &[(1, 5), (2, 6), (3, 7), (4, 8)]);
    let target = &threads[0];
    let join_q = sched.join_queue_of(target).unwrap();
    for joiner in &threads[1..] {
        sched.enter_wait(joiner, join_q, None);
    }

    let outcome = sched.abort(target);
    assert_eq!(outcome.joiners.len(), 3);
    for joiner in &threads[1..] {
        assert_eq!(joiner.state(), ThreadState::Ready);
        assert_eq!(joiner.wait_outcome(), WaitOutcome::Completed);
    }
}

#[test]
fn abort_of_waiting_thread_cleans_queue_and_timeout() {
    let mut sched = fresh_sched(1);
    let threads = ready_threads(&mut sched, &[(1, 5)]);
    let q = sched.create_wait_queue();
    sched.enter_wait(&threads[0], q, Some(Instant::from_ticks(100)));

    sched.abort(&threads[0]);
    assert_eq!(sched.waiter_count(q), 0);
    assert_eq!(sched.handle_tick(Instant::from_ticks(200)), 0);
    assert_eq!(threads[0].state(), ThreadState::Dead);
}

#[test]
fn preempted_thread_keeps_its_turn() {
    // A running thread preempted by a more urgent one goes back to the
    // head of its level, ahead of peers queued behind it.
    let mut sched = fresh_sched(1);
    let threads = ready_threads(&mut sched, &[(1, 5), (2, 5)]);
    let running = sched.pick_next_ready(0).unwrap();
    assert_eq!(running.id().raw(), 1);
    sched.install_current(0, running);

    let _urgent = ready_threads(&mut sched, &[(3, 2)]);
    let pair = sched.preempt_switch(0).unwrap();
    assert_eq!(pair.next.id().raw(), 3);
    assert_eq!(pair.prev.as_ref().unwrap().id().raw(), 1);

    // When the urgent thread blocks, thread 1 resumes before thread 2.
    let q = sched.create_wait_queue();
    let urgent = sched.current(0).unwrap().clone();
    sched.enter_wait(&urgent, q, None);
    assert_eq!(drain_order(&mut sched, 0), [1, 2]);
    drop(threads);
}

#[test]
fn time_slice_rotates_equal_priorities() {
    let mut sched = fresh_sched_with_slice(1, 2);
    let threads = ready_threads(&mut sched, &[(1, 5), (2, 5)]);
    let first = sched.pick_next_ready(0).unwrap();
    sched.install_current(0, first);

    // First tick: slice not yet expired.
    assert_eq!(sched.handle_tick(Instant::from_ticks(1)), 0);
    // Second tick: slice expires and a peer is ready.
    assert_eq!(sched.handle_tick(Instant::from_ticks(2)), 1);

    let pair = sched.preempt_switch(0).unwrap();
    assert_eq!(pair.next.id().raw(), 2);
    // The rotated thread went to the tail, so it is picked after its peer
    // next time, giving strict alternation.
    assert_eq!(sched.run_queue().best_priority_for_cpu(0).unwrap().raw(), 5);
    drop(threads);
}

#[test]
fn no_rotation_when_slicing_disabled() {
    let mut sched = fresh_sched(1);
    let threads = ready_threads(&mut sched, &[(1, 5), (2, 5)]);
    let first = sched.pick_next_ready(0).unwrap();
    sched.install_current(0, first.clone());

    for tick in 1..100 {
        assert_eq!(sched.handle_tick(Instant::from_ticks(tick)), 0);
    }
    assert!(sched.preempt_switch(0).is_none());
    assert_eq!(sched.current(0).unwrap().id(), first.id());
    drop(threads);
}

#[test]
fn cooperative_thread_switches_only_voluntarily() {
    let mut sched = fresh_sched_with_slice(1, 1);
    let threads = ready_threads(&mut sched, &[(1, -4), (2, -8)]);
    let running = sched.pick_next_ready(0).unwrap();
    assert_eq!(running.id().raw(), 2, "more urgent cooperative runs first");
    sched.install_current(0, running);

    // Neither ticks nor urgency preempt a cooperative thread.
    for tick in 1..10 {
        assert_eq!(sched.handle_tick(Instant::from_ticks(tick)), 0);
    }
    assert!(sched.preempt_switch(0).is_none());

    // Yield does not hand the CPU to less urgent work either; only
    // blocking releases it.
    assert!(sched.yield_switch(0).is_none());
    let q = sched.create_wait_queue();
    let running = sched.current(0).unwrap().clone();
    sched.enter_wait(&running, q, None);
    assert_eq!(sched.pick_next_ready(0).unwrap().id().raw(), 1);
    drop(threads);
}

#[test]
fn smp_affinity_and_parallel_picks() {
    let mut sched = fresh_sched(2);
    let a = Thread::test_thread(1, 5);
    let b = Thread::test_thread(2, 5);
    b.set_affinity(0b10);
    sched.register_thread(&a);
    sched.register_thread(&b);
    sched.make_ready(a.clone());
    sched.make_ready(b.clone());

    // CPU 0 cannot take the pinned thread.
    let on_zero = sched.pick_next_ready(0).unwrap();
    assert_eq!(on_zero.id().raw(), 1);
    sched.install_current(0, on_zero);
    let on_one = sched.pick_next_ready(1).unwrap();
    assert_eq!(on_one.id().raw(), 2);
    sched.install_current(1, on_one);

    assert!(sched.pick_next_ready(0).is_none());
    assert_eq!(a.last_cpu(), 0);
    assert_eq!(b.last_cpu(), 1);
}

#[test]
fn priority_invariant_at_every_reschedule_point() {
    let mut sched = fresh_sched(1);
    let specs: Vec<(u64, i8)> = (1..=10).map(|id| (id, (id % 7) as i8)).collect();
    let threads = ready_threads(&mut sched, &specs);

    let first = sched.pick_next_ready(0).unwrap();
    sched.install_current(0, first);
    let q = sched.create_wait_queue();

    for round in 0..30 {
        // Reschedule point: the running thread outranks everything ready.
        let current = sched.current(0).unwrap().clone();
        if let Some(best) = sched.best_eligible(0) {
            assert!(current.priority().raw() <= best.raw());
        }
        if round % 3 == 0 {
            sched.enter_wait(&current, q, None);
            sched.wake_one(q);
        } else {
            sched.yield_switch(0);
        }
        if sched.current(0).is_none() {
            let next = sched.pick_next_ready(0).unwrap();
            sched.install_current(0, next);
        }
    }
    drop(threads);
}

mod kernel_scenarios {
    use super::*;

    #[test]
    fn yield_alternates_equal_priority_threads() {
        let fixture = test_kernel();
        let a = fixture.kernel.spawn(|| {}, 5).unwrap();
        let b = fixture.kernel.spawn(|| {}, 5).unwrap();
        fixture.kernel.start_first_thread();
        assert_eq!(
            fixture.kernel.current_thread().unwrap().id(),
            a.thread_id()
        );

        fixture.kernel.yield_now();
        assert_eq!(
            fixture.kernel.current_thread().unwrap().id(),
            b.thread_id()
        );
        fixture.kernel.yield_now();
        assert_eq!(
            fixture.kernel.current_thread().unwrap().id(),
            a.thread_id()
        );
    }

    #[test]
    fn spawn_of_more_urgent_thread_preempts_immediately() {
        let fixture = started_kernel();
        let current = fixture.kernel.current_thread().unwrap();
        assert_eq!(current.priority().raw(), 0);

        let urgent = fixture.kernel.spawn(|| {}, -1).unwrap();
        // The spawn itself was the reschedule point.
        assert_eq!(
            fixture.kernel.current_thread().unwrap().id(),
            urgent.thread_id()
        );
        // The preempted thread kept its turn at the head of its level.
        assert_eq!(current.state(), ThreadState::Ready);
    }

    #[test]
    fn sched_lock_defers_preemption_until_unlock() {
        let fixture = started_kernel();
        let main = fixture.kernel.current_thread().unwrap();

        fixture.kernel.sched_lock();
        let urgent = fixture.kernel.spawn(|| {}, -1).unwrap();
        // Still running: preemption is deferred.
        assert_eq!(fixture.kernel.current_thread().unwrap().id(), main.id());

        fixture.kernel.sched_unlock();
        assert_eq!(
            fixture.kernel.current_thread().unwrap().id(),
            urgent.thread_id()
        );
    }

    #[test]
    fn abort_other_thread_then_handle_observes_death() {
        let fixture = started_kernel();
        let handle = fixture.kernel.spawn(|| {}, 5).unwrap();
        assert!(handle.is_alive());
        fixture.kernel.abort(handle.thread());
        assert!(handle.is_finished());
        assert_eq!(fixture.kernel.stats().threads_aborted, 1);
    }

    #[test]
    fn timer_tick_expires_armed_sleep() {
        // A thread parked on a wait queue with a deadline is readied by
        // the tick that passes the deadline, with a timed-out verdict.
        let fixture = started_kernel();
        let sleeper = fixture.kernel.spawn(|| {}, 5).unwrap();
        {
            let mut g = fixture.kernel.sched();
            let q = g.create_wait_queue();
            let deadline = fixture.kernel.now() + Duration::from_ticks(10);
            g.enter_wait(sleeper.thread(), q, Some(deadline));
        }
        fixture.ticks.advance(5);
        fixture.kernel.timer_tick();
        assert_eq!(sleeper.thread().state(), ThreadState::Waiting);

        fixture.ticks.advance(10);
        fixture.kernel.timer_tick();
        assert_eq!(sleeper.thread().state(), ThreadState::Ready);
        assert_eq!(fixture.kernel.stats().timeouts_fired, 1);
    }

    #[test]
    fn work_submit_from_interrupt_context() {
        use crate::work::{WorkItem, WorkQueue, WorkState};
        let fixture = started_kernel();
        let queue = WorkQueue::new(&fixture.kernel);
        let item = WorkItem::new(|| {});

        fixture.kernel.irq_offload(|| {
            assert!(queue.submit(&fixture.kernel, &item));
        });
        assert_eq!(item.state(), WorkState::Queued);
        assert!(queue.process_one(&fixture.kernel, Timeout::NoWait));
        assert_eq!(item.state(), WorkState::Idle);
    }

    #[test]
    fn join_rejects_nowait_while_target_lives() {
        let fixture = started_kernel();
        let handle = fixture.kernel.spawn(|| {}, 5).unwrap();
        assert_eq!(
            fixture.kernel.join(&handle, Timeout::NoWait),
            Err(SchedError::Busy)
        );
    }
}
