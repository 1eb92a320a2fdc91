//! Mutex protocols: recursion, priority inheritance, timeouts, and
//! termination handover.
use super::{
    assert_running, audit_invariants, effective_priority_of, opts, sim_kernel, start_scheduler,
    state_of, tick_n, wait_result_of,
};
use crate::{
    klock,
    utils::Init,
    LockMutexTimeoutError, MutexCb, MutexProtocol, System, TaskCb, TaskSt, UnlockMutexError,
    WaitTimeoutError,
};

#[test]
fn uncontended_lock_unlock_is_observably_neutral() {
    sim_kernel!(Sys, levels: 8);
    static IDLE: TaskCb<Sys> = TaskCb::INIT;
    static TASK: TaskCb<Sys> = TaskCb::INIT;
    static MTX: MutexCb<Sys> = MutexCb::INIT;

    System::<Sys>::create_task(&TASK, opts(4, true)).unwrap();
    System::<Sys>::create_mutex(&MTX, MutexProtocol::Inheritance).unwrap();
    start_scheduler(&IDLE);

    let before = (state_of(&TASK), effective_priority_of(&TASK));

    System::<Sys>::lock_mutex(&MTX).unwrap();
    assert_eq!(System::<Sys>::mutex_is_locked(&MTX), Ok(true));
    audit_invariants::<Sys>(&[&IDLE, &TASK], &[&MTX]);
    System::<Sys>::unlock_mutex(&MTX).unwrap();

    assert_eq!(System::<Sys>::mutex_is_locked(&MTX), Ok(false));
    assert_eq!((state_of(&TASK), effective_priority_of(&TASK)), before);
    assert_running(&TASK);
    audit_invariants::<Sys>(&[&IDLE, &TASK], &[&MTX]);
}

#[test]
fn recursive_lock_needs_matching_unlocks() {
    sim_kernel!(Sys, levels: 8);
    static IDLE: TaskCb<Sys> = TaskCb::INIT;
    static TASK: TaskCb<Sys> = TaskCb::INIT;
    static MTX: MutexCb<Sys> = MutexCb::INIT;

    System::<Sys>::create_task(&TASK, opts(4, true)).unwrap();
    System::<Sys>::create_mutex(&MTX, MutexProtocol::Inheritance).unwrap();
    start_scheduler(&IDLE);

    System::<Sys>::lock_mutex(&MTX).unwrap();
    // The second lock succeeds immediately, bumping the count
    System::<Sys>::lock_mutex(&MTX).unwrap();
    {
        let lock = klock::lock_cpu::<Sys>().unwrap();
        assert_eq!(MTX.lock_count.get(&*lock), 2);
    }

    // One unlock is not enough
    System::<Sys>::unlock_mutex(&MTX).unwrap();
    assert_eq!(System::<Sys>::mutex_is_locked(&MTX), Ok(true));

    System::<Sys>::unlock_mutex(&MTX).unwrap();
    assert_eq!(System::<Sys>::mutex_is_locked(&MTX), Ok(false));

    // Unlocking a mutex one doesn't hold is a protocol violation
    assert_eq!(
        System::<Sys>::unlock_mutex(&MTX),
        Err(UnlockMutexError::IllegalUse)
    );
    audit_invariants::<Sys>(&[&IDLE, &TASK], &[&MTX]);
}

#[test]
fn priority_inheritance_boosts_and_unwinds() {
    sim_kernel!(Sys, levels: 8);
    static IDLE: TaskCb<Sys> = TaskCb::INIT;
    static TASK_L: TaskCb<Sys> = TaskCb::INIT; // low, priority 6
    static TASK_M: TaskCb<Sys> = TaskCb::INIT; // medium, priority 4
    static TASK_H: TaskCb<Sys> = TaskCb::INIT; // high, priority 2
    static MTX: MutexCb<Sys> = MutexCb::INIT;

    System::<Sys>::create_task(&TASK_L, opts(6, true)).unwrap();
    System::<Sys>::create_task(&TASK_M, opts(4, false)).unwrap();
    System::<Sys>::create_task(&TASK_H, opts(2, false)).unwrap();
    System::<Sys>::create_mutex(&MTX, MutexProtocol::Inheritance).unwrap();
    start_scheduler(&IDLE);

    // L (the only active task) takes the mutex
    assert_running(&TASK_L);
    System::<Sys>::lock_mutex(&MTX).unwrap();

    // M appears and preempts L, but never touches the mutex
    System::<Sys>::activate_task(&TASK_M).unwrap();
    assert_running(&TASK_M);

    // H appears, preempts M, and blocks on the mutex
    System::<Sys>::activate_task(&TASK_H).unwrap();
    assert_running(&TASK_H);
    let _ = System::<Sys>::lock_mutex(&MTX);
    assert_eq!(state_of(&TASK_H), TaskSt::WAITING);

    // L inherits H's priority and outruns M
    assert_eq!(effective_priority_of(&TASK_L), 2);
    assert_running(&TASK_L);
    audit_invariants::<Sys>(&[&IDLE, &TASK_L, &TASK_M, &TASK_H], &[&MTX]);

    // On unlock the boost unwinds and the mutex transfers to H
    System::<Sys>::unlock_mutex(&MTX).unwrap();
    assert_eq!(effective_priority_of(&TASK_L), 6);
    assert_eq!(state_of(&TASK_H), TaskSt::RUNNABLE);
    assert_eq!(wait_result_of(&TASK_H), Ok(()));
    assert_running(&TASK_H);
    {
        let mut lock = klock::lock_cpu::<Sys>().unwrap();
        let holder = MTX.owning_task.get(&*lock.borrow_mut());
        assert!(core::ptr::eq(holder.unwrap(), &TASK_H));
    }
    audit_invariants::<Sys>(&[&IDLE, &TASK_L, &TASK_M, &TASK_H], &[&MTX]);

    // H finishes its critical section and leaves; then M, then L
    System::<Sys>::unlock_mutex(&MTX).unwrap();
    System::<Sys>::suspend_task(&TASK_H).unwrap();
    assert_running(&TASK_M);
    System::<Sys>::suspend_task(&TASK_M).unwrap();
    assert_running(&TASK_L);
}

#[test]
fn inheritance_tracks_waiter_departure() {
    sim_kernel!(Sys, levels: 8);
    static IDLE: TaskCb<Sys> = TaskCb::INIT;
    static TASK_L: TaskCb<Sys> = TaskCb::INIT;
    static TASK_H: TaskCb<Sys> = TaskCb::INIT;
    static MTX: MutexCb<Sys> = MutexCb::INIT;

    System::<Sys>::create_task(&TASK_L, opts(6, true)).unwrap();
    System::<Sys>::create_task(&TASK_H, opts(2, false)).unwrap();
    System::<Sys>::create_mutex(&MTX, MutexProtocol::Inheritance).unwrap();
    start_scheduler(&IDLE);

    System::<Sys>::lock_mutex(&MTX).unwrap();
    System::<Sys>::activate_task(&TASK_H).unwrap();
    let _ = System::<Sys>::lock_mutex_timeout(&MTX, 3);
    assert_eq!(effective_priority_of(&TASK_L), 2);

    // H gives up after 3 ticks; L's boost must unwind without any
    // unlock happening
    tick_n::<Sys>(3);
    assert_eq!(state_of(&TASK_H), TaskSt::RUNNABLE);
    assert_eq!(wait_result_of(&TASK_H), Err(WaitTimeoutError::Timeout));
    assert_eq!(effective_priority_of(&TASK_L), 6);
    assert_eq!(System::<Sys>::mutex_is_locked(&MTX), Ok(true));
    audit_invariants::<Sys>(&[&IDLE, &TASK_L, &TASK_H], &[&MTX]);
}

#[test]
fn inheritance_chains_through_blocked_holders() {
    sim_kernel!(Sys, levels: 8);
    static IDLE: TaskCb<Sys> = TaskCb::INIT;
    static TASK_A: TaskCb<Sys> = TaskCb::INIT; // priority 6, holds M1
    static TASK_B: TaskCb<Sys> = TaskCb::INIT; // priority 4, holds M2, waits on M1
    static TASK_H: TaskCb<Sys> = TaskCb::INIT; // priority 1, waits on M2
    static MTX1: MutexCb<Sys> = MutexCb::INIT;
    static MTX2: MutexCb<Sys> = MutexCb::INIT;

    System::<Sys>::create_task(&TASK_A, opts(6, true)).unwrap();
    System::<Sys>::create_task(&TASK_B, opts(4, false)).unwrap();
    System::<Sys>::create_task(&TASK_H, opts(1, false)).unwrap();
    System::<Sys>::create_mutex(&MTX1, MutexProtocol::Inheritance).unwrap();
    System::<Sys>::create_mutex(&MTX2, MutexProtocol::Inheritance).unwrap();
    start_scheduler(&IDLE);

    // A takes M1
    System::<Sys>::lock_mutex(&MTX1).unwrap();

    // B takes M2, then blocks on M1 (held by A): A inherits 4
    System::<Sys>::activate_task(&TASK_B).unwrap();
    assert_running(&TASK_B);
    System::<Sys>::lock_mutex(&MTX2).unwrap();
    let _ = System::<Sys>::lock_mutex(&MTX1);
    assert_eq!(effective_priority_of(&TASK_A), 4);

    // H blocks on M2 (held by B): the boost rides the chain B → A
    System::<Sys>::activate_task(&TASK_H).unwrap();
    assert_running(&TASK_H);
    let _ = System::<Sys>::lock_mutex(&MTX2);
    assert_eq!(effective_priority_of(&TASK_B), 1);
    assert_eq!(effective_priority_of(&TASK_A), 1);
    assert_running(&TASK_A);
    audit_invariants::<Sys>(&[&IDLE, &TASK_A, &TASK_B, &TASK_H], &[&MTX1, &MTX2]);

    // Unwinding in order: A releases M1 to B, B releases M2 to H
    System::<Sys>::unlock_mutex(&MTX1).unwrap();
    assert_eq!(effective_priority_of(&TASK_A), 6);
    assert_running(&TASK_B);
    System::<Sys>::unlock_mutex(&MTX2).unwrap();
    assert_eq!(effective_priority_of(&TASK_B), 4);
    assert_running(&TASK_H);
    audit_invariants::<Sys>(&[&IDLE, &TASK_A, &TASK_B, &TASK_H], &[&MTX1, &MTX2]);
}

#[test]
fn lock_timeout_leaves_the_holder_untouched() {
    sim_kernel!(Sys, levels: 8);
    static IDLE: TaskCb<Sys> = TaskCb::INIT;
    static TASK_A: TaskCb<Sys> = TaskCb::INIT;
    static TASK_B: TaskCb<Sys> = TaskCb::INIT;
    static MTX: MutexCb<Sys> = MutexCb::INIT;

    System::<Sys>::create_task(&TASK_A, opts(3, true)).unwrap();
    System::<Sys>::create_task(&TASK_B, opts(5, true)).unwrap();
    System::<Sys>::create_mutex(&MTX, MutexProtocol::Inheritance).unwrap();
    start_scheduler(&IDLE);

    // A (urgent) takes the mutex and suspends itself; B then tries
    assert_running(&TASK_A);
    System::<Sys>::lock_mutex(&MTX).unwrap();
    System::<Sys>::suspend_task(&TASK_A).unwrap();
    assert_running(&TASK_B);

    // A zero timeout polls
    assert_eq!(
        System::<Sys>::lock_mutex_timeout(&MTX, 0),
        Err(LockMutexTimeoutError::Timeout)
    );
    assert_eq!(state_of(&TASK_B), TaskSt::RUNNABLE);

    let _ = System::<Sys>::lock_mutex_timeout(&MTX, 5);
    assert_eq!(state_of(&TASK_B), TaskSt::WAITING);
    assert_running(&IDLE);

    tick_n::<Sys>(4);
    assert_eq!(state_of(&TASK_B), TaskSt::WAITING);

    // After exactly 5 ticks the wait gives up
    tick_n::<Sys>(1);
    assert_eq!(state_of(&TASK_B), TaskSt::RUNNABLE);
    assert_eq!(wait_result_of(&TASK_B), Err(WaitTimeoutError::Timeout));

    // The holder and its held list are unchanged
    {
        let mut lock = klock::lock_cpu::<Sys>().unwrap();
        let holder = MTX.owning_task.get(&*lock.borrow_mut());
        assert!(core::ptr::eq(holder.unwrap(), &TASK_A));
        assert_eq!(MTX.lock_count.get(&*lock.borrow_mut()), 1);
    }
    audit_invariants::<Sys>(&[&IDLE, &TASK_A, &TASK_B], &[&MTX]);
}

#[test]
fn terminating_the_holder_hands_the_mutex_over() {
    sim_kernel!(Sys, levels: 8);
    static IDLE: TaskCb<Sys> = TaskCb::INIT;
    static TASK_T: TaskCb<Sys> = TaskCb::INIT; // priority 5, the holder
    static TASK_H: TaskCb<Sys> = TaskCb::INIT; // priority 2, the waiter
    static TASK_R: TaskCb<Sys> = TaskCb::INIT; // priority 1, the executioner
    static MTX: MutexCb<Sys> = MutexCb::INIT;

    System::<Sys>::create_task(&TASK_T, opts(5, true)).unwrap();
    System::<Sys>::create_task(&TASK_H, opts(2, false)).unwrap();
    System::<Sys>::create_task(&TASK_R, opts(1, false)).unwrap();
    System::<Sys>::create_mutex(&MTX, MutexProtocol::Inheritance).unwrap();
    start_scheduler(&IDLE);

    System::<Sys>::lock_mutex(&MTX).unwrap();
    System::<Sys>::activate_task(&TASK_H).unwrap();
    assert_running(&TASK_H);
    let _ = System::<Sys>::lock_mutex(&MTX);
    assert_eq!(effective_priority_of(&TASK_T), 2);

    // R terminates T while T holds the boosted mutex
    System::<Sys>::activate_task(&TASK_R).unwrap();
    assert_running(&TASK_R);
    System::<Sys>::terminate_task(&TASK_T).unwrap();

    // T is dormant with its base priority back; H owns the mutex and
    // woke with a success code
    assert_eq!(state_of(&TASK_T), TaskSt::DORMANT);
    assert_eq!(effective_priority_of(&TASK_T), 5);
    assert_eq!(state_of(&TASK_H), TaskSt::RUNNABLE);
    assert_eq!(wait_result_of(&TASK_H), Ok(()));
    {
        let mut lock = klock::lock_cpu::<Sys>().unwrap();
        let holder = MTX.owning_task.get(&*lock.borrow_mut());
        assert!(core::ptr::eq(holder.unwrap(), &TASK_H));
    }
    audit_invariants::<Sys>(&[&IDLE, &TASK_T, &TASK_H, &TASK_R], &[&MTX]);
}

#[test]
fn forced_release_of_a_mutex_wait() {
    sim_kernel!(Sys, levels: 8);
    static IDLE: TaskCb<Sys> = TaskCb::INIT;
    static TASK_A: TaskCb<Sys> = TaskCb::INIT;
    static TASK_B: TaskCb<Sys> = TaskCb::INIT;
    static MTX: MutexCb<Sys> = MutexCb::INIT;

    System::<Sys>::create_task(&TASK_A, opts(3, true)).unwrap();
    System::<Sys>::create_task(&TASK_B, opts(5, true)).unwrap();
    System::<Sys>::create_mutex(&MTX, MutexProtocol::Inheritance).unwrap();
    start_scheduler(&IDLE);

    System::<Sys>::lock_mutex(&MTX).unwrap();
    System::<Sys>::suspend_task(&TASK_A).unwrap();
    assert_running(&TASK_B);
    let _ = System::<Sys>::lock_mutex(&MTX);
    assert_eq!(state_of(&TASK_B), TaskSt::WAITING);
    assert_running(&IDLE);

    // Administrative release: the lock call reports `Interrupted`, the
    // mutex stays with A
    System::<Sys>::resume_task(&TASK_A).unwrap();
    assert_running(&TASK_A);
    System::<Sys>::release_wait(&TASK_B).unwrap();
    assert_eq!(wait_result_of(&TASK_B), Err(WaitTimeoutError::Interrupted));
    assert_eq!(System::<Sys>::mutex_is_locked(&MTX), Ok(true));
    audit_invariants::<Sys>(&[&IDLE, &TASK_A, &TASK_B], &[&MTX]);
}

#[cfg(feature = "priority_ceiling")]
#[test]
fn ceiling_boost_applies_for_the_whole_hold() {
    sim_kernel!(Sys, levels: 8);
    static IDLE: TaskCb<Sys> = TaskCb::INIT;
    static TASK: TaskCb<Sys> = TaskCb::INIT;
    static MTX: MutexCb<Sys> = MutexCb::INIT;

    System::<Sys>::create_task(&TASK, opts(5, true)).unwrap();
    System::<Sys>::create_mutex(&MTX, MutexProtocol::Ceiling(2)).unwrap();
    start_scheduler(&IDLE);

    System::<Sys>::lock_mutex(&MTX).unwrap();
    assert_eq!(effective_priority_of(&TASK), 2);
    audit_invariants::<Sys>(&[&IDLE, &TASK], &[&MTX]);

    System::<Sys>::unlock_mutex(&MTX).unwrap();
    assert_eq!(effective_priority_of(&TASK), 5);
    audit_invariants::<Sys>(&[&IDLE, &TASK], &[&MTX]);
}

#[cfg(feature = "priority_ceiling")]
#[test]
fn ceiling_rejects_an_uncovered_locker() {
    use crate::LockMutexError;

    sim_kernel!(Sys, levels: 8);
    static IDLE: TaskCb<Sys> = TaskCb::INIT;
    static TASK: TaskCb<Sys> = TaskCb::INIT;
    static MTX: MutexCb<Sys> = MutexCb::INIT;

    // The task's base priority (2) is more urgent than the ceiling (4)
    System::<Sys>::create_task(&TASK, opts(2, true)).unwrap();
    System::<Sys>::create_mutex(&MTX, MutexProtocol::Ceiling(4)).unwrap();
    start_scheduler(&IDLE);

    assert_eq!(
        System::<Sys>::lock_mutex(&MTX),
        Err(LockMutexError::IllegalUse)
    );
    assert_eq!(System::<Sys>::mutex_is_locked(&MTX), Ok(false));
}

#[cfg(feature = "deadlock_detection")]
#[test]
fn deadlock_detection_reports_the_cycle() {
    use std::sync::atomic::{AtomicU32, Ordering};

    sim_kernel!(Sys, levels: 8);
    static IDLE: TaskCb<Sys> = TaskCb::INIT;
    static TASK_A: TaskCb<Sys> = TaskCb::INIT;
    static TASK_B: TaskCb<Sys> = TaskCb::INIT;
    static MTX1: MutexCb<Sys> = MutexCb::INIT;
    static MTX2: MutexCb<Sys> = MutexCb::INIT;

    static ACTIVATIONS: AtomicU32 = AtomicU32::new(0);
    static DEACTIVATIONS: AtomicU32 = AtomicU32::new(0);

    fn hook(active: bool, _mutex: &'static MutexCb<Sys>, _task: &'static TaskCb<Sys>) {
        if active {
            ACTIVATIONS.fetch_add(1, Ordering::Relaxed);
        } else {
            DEACTIVATIONS.fetch_add(1, Ordering::Relaxed);
        }
    }

    System::<Sys>::create_task(&TASK_A, opts(3, true)).unwrap();
    System::<Sys>::create_task(&TASK_B, opts(5, true)).unwrap();
    System::<Sys>::create_mutex(&MTX1, MutexProtocol::Inheritance).unwrap();
    System::<Sys>::create_mutex(&MTX2, MutexProtocol::Inheritance).unwrap();
    start_scheduler(&IDLE);
    System::<Sys>::set_deadlock_hook(Some(hook)).unwrap();

    // A takes M1 and blocks on M2 — after B took M2. The second leg
    // closes the cycle.
    assert_running(&TASK_A);
    System::<Sys>::lock_mutex(&MTX1).unwrap();
    System::<Sys>::suspend_task(&TASK_A).unwrap();

    assert_running(&TASK_B);
    System::<Sys>::lock_mutex(&MTX2).unwrap();
    let _ = System::<Sys>::lock_mutex_timeout(&MTX1, 10);
    assert_eq!(ACTIVATIONS.load(Ordering::Relaxed), 0);

    System::<Sys>::resume_task(&TASK_A).unwrap();
    assert_running(&TASK_A);
    let _ = System::<Sys>::lock_mutex_timeout(&MTX2, 10);
    assert_eq!(ACTIVATIONS.load(Ordering::Relaxed), 1);
    assert_eq!(DEACTIVATIONS.load(Ordering::Relaxed), 0);

    // The cycle is broken by a timeout; the hook hears about that too
    tick_n::<Sys>(10);
    assert_eq!(DEACTIVATIONS.load(Ordering::Relaxed), 1);
    audit_invariants::<Sys>(&[&IDLE, &TASK_A, &TASK_B], &[&MTX1, &MTX2]);
}
