//! Mutexes with recursive locking and priority-boost protocols.
//!
//! Two locking protocols are supported, chosen per mutex at creation:
//!
//!  - **Priority inheritance**: while the mutex is held and has
//!    waiters, the holder runs at the best (numerically smallest)
//!    effective priority among the waiters. Boosts chain transitively
//!    through holders that are themselves blocked on other inheritance
//!    mutexes.
//!  - **Priority ceiling** (feature `priority_ceiling`): the holder is
//!    raised to the mutex's declared ceiling for the whole critical
//!    section.
//!
//! In both cases the holder's effective priority is *recomputed* — the
//! numeric minimum of its base priority, the ceilings of held ceiling
//! mutexes, and the best-waiter priority of held inheritance mutexes —
//! whenever any input of that expression changes.
use core::fmt;

#[cfg(feature = "deadlock_detection")]
use crate::error::SetDeadlockHookError;
use crate::{
    error::{
        CreateMutexError, DeleteMutexError, IllegalUseError, LockMutexError,
        LockMutexTimeoutError, QueryMutexError, UnlockMutexError,
    },
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    state, task,
    task::{TaskCb, TaskSt},
    utils::{
        intrusive_list::{Ident, ListAccessorCell, StaticLink},
        Init,
    },
    wait,
    wait::{WaitOn, WaitQueue},
    KernelTraits, ObjectId, PortThreading, System, Ticks, WAIT_INFINITE,
};

/// The locking protocol of a mutex.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MutexProtocol {
    /// Priority inheritance.
    Inheritance,
    /// Priority ceiling with the given ceiling priority. The ceiling
    /// must be numerically no greater than the base priority of every
    /// task that will ever lock the mutex; a violating lock attempt
    /// fails with `IllegalUse`.
    #[cfg(feature = "priority_ceiling")]
    Ceiling(usize),
}

impl Init for MutexProtocol {
    const INIT: Self = Self::Inheritance;
}

/// *Mutex control block* — the state data of a mutex. The application
/// provides one `'static` instance (initialized to [`MutexCb::INIT`])
/// per mutex and registers it with [`System::create_mutex`].
pub struct MutexCb<Traits: PortThreading> {
    /// The identity tag; holds [`ObjectId::MUTEX`] while the mutex is
    /// live.
    pub(crate) id: CpuLockCell<Traits, ObjectId>,

    pub(crate) protocol: CpuLockCell<Traits, MutexProtocol>,

    /// The task that currently owns the mutex lock.
    pub(crate) owning_task: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    /// The recursive lock count. Non-zero iff `owning_task` is `Some`.
    pub(crate) lock_count: CpuLockCell<Traits, u32>,

    /// Tasks blocked trying to acquire the mutex, FIFO.
    pub(crate) wait_queue: WaitQueue<Traits>,

    /// Links this mutex into the holder's held-mutex list
    /// ([`TaskCb::held_mutexes`]).
    ///
    /// [`TaskCb::held_mutexes`]: crate::task::TaskCb
    pub(crate) held_link: CpuLockCell<Traits, Option<StaticLink<MutexCb<Traits>>>>,
}

impl<Traits: PortThreading> Init for MutexCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        id: Init::INIT,
        protocol: Init::INIT,
        owning_task: Init::INIT,
        lock_count: Init::INIT,
        wait_queue: Init::INIT,
        held_link: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for MutexCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutexCb")
            .field("self", &(self as *const _))
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field(
                "owning_task",
                // break the cycle (TaskCb → MutexCb → TaskCb → …)
                &self
                    .owning_task
                    .debug_fmt_with(|t, f| t.map(|t| t as *const _).fmt(f)),
            )
            .field("lock_count", &self.lock_count)
            .field("wait_queue", &self.wait_queue)
            .finish_non_exhaustive()
    }
}

/// Notification hook for the deadlock detector, registered with
/// [`System::set_deadlock_hook`]. Invoked under the kernel's critical
/// section with `active = true` when a blocking lock closes a wait-for
/// cycle, and with `active = false` when the wait of the task that
/// closed the cycle is completed (by timeout, forced release, or an
/// eventual wake).
#[cfg(feature = "deadlock_detection")]
pub type DeadlockHook<Traits> = fn(active: bool, &'static MutexCb<Traits>, &'static TaskCb<Traits>);

/// Get a `ListAccessorCell` for a task's held-mutex list.
macro_rules! held_list_accessor {
    ($task:expr, $key:expr) => {
        ListAccessorCell::new(
            &$task.held_mutexes,
            |mutex_cb: &MutexCb<Traits>| &mutex_cb.held_link,
            $key,
        )
    };
}

// Public API
// ---------------------------------------------------------------------------

impl<Traits: KernelTraits> System<Traits> {
    /// Register `mutex_cb` as a mutex with the given locking protocol.
    ///
    /// Legal from a task context or during boot.
    pub fn create_mutex(
        mutex_cb: &'static MutexCb<Traits>,
        protocol: MutexProtocol,
    ) -> Result<(), CreateMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_or_boot_context::<Traits>(lock.borrow_mut())?;

        if cfg!(feature = "param_checking") {
            if mutex_cb.id.get(&*lock) == ObjectId::MUTEX {
                return Err(CreateMutexError::BadParam);
            }
            #[cfg(feature = "priority_ceiling")]
            if let MutexProtocol::Ceiling(ceiling) = protocol {
                if ceiling >= Traits::NUM_PRIORITY_LEVELS - 1 {
                    return Err(CreateMutexError::BadParam);
                }
            }
        }

        mutex_cb.protocol.replace(&mut *lock, protocol);
        mutex_cb.owning_task.replace(&mut *lock, None);
        mutex_cb.lock_count.replace(&mut *lock, 0);
        mutex_cb.held_link.replace(&mut *lock, None);
        mutex_cb.id.replace(&mut *lock, ObjectId::MUTEX);

        Ok(())
    }

    /// Unregister a mutex. The mutex must be free: no holder, no
    /// waiters.
    pub fn delete_mutex(mutex_cb: &'static MutexCb<Traits>) -> Result<(), DeleteMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        expect_valid_mutex(lock.borrow_mut(), mutex_cb)?;

        if mutex_cb.owning_task.get(&*lock).is_some()
            || !mutex_cb.wait_queue.is_empty(lock.borrow_mut())
        {
            return Err(DeleteMutexError::BadObjectState);
        }

        mutex_cb.id.replace(&mut *lock, ObjectId::NONE);
        Ok(())
    }

    /// Acquire the mutex, waiting indefinitely while another task holds
    /// it. Re-acquisition by the holder increments the recursion count
    /// and succeeds immediately.
    pub fn lock_mutex(mutex_cb: &'static MutexCb<Traits>) -> Result<(), LockMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        expect_valid_mutex(lock.borrow_mut(), mutex_cb)?;

        let running_task = task::expect_running_task(lock.borrow_mut());
        if try_acquire(lock.borrow_mut(), mutex_cb, running_task)? {
            return Ok(());
        }

        block_on_mutex(lock, mutex_cb, WAIT_INFINITE);

        // Running again — the unlocker has either handed the mutex over
        // (`Ok`) or the wait was forcibly released
        let mut lock = klock::lock_cpu::<Traits>()?;
        let result = running_task.wait.result.get(&*lock.borrow_mut());
        drop(lock);

        result.map_err(crate::error::expect_not_timeout)
    }

    /// [`lock_mutex`](Self::lock_mutex) bounded by a timeout in ticks.
    /// A zero timeout polls: it fails with `Timeout` right away when
    /// the mutex is held by another task.
    pub fn lock_mutex_timeout(
        mutex_cb: &'static MutexCb<Traits>,
        timeout: Ticks,
    ) -> Result<(), LockMutexTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        expect_valid_mutex(lock.borrow_mut(), mutex_cb)?;

        let running_task = task::expect_running_task(lock.borrow_mut());
        if try_acquire(lock.borrow_mut(), mutex_cb, running_task)? {
            return Ok(());
        }

        if timeout == 0 {
            return Err(LockMutexTimeoutError::Timeout);
        }

        block_on_mutex(lock, mutex_cb, timeout);

        let mut lock = klock::lock_cpu::<Traits>()?;
        let result = running_task.wait.result.get(&*lock.borrow_mut());
        drop(lock);

        result.map_err(LockMutexTimeoutError::from)
    }

    /// Release the mutex. Only the holder may call this; a recursive
    /// hold is released one level at a time. On the final release the
    /// holder's priority boost unwinds and ownership transfers to the
    /// longest-waiting task, if any.
    pub fn unlock_mutex(mutex_cb: &'static MutexCb<Traits>) -> Result<(), UnlockMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        expect_valid_mutex(lock.borrow_mut(), mutex_cb)?;

        let running_task = task::expect_running_task(lock.borrow_mut());

        if ptr_from_option_ref(mutex_cb.owning_task.get(&*lock)) != running_task as *const _ {
            return Err(UnlockMutexError::IllegalUse);
        }

        let count = mutex_cb.lock_count.get(&*lock);
        if count > 1 {
            mutex_cb.lock_count.replace(&mut *lock, count - 1);
            return Ok(());
        }

        release_held(lock.borrow_mut(), mutex_cb, running_task);
        transfer_or_free(lock.borrow_mut(), mutex_cb);

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Get a flag indicating whether the mutex is currently held by
    /// some task.
    pub fn mutex_is_locked(mutex_cb: &'static MutexCb<Traits>) -> Result<bool, QueryMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        expect_valid_mutex(lock.borrow_mut(), mutex_cb)?;
        Ok(mutex_cb.owning_task.get(&*lock).is_some())
    }

    /// Register the deadlock notification hook. Pass `None` to remove
    /// it.
    #[cfg(feature = "deadlock_detection")]
    pub fn set_deadlock_hook(
        hook: Option<DeadlockHook<Traits>>,
    ) -> Result<(), SetDeadlockHookError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Traits::state().deadlock_hook.replace(&mut *lock, hook);
        Ok(())
    }
}

// Validation
// ---------------------------------------------------------------------------

#[inline]
fn expect_valid_mutex<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &MutexCb<Traits>,
) -> Result<(), crate::error::BadIdError> {
    if cfg!(feature = "param_checking") && mutex_cb.id.get(&*lock) != ObjectId::MUTEX {
        return Err(crate::error::BadIdError::BadId);
    }
    Ok(())
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        core::ptr::null()
    }
}

// Acquisition
// ---------------------------------------------------------------------------

/// Try to satisfy a lock request without waiting.
///
///  - `Ok(true)` — acquired, or the recursion count was incremented.
///  - `Ok(false)` — held by another task; the caller must wait (or give
///    up, for a polling request).
///  - `Err(IllegalUse)` — recursion overflow, or the ceiling protocol
///    forbids this task from locking the mutex.
fn try_acquire<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    running_task: &'static TaskCb<Traits>,
) -> Result<bool, IllegalUseError> {
    if ptr_from_option_ref(mutex_cb.owning_task.get(&*lock)) == running_task as *const _ {
        let count = mutex_cb.lock_count.get(&*lock);
        if count == u32::MAX {
            return Err(IllegalUseError::IllegalUse);
        }
        mutex_cb.lock_count.replace(&mut *lock, count + 1);
        return Ok(true);
    }

    #[cfg(feature = "priority_ceiling")]
    if cfg!(feature = "param_checking") {
        if let MutexProtocol::Ceiling(ceiling) = mutex_cb.protocol.get(&*lock) {
            // A ceiling numerically greater than the locker's base
            // priority would not cover the locker
            if ceiling > running_task.base_priority.get(&*lock) {
                return Err(IllegalUseError::IllegalUse);
            }
        }
    }

    if mutex_cb.owning_task.get(&*lock).is_none() {
        lock_core(lock.borrow_mut(), mutex_cb, running_task);
        return Ok(true);
    }

    Ok(false)
}

/// Give the ownership of the mutex to `task_cb` and apply the
/// protocol's boost: the ceiling for a ceiling mutex, the best waiter's
/// priority for an inheritance mutex that already has waiters
/// (ownership transfer). Boosts only ever raise the urgency here; the
/// unwinding direction is handled by [`recompute_held_boost`] on
/// removal events.
fn lock_core<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    mutex_cb.owning_task.replace(&mut *lock, Some(task_cb));
    mutex_cb.lock_count.replace(&mut *lock, 1);

    held_list_accessor!(task_cb, lock.borrow_mut())
        .push_back(Ident(mutex_cb))
        .unwrap_or_else(|_| Traits::fatal_error("mutex is already held"));

    match mutex_cb.protocol.get(&*lock) {
        MutexProtocol::Inheritance => {
            if let Some(waiter) = mutex_cb.wait_queue.best_waiter_priority(lock.borrow_mut()) {
                boost_to(lock.borrow_mut(), task_cb, waiter);
            }
        }
        #[cfg(feature = "priority_ceiling")]
        MutexProtocol::Ceiling(ceiling) => {
            boost_to(lock.borrow_mut(), task_cb, ceiling);
        }
    }
}

/// Block the current task on the mutex and pend the context switch.
fn block_on_mutex<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    timeout: Ticks,
) {
    wait::wait_current(
        lock.borrow_mut(),
        Some(&mutex_cb.wait_queue),
        WaitOn::Mutex(mutex_cb),
        timeout,
    );

    // The new waiter may sharpen the holder's inherited priority
    if matches!(mutex_cb.protocol.get(&*lock), MutexProtocol::Inheritance) {
        if let Some(holder) = mutex_cb.owning_task.get(&*lock) {
            let waiter = task::expect_running_task(lock.borrow_mut())
                .effective_priority
                .get(&*lock);
            boost_to(lock.borrow_mut(), holder, waiter);
        }
    }

    #[cfg(feature = "deadlock_detection")]
    check_deadlock(lock.borrow_mut(), mutex_cb);

    task::unlock_cpu_and_check_preemption(lock);
}

// Release
// ---------------------------------------------------------------------------

/// Detach the mutex from the holder's held-mutex list and unwind the
/// holder's boost. Does not touch `owning_task`; follow with
/// [`transfer_or_free`].
fn release_held<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    holder: &'static TaskCb<Traits>,
) {
    held_list_accessor!(holder, lock.borrow_mut())
        .remove(Ident(mutex_cb))
        .unwrap_or_else(|_| Traits::fatal_error("mutex is not in the holder's list"));

    recompute_held_boost(lock.borrow_mut(), holder);
}

/// Hand the mutex to its longest-waiting task, waking it with `Ok`, or
/// mark the mutex free if nobody is waiting. The ownership transfer
/// runs as the wake's transfer callback, under the same critical
/// section as the wake itself.
fn transfer_or_free<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    let woken = wait::first_wait_complete(lock.borrow_mut(), &mutex_cb.wait_queue, Ok(()), {
        |lock, next_holder| lock_core(lock, mutex_cb, next_holder)
    });

    if !woken {
        mutex_cb.owning_task.replace(&mut *lock, None);
        mutex_cb.lock_count.replace(&mut *lock, 0);
    }
}

/// Release every mutex in `task_cb`'s held list, handing each to its
/// next waiter. Invoked on task termination.
pub(crate) fn unlock_all_by_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    loop {
        let front = held_list_accessor!(task_cb, lock.borrow_mut()).front();
        let Some(Ident(mutex_cb)) = front else { break };

        release_held(lock.borrow_mut(), mutex_cb, task_cb);
        transfer_or_free(lock.borrow_mut(), mutex_cb);
    }
}

// Priority recomputation
// ---------------------------------------------------------------------------

/// Reevaluate the task's effective priority from its base priority and
/// held mutexes, and return the result.
///
/// This is the single deterministic definition of a holder's priority:
/// the numeric minimum of the base priority, the ceiling of every held
/// ceiling mutex, and the best-waiter priority of every held
/// inheritance mutex.
pub(crate) fn evaluate_task_effective_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) -> usize {
    let mut priority = task_cb.base_priority.get(&*lock);

    let mut cursor = held_list_accessor!(task_cb, lock.borrow_mut()).front();
    while let Some(Ident(mutex_cb)) = cursor {
        match mutex_cb.protocol.get(&*lock) {
            MutexProtocol::Inheritance => {
                if let Some(waiter) = mutex_cb.wait_queue.best_waiter_priority(lock.borrow_mut())
                {
                    priority = priority.min(waiter);
                }
            }
            #[cfg(feature = "priority_ceiling")]
            MutexProtocol::Ceiling(ceiling) => {
                priority = priority.min(ceiling);
            }
        }

        cursor = held_list_accessor!(task_cb, lock.borrow_mut())
            .next(Ident(mutex_cb))
            .unwrap_or_else(|_| Traits::fatal_error("held-mutex list corrupted"));
    }

    priority
}

/// Recompute and apply a holder's effective priority after an input of
/// the boost equation was removed (a waiter left, or a mutex was
/// released).
pub(crate) fn recompute_held_boost<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    let priority = evaluate_task_effective_priority(lock.borrow_mut(), task_cb);
    set_task_effective_priority(lock, task_cb, priority);
}

/// Raise `task_cb`'s urgency to `priority` if it isn't there already.
fn boost_to<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    priority: usize,
) {
    if priority < task_cb.effective_priority.get(&*lock) {
        set_task_effective_priority(lock, task_cb, priority);
    }
}

/// Apply a new effective priority to a task, keeping the scheduler
/// structures consistent and propagating the change along the wait
/// chain:
///
///  - a runnable task is repositioned within the ready structure (tail
///    of the new priority, the round-robin tie-break);
///  - a task waiting on an inheritance mutex feeds into that mutex
///    holder's boost, which is therefore recomputed — transitively, if
///    the holder is itself waiting.
///
/// The propagation terminates: each step either changes some task's
/// priority downward-bounded by priority 0 or stops at an unchanged
/// value, so even a cyclic wait chain (a deadlock) converges.
pub(crate) fn set_task_effective_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    priority: usize,
) {
    if task_cb.effective_priority.get(&*lock) == priority {
        return;
    }

    let st = task_cb.st.get(&*lock);
    if st.contains(TaskSt::RUNNABLE) {
        task::change_running_task_priority(lock.borrow_mut(), task_cb, priority);
        return;
    }

    task_cb.effective_priority.replace(&mut *lock, priority);

    if st.contains(TaskSt::WAITING) {
        if let Some(WaitOn::Mutex(mutex_cb)) = task_cb.wait.wait_on.get(&*lock) {
            if matches!(mutex_cb.protocol.get(&*lock), MutexProtocol::Inheritance) {
                if let Some(holder) = mutex_cb.owning_task.get(&*lock) {
                    recompute_held_boost(lock.borrow_mut(), holder);
                }
            }
        }
    }
}

/// Post-wait handling for a task that was blocked on `mutex_cb` and has
/// just been detached from its wait queue: the departure may relax the
/// holder's inherited boost, and ends any deadlock the waiter was part
/// of.
pub(crate) fn on_waiter_removed<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    #[cfg(not(feature = "deadlock_detection"))]
    let _ = task_cb;

    if matches!(mutex_cb.protocol.get(&*lock), MutexProtocol::Inheritance) {
        if let Some(holder) = mutex_cb.owning_task.get(&*lock) {
            recompute_held_boost(lock.borrow_mut(), holder);
        }
    }

    #[cfg(feature = "deadlock_detection")]
    if task_cb.in_deadlock.replace(&mut *lock, false) {
        if let Some(hook) = Traits::state().deadlock_hook.get(&*lock) {
            hook(false, mutex_cb, task_cb);
        }
    }
}

// Deadlock detection
// ---------------------------------------------------------------------------

/// Follow the waits-for chain starting at `mutex_cb`'s holder. The
/// current task has just been enqueued on `mutex_cb`; if the chain
/// leads back to it, the lock closed a cycle. The lock still proceeds
/// to wait — detection is advisory and reported through the hook.
#[cfg(feature = "deadlock_detection")]
fn check_deadlock<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    let waiter = match Traits::state().running_task(lock.borrow_mut()) {
        Some(task) => task,
        None => return,
    };

    let mut chain_mutex = mutex_cb;
    loop {
        let Some(holder) = chain_mutex.owning_task.get(&*lock) else {
            return;
        };

        if core::ptr::eq(holder, waiter) {
            waiter.in_deadlock.replace(&mut *lock, true);
            if let Some(hook) = Traits::state().deadlock_hook.get(&*lock) {
                hook(true, mutex_cb, waiter);
            }
            return;
        }

        match holder.wait.wait_on.get(&*lock) {
            Some(WaitOn::Mutex(next)) => chain_mutex = next,
            _ => return,
        }
    }
}
