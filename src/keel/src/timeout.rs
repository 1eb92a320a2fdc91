//! The tick counter, one-shot timeouts, and time-slice bookkeeping.
//!
//! The kernel is *tickful*: the port's tick driver calls
//! [`PortToKernel::timer_tick`] once per system tick. Each call
//! advances the monotonic tick counter, fires the due timeouts, and
//! charges the running task's time slice.
//!
//! [`PortToKernel::timer_tick`]: crate::PortToKernel::timer_tick
use core::borrow::{Borrow, BorrowMut};
use core::fmt;

use crate::{
    error::{GetTickCountError, SetTimeSliceError},
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    task,
    task::TaskSt,
    utils::{
        intrusive_list::{Ident, ItemError, ListAccessorCell, StaticLink, StaticListHead},
        Init,
    },
    KernelCfg2, KernelTraits, PortThreading, System,
};

/// A duration or point in time, measured in system ticks.
pub type Ticks = u32;

/// Timeout value meaning "wait forever".
pub const WAIT_INFINITE: Ticks = Ticks::MAX;

/// Time-slice length disabling round-robin rotation for a priority.
pub const NO_TIME_SLICE: Ticks = 0;

/// Timeout callback function.
///
/// Called with CPU Lock active from the tick interrupt when the
/// associated [`Timeout`] expires. The callback may wake up tasks; the
/// pending context switch is taken care of by [`handle_tick`].
pub(crate) type TimeoutFn<Traits> = fn(usize, CpuLockGuard<Traits>) -> CpuLockGuard<Traits>;

/// A one-shot timer. Embedded in every TCB to implement wait timeouts.
///
/// A `Timeout` is *active* while it is linked into the kernel's
/// active-timeout list. Expiry (which unlinks it, then calls the
/// callback) and [`cancel`](Self::cancel) are the only ways out of the
/// list, so each activation delivers the callback at most once.
pub(crate) struct Timeout<Traits: PortThreading> {
    /// Links this timeout into [`TimeoutGlobals::active_timeouts`].
    link: CpuLockCell<Traits, Option<StaticLink<Timeout<Traits>>>>,

    /// The expiry time. Meaningful only while active.
    at: CpuLockCell<Traits, Ticks>,

    callback: CpuLockCell<Traits, TimeoutFn<Traits>>,

    /// Parameter given to the callback function.
    callback_param: CpuLockCell<Traits, usize>,
}

impl<Traits: PortThreading> Init for Timeout<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        link: Init::INIT,
        at: Init::INIT,
        callback: CpuLockCell::new(|_, x| x),
        callback_param: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for Timeout<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("link", &self.link)
            .field("at", &self.at)
            .field("callback_param", &self.callback_param)
            .finish_non_exhaustive()
    }
}

/// Get a `ListAccessorCell` used to access the active-timeout list.
macro_rules! timeout_list_accessor {
    ($key:expr) => {
        ListAccessorCell::new(
            &Traits::state().timeout.active_timeouts,
            |timeout: &Timeout<Traits>| &timeout.link,
            $key,
        )
    };
}

impl<Traits: KernelTraits> Timeout<Traits> {
    /// Install the callback. The timeout must not be active.
    pub(crate) fn configure(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        callback: TimeoutFn<Traits>,
        callback_param: usize,
    ) {
        if self.link.get(&*lock).is_some() {
            Traits::fatal_error("reconfiguring an active timer");
        }
        self.callback.replace(&mut *lock, callback);
        self.callback_param.replace(&mut *lock, callback_param);
    }

    pub(crate) fn is_active(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.link.get(&*lock).is_some()
    }

    /// Arm the timer to expire `delay` ticks from now.
    ///
    /// `delay` must be neither `0` nor [`WAIT_INFINITE`] (the wait
    /// engine handles those before reaching the timer), and must be
    /// less than half the tick range so that "due" is distinguishable
    /// from "far in the future" under wrap-around. Starting an
    /// already-active timer is a fatal error.
    pub(crate) fn start(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        delay: Ticks,
    ) {
        debug_assert_ne!(delay, 0);
        debug_assert_ne!(delay, WAIT_INFINITE);

        if self.link.get(&*lock).is_some() {
            Traits::fatal_error("starting an active timer");
        }

        let now = Traits::state().timeout.tick_count.get(&*lock);
        self.at.replace(&mut *lock, now.wrapping_add(delay));

        timeout_list_accessor!((*lock).borrow_mut())
            .push_back(Ident(self))
            .unwrap_or_else(|_| Traits::fatal_error("timer list corrupted"));
    }

    /// Disarm the timer. A no-op if it is not active.
    pub(crate) fn cancel(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        match timeout_list_accessor!((*lock).borrow_mut()).remove(Ident(self)) {
            Ok(_) | Err(ItemError::NotLinked) => {}
            Err(ItemError::Inconsistent(_)) => Traits::fatal_error("timer list corrupted"),
        }
    }
}

/// A kernel-global state for timed event management.
pub(crate) struct TimeoutGlobals<Traits: KernelCfg2> {
    /// Ticks elapsed since the scheduler started. Wraps around.
    tick_count: CpuLockCell<Traits, Ticks>,

    /// All armed one-shot timeouts, in no particular order. The tick
    /// handler scans this for due entries; the list is as short as the
    /// number of concurrently waiting tasks.
    active_timeouts: CpuLockCell<Traits, StaticListHead<Timeout<Traits>>>,

    /// Per-priority time slice lengths. [`NO_TIME_SLICE`] disables
    /// rotation for that priority.
    tslice_ticks: CpuLockCell<Traits, Traits::TimeSliceTable>,
}

impl<Traits: KernelCfg2> Init for TimeoutGlobals<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        tick_count: Init::INIT,
        active_timeouts: Init::INIT,
        tslice_ticks: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for TimeoutGlobals<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimeoutGlobals")
            .field("tick_count", &self.tick_count)
            .field("active_timeouts", &self.active_timeouts)
            .finish_non_exhaustive()
    }
}

/// Is `at` due at time `now`, taking wrap-around into account?
#[inline]
fn is_due(now: Ticks, at: Ticks) -> bool {
    // `at` is always armed at most half the tick range into the
    // future, so anything within the past half-range is due (this also
    // fires overdue timers exactly once)
    now.wrapping_sub(at) < Ticks::MAX / 2
}

/// Implements [`PortToKernel::timer_tick`].
///
/// Precondition: CPU Lock inactive, an interrupt context
///
/// [`PortToKernel::timer_tick`]: crate::PortToKernel::timer_tick
pub(super) fn handle_tick<Traits: KernelTraits>() {
    // The precondition includes CPU Lock being inactive
    let mut lock = klock::lock_cpu::<Traits>()
        .unwrap_or_else(|_| Traits::fatal_error("timer tick with CPU Lock active"));

    let g_timeout = &Traits::state().timeout;
    let now = g_timeout
        .tick_count
        .replace_with(&mut *lock, |t| t.wrapping_add(1))
        .wrapping_add(1);

    // Fire the due timeouts. Each iteration re-scans from the front
    // because a callback may cancel other timeouts (e.g. by waking
    // their tasks) while we run it.
    loop {
        let due = {
            let accessor = timeout_list_accessor!(lock.borrow_mut());
            accessor
                .iter()
                .map(|item| item.unwrap_or_else(|_| Traits::fatal_error("timer list corrupted")))
                .find(|&Ident(timeout)| is_due(now, *timeout.at.read(&**accessor.cell_key())))
        };
        let Some(Ident(timeout)) = due else { break };

        // Unlink before delivering, guaranteeing at-most-once delivery
        timeout_list_accessor!(lock.borrow_mut())
            .remove(Ident(timeout))
            .unwrap_or_else(|_| Traits::fatal_error("timer list corrupted"));

        let callback = timeout.callback.get(&*lock);
        let callback_param = timeout.callback_param.get(&*lock);
        lock = callback(callback_param, lock);
    }

    charge_time_slice(lock.borrow_mut());

    // Callback functions might have woken up some tasks. Check for
    // dispatch and release CPU Lock.
    task::unlock_cpu_and_check_preemption(lock);
}

/// Charge one tick to the running task's time slice; when the slice is
/// used up, reset the account and rotate the task to the tail of its
/// priority's ready queue.
fn charge_time_slice<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let Some(task_cb) = Traits::state().running_task((*lock).borrow_mut()) else {
        return;
    };

    // The running task may have blocked with the resulting context
    // switch still pending; it then no longer owes slice time
    if !task_cb.st.get(&*lock).contains(TaskSt::RUNNABLE) {
        return;
    }

    let priority = task_cb.effective_priority.get(&*lock);
    let slice = Traits::state().timeout.tslice_ticks.read(&*lock).borrow()[priority];
    if slice == NO_TIME_SLICE {
        return;
    }

    let used = task_cb
        .tslice_count
        .replace_with(&mut *lock, |c| c.wrapping_add(1))
        .wrapping_add(1);
    if used >= slice {
        task_cb.tslice_count.replace(&mut *lock, 0);
        // Same priority: degenerates to moving the task to the tail,
        // yielding to the next task of equal priority (if any)
        task::change_running_task_priority((*lock).borrow_mut(), task_cb, priority);
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// Set the time slice length for a priority level.
    /// [`NO_TIME_SLICE`] (the default) disables round-robin rotation at
    /// that level.
    pub fn set_time_slice(priority: usize, ticks: Ticks) -> Result<(), SetTimeSliceError> {
        if cfg!(feature = "param_checking") && priority >= Traits::NUM_PRIORITY_LEVELS - 1 {
            return Err(SetTimeSliceError::BadParam);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;
        Traits::state()
            .timeout
            .tslice_ticks
            .write(&mut *lock)
            .borrow_mut()[priority] = ticks;
        Ok(())
    }

    /// Ticks elapsed since the scheduler started.
    pub fn tick_count() -> Result<Ticks, GetTickCountError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(Traits::state().timeout.tick_count.get(&*lock))
    }
}
