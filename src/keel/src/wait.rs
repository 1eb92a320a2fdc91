//! Wait queues and the machinery for blocking, waking, and forcibly
//! releasing tasks.
use core::fmt;

use crate::{
    error::WaitTimeoutError,
    klock::{CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    mutex, task,
    task::{TaskCb, TaskSt},
    utils::{
        intrusive_list::{Ident, ListAccessorCell, StaticListHead},
        Init,
    },
    KernelTraits, PortThreading, Ticks, WAIT_INFINITE,
};

/// What a waiting task is blocked on. Stored in the TCB so that the
/// wake path can dispatch reason-specific handling (and, for mutex
/// waits, find the mutex from the waiter).
pub(crate) enum WaitOn<Traits: PortThreading> {
    /// `sleep`; `wakeup_task` is the only normal wake source.
    Sleep,
    /// A mutex acquisition.
    Mutex(&'static mutex::MutexCb<Traits>),
}

impl<Traits: PortThreading> Clone for WaitOn<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for WaitOn<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for WaitOn<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Sleep => f.write_str("Sleep"),
            Self::Mutex(mutex) => write!(f, "Mutex({:p})", *mutex),
        }
    }
}

/// A FIFO queue of tasks blocked on a particular waitable object. The
/// queue links the waiting tasks' [`TaskCb::link`] directly — a task is
/// in at most one wait queue, and never in a wait queue and a ready
/// queue at once.
///
/// [`TaskCb::link`]: crate::task::TaskCb
pub(crate) struct WaitQueue<Traits: PortThreading> {
    waits: CpuLockCell<Traits, StaticListHead<TaskCb<Traits>>>,
}

impl<Traits: PortThreading> Init for WaitQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self { waits: Init::INIT };
}

/// Get a `ListAccessorCell` used to access a wait queue.
macro_rules! wait_queue_accessor {
    ($queue:expr, $key:expr) => {
        ListAccessorCell::new(&$queue.waits, |task_cb: &TaskCb<_>| &task_cb.link, $key)
    };
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    /// Get the next task to be woken up (the head, FIFO).
    pub(crate) fn first_waiting_task(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        wait_queue_accessor!(self, lock)
            .front()
            .map(|Ident(task)| task)
    }

    pub(crate) fn is_empty(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        wait_queue_accessor!(self, lock).is_empty()
    }

    /// The best (numerically smallest) effective priority among all
    /// waiters. The queue is FIFO, so this scans every waiter; used by
    /// the priority-inheritance recomputation.
    pub(crate) fn best_waiter_priority(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<usize> {
        let accessor = wait_queue_accessor!(self, lock);
        let mut best = None;
        for item in accessor.iter() {
            let Ident(task) =
                item.unwrap_or_else(|_| Traits::fatal_error("wait queue corrupted"));
            let priority = *task.effective_priority.read(&**accessor.cell_key());
            best = Some(match best {
                Some(b) if b <= priority => b,
                _ => priority,
            });
        }
        best
    }
}

impl<Traits: KernelTraits> fmt::Debug for WaitQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("waits", &self.waits)
            .finish()
    }
}

/// The wait state of a task, embedded in the TCB.
pub(crate) struct TaskWait<Traits: PortThreading> {
    /// `Some(_)` iff the task is in the Waiting state.
    pub(crate) wait_on: CpuLockCell<Traits, Option<WaitOn<Traits>>>,

    /// The wait queue the task is enqueued on. `None` for queue-less
    /// waits (sleep) and whenever the task is not waiting. Must agree
    /// with the linkage of [`TaskCb::link`].
    ///
    /// [`TaskCb::link`]: crate::task::TaskCb
    pub(crate) queue: CpuLockCell<Traits, Option<&'static WaitQueue<Traits>>>,

    /// The result of the last wait operation. Written by the waking
    /// party, returned by the blocking API after the task resumes.
    pub(crate) result: CpuLockCell<Traits, Result<(), WaitTimeoutError>>,
}

impl<Traits: PortThreading> Init for TaskWait<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        wait_on: Init::INIT,
        queue: Init::INIT,
        result: CpuLockCell::new(Ok(())),
    };
}

impl<Traits: KernelTraits> fmt::Debug for TaskWait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskWait")
            .field("wait_on", &self.wait_on)
            .field(
                "queue",
                &self
                    .queue
                    .debug_fmt_with(|q, f| q.map(|q| q as *const _).fmt(f)),
            )
            .field("result", &self.result)
            .finish()
    }
}

/// Reset a task's wait state at creation time.
pub(crate) fn init_task_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    task_cb.wait.wait_on.replace(&mut *lock, None);
    task_cb.wait.queue.replace(&mut *lock, None);
    task_cb.wait.result.replace(&mut *lock, Ok(()));
}

/// Transition the currently running task into the Waiting state:
/// remove it from the ready structure, record the wait reason, append
/// it to `queue` (FIFO) if one is given, and start the task's one-shot
/// timer unless `timeout` is [`WAIT_INFINITE`].
///
/// The caller pends the context switch after closing the critical
/// section; the wake cause is later found in the task's
/// [`TaskWait::result`].
pub(crate) fn wait_current<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    queue: Option<&'static WaitQueue<Traits>>,
    wait_on: WaitOn<Traits>,
    timeout: Ticks,
) {
    let task_cb = task::expect_running_task(lock.borrow_mut());

    task::make_unrunnable(lock.borrow_mut(), task_cb);
    set_waiting(lock.borrow_mut(), task_cb, queue, wait_on, timeout);
}

fn set_waiting<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    queue: Option<&'static WaitQueue<Traits>>,
    wait_on: WaitOn<Traits>,
    timeout: Ticks,
) {
    let st = task_cb.st.get(&*lock);
    if !(st & !TaskSt::SUSPENDED).is_empty() {
        Traits::fatal_error("set_waiting: only SUSPENDED may be set");
    }
    if timeout == 0 {
        Traits::fatal_error("set_waiting: zero timeout must be handled by the caller");
    }
    if task_cb.timer.is_active(lock.borrow_mut()) {
        Traits::fatal_error("set_waiting: wait timer is already running");
    }

    task_cb.st.replace_with(&mut *lock, |st| *st | TaskSt::WAITING);
    task_cb.wait.wait_on.replace(&mut *lock, Some(wait_on));

    if let Some(queue) = queue {
        wait_queue_accessor!(queue, lock.borrow_mut())
            .push_back(Ident(task_cb))
            .unwrap_or_else(|_| Traits::fatal_error("waiting task is still in a queue"));
        task_cb.wait.queue.replace(&mut *lock, Some(queue));
    }

    if timeout != WAIT_INFINITE {
        task_cb.timer.start(lock.borrow_mut(), timeout);
    }
}

/// Take a task out of the Waiting state *without* making it runnable:
/// detach it from its wait queue (a no-op if it is not on one), run the
/// reason-specific post-wait handling, record `result` as the wake
/// cause, and cancel the wait timer.
///
/// The detach happens before the reason hook because the
/// priority-inheritance recomputation inspects the remaining waiters of
/// the mutex.
pub(crate) fn clear_waiting<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    result: Result<(), WaitTimeoutError>,
) {
    let st = task_cb.st.get(&*lock);
    if !st.contains(TaskSt::WAITING)
        || !(st & !(TaskSt::WAITING | TaskSt::SUSPENDED)).is_empty()
    {
        Traits::fatal_error("clear_waiting: bad state");
    }
    if task_cb.wait.queue.get(&*lock).is_some() != task_cb.link.get(&*lock).is_some() {
        Traits::fatal_error("clear_waiting: queue backref and link are out of sync");
    }

    if let Some(queue) = task_cb.wait.queue.get(&*lock) {
        wait_queue_accessor!(queue, lock.borrow_mut())
            .remove(Ident(task_cb))
            .unwrap_or_else(|_| Traits::fatal_error("waiting task is not in its wait queue"));
    }

    let wait_on = task_cb.wait.wait_on.get(&*lock);
    if let Some(WaitOn::Mutex(mutex_cb)) = wait_on {
        mutex::on_waiter_removed(lock.borrow_mut(), task_cb, mutex_cb);
    }

    task_cb.wait.queue.replace(&mut *lock, None);
    task_cb.wait.wait_on.replace(&mut *lock, None);
    task_cb.wait.result.replace(&mut *lock, result);
    task_cb.timer.cancel(lock.borrow_mut());
    task_cb
        .st
        .replace_with(&mut *lock, |st| *st & !TaskSt::WAITING);
}

/// Complete a task's wait: [`clear_waiting`], then make the task
/// runnable — unless it is also suspended, in which case it stays
/// blocked in the Suspended state.
///
/// This may change the scheduling decision but doesn't yield the
/// processor; call `unlock_cpu_and_check_preemption` as needed.
pub(crate) fn complete_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    result: Result<(), WaitTimeoutError>,
) {
    clear_waiting(lock.borrow_mut(), task_cb, result);

    if !task_cb.st.get(&*lock).contains(TaskSt::SUSPENDED) {
        task::make_runnable(lock.borrow_mut(), task_cb);
    }
}

/// Wake up the head of `queue` (FIFO) with the given result code,
/// invoking `transfer` on the task right before it is woken — under the
/// same critical section, so the callback can move ownership or data
/// between the waker and the waiter atomically. Returns whether a task
/// was woken.
pub(crate) fn first_wait_complete<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    queue: &WaitQueue<Traits>,
    result: Result<(), WaitTimeoutError>,
    transfer: impl for<'a> FnOnce(CpuLockTokenRefMut<'a, Traits>, &'static TaskCb<Traits>),
) -> bool {
    if let Some(task_cb) = queue.first_waiting_task(lock.borrow_mut()) {
        transfer(lock.borrow_mut(), task_cb);
        complete_wait(lock.borrow_mut(), task_cb, result);
        true
    } else {
        false
    }
}

/// The expiry callback installed in every task's wait timer. `param` is
/// the `TaskCb` address, fixed at task creation.
pub(crate) fn wait_timeout_handler<Traits: KernelTraits>(
    param: usize,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    // Safety: We are just converting `param` back to the original form
    let task_cb = unsafe { &*(param as *const TaskCb<Traits>) };

    // The timer engine guarantees at-most-once delivery, but the task
    // may have been woken within the same tick before this callback ran
    if task_cb.st.get(&*lock).contains(TaskSt::WAITING) {
        complete_wait(
            lock.borrow_mut(),
            task_cb,
            Err(WaitTimeoutError::Timeout),
        );
    }

    lock
}
