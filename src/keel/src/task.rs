//! Tasks: the control block, the state machine, and the lifecycle
//! services.
use core::convert::Infallible;
use core::fmt;
use core::ptr;

use crate::{
    error::{
        ActivateTaskError, BadIdError, BadObjectStateError, CreateTaskError, DeleteTaskError,
        ExitTaskError, GetCurrentTaskError, GetTaskCountError, GetTaskPriorityError,
        GetTaskStateError, ReleaseWaitError, ResumeTaskError, SetTaskPriorityError, SleepError,
        SuspendTaskError, TerminateTaskError, WaitTimeoutError, WakeupTaskError,
    },
    klock, mutex, state, timeout,
    utils::{
        intrusive_list::{Ident, ListAccessorCell, StaticLink, StaticListHead},
        Init,
    },
    wait, KernelTraits, ObjectId, PortThreading, System, Ticks, UWord, STACK_FILL_VAL,
};

#[doc(hidden)]
pub mod readyqueue;
use self::readyqueue::Queue as _;

/// A task's stack region: a caller-supplied `[UWord]` the kernel fills
/// with [`STACK_FILL_VAL`] at creation and the port builds context
/// frames in.
#[derive(Clone, Copy)]
pub struct TaskStack {
    base: *mut UWord,
    len: usize,
}

// Safety: Safe code cannot access the pointee through a shared
// `TaskStack`; the port is responsible for using it correctly.
unsafe impl Send for TaskStack {}
unsafe impl Sync for TaskStack {}

impl TaskStack {
    /// Construct a `TaskStack` from an exclusively borrowed static
    /// buffer.
    pub fn new(buffer: &'static mut [UWord]) -> Self {
        Self {
            base: buffer.as_mut_ptr(),
            len: buffer.len(),
        }
    }

    /// Construct a `TaskStack` from raw parts.
    ///
    /// # Safety
    ///
    /// `base` must point to a region of `len` `UWord`s that is valid
    /// for reads and writes for `'static` and is not accessed by
    /// anything but the kernel, the port, and the owning task.
    pub const unsafe fn from_raw_parts(base: *mut UWord, len: usize) -> Self {
        Self { base, len }
    }

    /// Get a raw pointer to the stack region. The port uses this to
    /// locate either end of the stack, depending on the direction the
    /// architecture's stacks grow in.
    #[inline]
    pub fn as_ptr(&self) -> *mut [UWord] {
        ptr::slice_from_raw_parts_mut(self.base, self.len)
    }

    /// The stack length in `UWord`s.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Init for TaskStack {
    const INIT: Self = Self {
        base: ptr::null_mut(),
        len: 0,
    };
}

impl fmt::Debug for TaskStack {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskStack")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

/// The properties of a task fixed by `create_task`, read by the port
/// when constructing the initial context frame.
#[derive(Clone, Copy, Debug)]
pub struct TaskAttr {
    /// The entry point of the task.
    ///
    /// # Safety
    ///
    /// This is only meant to be used by a kernel port, as a task entry
    /// point, not by user code. Using this in other ways may cause an
    /// undefined behavior.
    pub entry_point: unsafe fn(usize),

    /// The parameter supplied for `entry_point`.
    pub entry_param: usize,

    /// The stack region for the task.
    pub stack: TaskStack,
}

unsafe fn unreachable_entry(_: usize) {
    unreachable!("entry point of a task that was never created")
}

impl Init for TaskAttr {
    const INIT: Self = Self {
        entry_point: unreachable_entry,
        entry_param: 0,
        stack: TaskStack::INIT,
    };
}

bitflags::bitflags! {
    /// The task state bit-set.
    ///
    /// `DORMANT` is exclusive; `RUNNABLE` is exclusive of
    /// `WAITING`/`SUSPENDED`; `WAITING` and `SUSPENDED` may coexist (a
    /// suspended task that was already waiting remains both). The empty
    /// set is a transient used only between clearing one flag and
    /// setting another inside a critical section.
    pub struct TaskSt: u8 {
        /// The task is eligible for execution and linked into a ready
        /// queue.
        const RUNNABLE = 1 << 0;
        /// The task is blocked on an event, a timeout, or both.
        const WAITING = 1 << 1;
        /// The task was administratively suspended.
        const SUSPENDED = 1 << 2;
        /// The task exists but is not scheduled; its stack is prepared
        /// for the first dispatch.
        const DORMANT = 1 << 3;
    }
}

impl Init for TaskSt {
    const INIT: Self = TaskSt::empty();
}

/// *Task control block* — the state data of a task. The application
/// provides one `'static` instance (initialized to [`TaskCb::INIT`])
/// per task and registers it with [`System::create_task`].
#[repr(C)]
pub struct TaskCb<Traits: PortThreading> {
    /// Port-specific state (e.g. the saved stack pointer).
    ///
    /// This is guaranteed to be placed at the beginning of the struct
    /// so that assembly code can refer to this easily.
    pub port_task_state: Traits::PortTaskState,

    /// The identity tag; holds [`ObjectId::TASK`] while the task is
    /// live.
    pub(crate) id: klock::CpuLockCell<Traits, ObjectId>,

    /// The properties fixed at creation.
    pub(crate) attr: klock::CpuLockCell<Traits, TaskAttr>,

    /// The priority assigned at creation.
    pub(crate) base_priority: klock::CpuLockCell<Traits, usize>,

    /// The priority the scheduler actually uses. Deviates from
    /// `base_priority` while boosted by a mutex locking protocol or
    /// changed by `change_task_priority`; restored to `base_priority`
    /// when the task goes dormant.
    pub(crate) effective_priority: klock::CpuLockCell<Traits, usize>,

    pub(crate) st: klock::CpuLockCell<Traits, TaskSt>,

    /// Links the task into exactly one of: a ready queue (while
    /// `RUNNABLE`) or a wait queue (while `WAITING` on a queue-based
    /// event). Detached otherwise.
    pub(crate) link: klock::CpuLockCell<Traits, Option<StaticLink<TaskCb<Traits>>>>,

    /// Links the task into the process-wide created-task list.
    pub(crate) create_link: klock::CpuLockCell<Traits, Option<StaticLink<TaskCb<Traits>>>>,

    /// The wait state of the task.
    pub(crate) wait: wait::TaskWait<Traits>,

    /// The one-shot timer backing this task's wait timeouts.
    pub(crate) timer: timeout::Timeout<Traits>,

    /// The mutexes this task currently holds, linked through
    /// [`MutexCb::held_link`].
    ///
    /// [`MutexCb::held_link`]: crate::mutex::MutexCb
    pub(crate) held_mutexes:
        klock::CpuLockCell<Traits, StaticListHead<crate::mutex::MutexCb<Traits>>>,

    /// Ticks consumed of the current time slice.
    pub(crate) tslice_count: klock::CpuLockCell<Traits, Ticks>,

    /// Set while this task's pending lock closes a wait-for cycle.
    #[cfg(feature = "deadlock_detection")]
    pub(crate) in_deadlock: klock::CpuLockCell<Traits, bool>,
}

impl<Traits: PortThreading> Init for TaskCb<Traits> {
    const INIT: Self = Self {
        port_task_state: Init::INIT,
        id: Init::INIT,
        attr: Init::INIT,
        base_priority: Init::INIT,
        effective_priority: Init::INIT,
        st: Init::INIT,
        link: Init::INIT,
        create_link: Init::INIT,
        wait: Init::INIT,
        timer: Init::INIT,
        held_mutexes: Init::INIT,
        tslice_count: Init::INIT,
        #[cfg(feature = "deadlock_detection")]
        in_deadlock: Init::INIT,
    };
}

impl<Traits: KernelTraits> TaskCb<Traits> {
    /// Read the task's creation attributes.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active, and the kernel must not be in the
    /// middle of mutating this control block (true whenever the port's
    /// dispatcher or `initialize_task_state` runs).
    pub unsafe fn read_attr(&self) -> TaskAttr {
        // Safety: upheld by the caller
        let token = unsafe { klock::CpuLockToken::<Traits>::new_unchecked() };
        self.attr.get(&token)
    }
}

impl<Traits: KernelTraits> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("port_task_state", &self.port_task_state)
            .field("id", &self.id)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("st", &self.st)
            .field("wait", &self.wait)
            .field("tslice_count", &self.tslice_count)
            .finish_non_exhaustive()
    }
}

/// Parameters for [`System::create_task`].
#[derive(Clone, Copy, Debug)]
pub struct TaskOptions {
    /// The entry point. A safe `fn(usize)` coerces to this.
    pub entry_point: unsafe fn(usize),
    /// Passed verbatim to `entry_point`.
    pub entry_param: usize,
    /// The base priority. Smaller values are more urgent; the lowest
    /// level is reserved for the idle task.
    pub priority: usize,
    /// The stack region.
    pub stack: TaskStack,
    /// Activate the task right away instead of leaving it Dormant.
    pub activate: bool,
}

/// Get a `ListAccessorCell` for the created-task list.
macro_rules! created_list_accessor {
    ($key:expr) => {
        ListAccessorCell::new(
            &Traits::state().created_tasks,
            |task_cb: &TaskCb<Traits>| &task_cb.create_link,
            $key,
        )
    };
}

// Public API
// ---------------------------------------------------------------------------

impl<Traits: KernelTraits> System<Traits> {
    /// Register `task_cb` as a task, leaving it Dormant (or activating
    /// it right away when `opts.activate` is set).
    ///
    /// Legal from a task context or during boot.
    pub fn create_task(
        task_cb: &'static TaskCb<Traits>,
        opts: TaskOptions,
    ) -> Result<(), CreateTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_or_boot_context::<Traits>(lock.borrow_mut())?;
        create_task_inner(lock.borrow_mut(), task_cb, opts, false)?;
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Activate a Dormant task: prepare its stack for the first
    /// dispatch and make it runnable.
    pub fn activate_task(task_cb: &'static TaskCb<Traits>) -> Result<(), ActivateTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        expect_valid_task(lock.borrow_mut(), task_cb)?;
        activate(lock.borrow_mut(), task_cb)?;
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [`activate_task`](Self::activate_task) for interrupt handlers.
    /// The context switch is deferred to the interrupt epilogue.
    pub fn iactivate_task(task_cb: &'static TaskCb<Traits>) -> Result<(), ActivateTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_interrupt_context::<Traits>()?;
        expect_valid_task(lock.borrow_mut(), task_cb)?;
        activate(lock.borrow_mut(), task_cb)?;
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Suspend a task. A waiting task keeps waiting and becomes
    /// `WAITING | SUSPENDED`.
    pub fn suspend_task(task_cb: &'static TaskCb<Traits>) -> Result<(), SuspendTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        expect_valid_task(lock.borrow_mut(), task_cb)?;

        let st = task_cb.st.get(&*lock);
        if st.intersects(TaskSt::SUSPENDED | TaskSt::DORMANT) {
            return Err(SuspendTaskError::BadObjectState);
        }

        if st.contains(TaskSt::RUNNABLE) {
            make_unrunnable(lock.borrow_mut(), task_cb);
        }
        set_suspended(lock.borrow_mut(), task_cb);

        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Undo [`suspend_task`](Self::suspend_task). The task becomes
    /// runnable unless it is still waiting.
    pub fn resume_task(task_cb: &'static TaskCb<Traits>) -> Result<(), ResumeTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        expect_valid_task(lock.borrow_mut(), task_cb)?;

        if !task_cb.st.get(&*lock).contains(TaskSt::SUSPENDED) {
            return Err(ResumeTaskError::BadObjectState);
        }

        clear_suspended(lock.borrow_mut(), task_cb);
        if !task_cb.st.get(&*lock).contains(TaskSt::WAITING) {
            make_runnable(lock.borrow_mut(), task_cb);
        }

        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Put the calling task to sleep for `timeout` ticks.
    ///
    ///  - `Err(Timeout)` — the full duration elapsed (the normal
    ///    outcome). A zero `timeout` returns this immediately.
    ///  - `Ok(())` — another task called
    ///    [`wakeup_task`](Self::wakeup_task).
    ///  - `Err(Interrupted)` — the wait was forcibly released.
    ///
    /// Pass [`WAIT_INFINITE`](crate::WAIT_INFINITE) to sleep until
    /// woken.
    pub fn sleep(timeout: Ticks) -> Result<(), SleepError> {
        if timeout == 0 {
            return Err(SleepError::Timeout);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;

        let running_task = expect_running_task(lock.borrow_mut());
        wait::wait_current(lock.borrow_mut(), None, wait::WaitOn::Sleep, timeout);
        unlock_cpu_and_check_preemption(lock);

        // Running again — the waker has recorded the wake cause.
        let mut lock = klock::lock_cpu::<Traits>()?;
        let result = running_task.wait.result.get(&*lock.borrow_mut());
        drop(lock);

        result.map_err(SleepError::from)
    }

    /// Wake a task out of [`sleep`](Self::sleep). Fails with
    /// `BadObjectState` if the task is waiting for any other reason, or
    /// not waiting at all.
    pub fn wakeup_task(task_cb: &'static TaskCb<Traits>) -> Result<(), WakeupTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        expect_valid_task(lock.borrow_mut(), task_cb)?;
        wakeup(lock.borrow_mut(), task_cb)?;
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [`wakeup_task`](Self::wakeup_task) for interrupt handlers.
    pub fn iwakeup_task(task_cb: &'static TaskCb<Traits>) -> Result<(), WakeupTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_interrupt_context::<Traits>()?;
        expect_valid_task(lock.borrow_mut(), task_cb)?;
        wakeup(lock.borrow_mut(), task_cb)?;
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Forcibly complete whatever wait `task_cb` is blocked in. The
    /// task's blocking call returns `Interrupted`.
    pub fn release_wait(task_cb: &'static TaskCb<Traits>) -> Result<(), ReleaseWaitError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        expect_valid_task(lock.borrow_mut(), task_cb)?;
        release_wait(lock.borrow_mut(), task_cb)?;
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// [`release_wait`](Self::release_wait) for interrupt handlers.
    pub fn irelease_wait(task_cb: &'static TaskCb<Traits>) -> Result<(), ReleaseWaitError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_interrupt_context::<Traits>()?;
        expect_valid_task(lock.borrow_mut(), task_cb)?;
        release_wait(lock.borrow_mut(), task_cb)?;
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Terminate the calling task, unlocking every mutex it holds and
    /// returning it to the Dormant state (or deleting it when `delete`
    /// is set), then switch to the next task without saving the current
    /// context.
    ///
    /// # Safety
    ///
    /// On a successful call, this function destroys the current task's
    /// stack without running any destructors on stack-allocated objects
    /// and renders all references pointing to such objects invalid. The
    /// caller is responsible for ensuring this doesn't lead to an
    /// undefined behavior.
    pub unsafe fn exit_task(delete: bool) -> Result<Infallible, ExitTaskError> {
        if !Traits::is_task_context() {
            return Err(ExitTaskError::BadContext);
        }

        // If CPU Lock is inactive, activate it.
        let mut lock = unsafe {
            if !Traits::is_cpu_lock_active() {
                Traits::enter_cpu_lock();
            }
            klock::assume_cpu_lock::<Traits>()
        };

        let running_task = expect_running_task(lock.borrow_mut());

        make_unrunnable(lock.borrow_mut(), running_task);
        terminate_inner(lock.borrow_mut(), running_task);
        if delete {
            delete_inner(lock.borrow_mut(), running_task);
        }

        // Erase `running_task`; the dispatcher will install `next_task`
        Traits::state().running_task.replace(&mut *lock, None);

        core::mem::forget(lock);

        // Safety: (1) The caller acknowledged that all preexisting data
        // on the task stack will be invalidated. (2) CPU Lock active
        unsafe { Traits::exit_and_dispatch(running_task) }
    }

    /// Terminate another task, unlocking every mutex it holds and
    /// returning it to the Dormant state. The calling task must use
    /// [`exit_task`](Self::exit_task) on itself instead.
    pub fn terminate_task(task_cb: &'static TaskCb<Traits>) -> Result<(), TerminateTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        expect_valid_task(lock.borrow_mut(), task_cb)?;

        if ptr_from_option_ref(Traits::state().running_task(lock.borrow_mut()))
            == task_cb as *const _
        {
            return Err(TerminateTaskError::BadContext);
        }

        let st = task_cb.st.get(&*lock);
        if st.contains(TaskSt::DORMANT) {
            return Err(TerminateTaskError::BadObjectState);
        }

        if st.contains(TaskSt::RUNNABLE) {
            make_unrunnable(lock.borrow_mut(), task_cb);
        } else if st.contains(TaskSt::WAITING) {
            // The result code is never read; the task will not run
            // again before being re-activated
            wait::clear_waiting(lock.borrow_mut(), task_cb, Ok(()));
        }
        if task_cb.st.get(&*lock).contains(TaskSt::SUSPENDED) {
            clear_suspended(lock.borrow_mut(), task_cb);
        }

        terminate_inner(lock.borrow_mut(), task_cb);

        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Unregister a Dormant task, clearing its identity tag.
    pub fn delete_task(task_cb: &'static TaskCb<Traits>) -> Result<(), DeleteTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        expect_valid_task(lock.borrow_mut(), task_cb)?;

        if !task_cb.st.get(&*lock).contains(TaskSt::DORMANT) {
            return Err(DeleteTaskError::BadObjectState);
        }

        delete_inner(lock.borrow_mut(), task_cb);
        Ok(())
    }

    /// Change a task's effective priority.
    ///
    /// `priority == 0` restores the task's base priority. (Priority 0
    /// itself cannot be assigned by this service.) When the task is
    /// runnable it moves to the tail of the new priority's ready queue;
    /// when it is waiting on an inheritance mutex, the holder's boost
    /// is recomputed.
    pub fn change_task_priority(
        task_cb: &'static TaskCb<Traits>,
        priority: usize,
    ) -> Result<(), SetTaskPriorityError> {
        if cfg!(feature = "param_checking") && priority >= Traits::NUM_PRIORITY_LEVELS - 1 {
            return Err(SetTaskPriorityError::BadParam);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        expect_valid_task(lock.borrow_mut(), task_cb)?;

        if task_cb.st.get(&*lock).contains(TaskSt::DORMANT) {
            return Err(SetTaskPriorityError::BadObjectState);
        }

        let priority = if priority == 0 {
            task_cb.base_priority.get(&*lock)
        } else {
            priority
        };

        mutex::set_task_effective_priority(lock.borrow_mut(), task_cb, priority);

        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Snapshot a task's state bit-set.
    pub fn task_state(task_cb: &'static TaskCb<Traits>) -> Result<TaskSt, GetTaskStateError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        expect_valid_task(lock.borrow_mut(), task_cb)?;
        Ok(task_cb.st.get(&*lock))
    }

    /// Get a task's base priority.
    pub fn task_base_priority(
        task_cb: &'static TaskCb<Traits>,
    ) -> Result<usize, GetTaskPriorityError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        expect_valid_task(lock.borrow_mut(), task_cb)?;

        if task_cb.st.get(&*lock).contains(TaskSt::DORMANT) {
            Err(GetTaskPriorityError::BadObjectState)
        } else {
            Ok(task_cb.base_priority.get(&*lock))
        }
    }

    /// Get a task's effective priority (the one the scheduler uses,
    /// including any boost).
    pub fn task_effective_priority(
        task_cb: &'static TaskCb<Traits>,
    ) -> Result<usize, GetTaskPriorityError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        expect_valid_task(lock.borrow_mut(), task_cb)?;

        if task_cb.st.get(&*lock).contains(TaskSt::DORMANT) {
            Err(GetTaskPriorityError::BadObjectState)
        } else {
            Ok(task_cb.effective_priority.get(&*lock))
        }
    }

    /// Get the calling task's control block.
    pub fn current_task() -> Result<&'static TaskCb<Traits>, GetCurrentTaskError> {
        if !Traits::is_task_context() {
            return Err(GetCurrentTaskError::BadContext);
        }
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(expect_running_task(lock.borrow_mut()))
    }

    /// The number of tasks currently registered.
    pub fn created_task_count() -> Result<usize, GetTaskCountError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(Traits::state().created_task_count.get(&*lock))
    }
}

// Validation
// ---------------------------------------------------------------------------

/// Verify the identity tag of `task_cb`.
#[inline]
pub(super) fn expect_valid_task<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &TaskCb<Traits>,
) -> Result<(), BadIdError> {
    if cfg!(feature = "param_checking") && task_cb.id.get(&*lock) != ObjectId::TASK {
        return Err(BadIdError::BadId);
    }
    Ok(())
}

/// Get the running task, trapping if there is none (all internal call
/// sites run after the scheduler has started).
#[inline]
pub(super) fn expect_running_task<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> &'static TaskCb<Traits> {
    Traits::state()
        .running_task(lock)
        .unwrap_or_else(|| Traits::fatal_error("no running task"))
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        core::ptr::null()
    }
}

// Creation
// ---------------------------------------------------------------------------

pub(super) fn create_task_inner<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    opts: TaskOptions,
    is_idle: bool,
) -> Result<(), CreateTaskError> {
    if cfg!(feature = "param_checking") {
        let idle_priority = Traits::NUM_PRIORITY_LEVELS - 1;
        let priority_ok = if is_idle {
            opts.priority == idle_priority
        } else {
            opts.priority < idle_priority
        };
        if !priority_ok
            || opts.stack.len() < Traits::STACK_MIN_LEN
            || task_cb.id.get(&*lock) == ObjectId::TASK
        {
            return Err(CreateTaskError::BadParam);
        }
    }

    task_cb.attr.replace(
        &mut *lock,
        TaskAttr {
            entry_point: opts.entry_point,
            entry_param: opts.entry_param,
            stack: opts.stack,
        },
    );
    task_cb.base_priority.replace(&mut *lock, opts.priority);
    task_cb
        .effective_priority
        .replace(&mut *lock, opts.priority);
    task_cb.st.replace(&mut *lock, TaskSt::empty());
    task_cb.link.replace(&mut *lock, None);
    task_cb.held_mutexes.replace(&mut *lock, Init::INIT);
    #[cfg(feature = "deadlock_detection")]
    task_cb.in_deadlock.replace(&mut *lock, false);
    wait::init_task_wait(lock.borrow_mut(), task_cb);
    task_cb.timer.configure(
        lock.borrow_mut(),
        wait::wait_timeout_handler::<Traits>,
        task_cb as *const TaskCb<Traits> as usize,
    );

    // Fill the stack with the sentinel value
    {
        let stack = opts.stack;
        let base = stack.as_ptr() as *mut UWord;
        for i in 0..stack.len() {
            // Safety: the caller handed the region over to the kernel
            unsafe { base.add(i).write(STACK_FILL_VAL) };
        }
    }

    set_dormant(lock.borrow_mut(), task_cb);
    task_cb.id.replace(&mut *lock, ObjectId::TASK);

    created_list_accessor!(lock.borrow_mut())
        .push_back(Ident(task_cb))
        .unwrap_or_else(|_| Traits::fatal_error("task is already registered"));
    Traits::state()
        .created_task_count
        .replace_with(&mut *lock, |x| *x + 1);

    if opts.activate {
        activate(lock.borrow_mut(), task_cb)
            .unwrap_or_else(|_| Traits::fatal_error("fresh task is not dormant"));
    }

    Ok(())
}

fn delete_inner<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    created_list_accessor!(lock.borrow_mut())
        .remove(Ident(task_cb))
        .unwrap_or_else(|_| Traits::fatal_error("task is not registered"));
    Traits::state()
        .created_task_count
        .replace_with(&mut *lock, |x| *x - 1);
    task_cb.id.replace(&mut *lock, ObjectId::NONE);
}

// State transitions
// ---------------------------------------------------------------------------
//
// Each helper flips exactly one flag of the state bit-set and traps if
// the precondition on the remaining flags does not hold.

/// Transition a task whose state is "none" into `RUNNABLE`, append it
/// to its priority's ready queue, and update
/// [`State::next_task`](crate::State) if the task outranks the previous
/// choice.
pub(super) fn make_runnable<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    if !task_cb.st.get(&*lock).is_empty() {
        Traits::fatal_error("make_runnable: state is not none");
    }

    task_cb.st.replace(&mut *lock, TaskSt::RUNNABLE);
    Traits::state()
        .task_ready_queue
        .push_back_task(lock.borrow_mut().into(), task_cb);

    let priority = task_cb.effective_priority.get(&*lock);
    let preempts = match Traits::state().next_task(lock.borrow_mut()) {
        Some(next) => priority < next.effective_priority.get(&*lock),
        None => true,
    };
    if preempts {
        Traits::state().next_task.replace(&mut *lock, Some(task_cb));
    }
}

/// Transition a task that is exactly `RUNNABLE` into "none", removing
/// it from its ready queue and re-electing
/// [`State::next_task`](crate::State) as needed.
pub(super) fn make_unrunnable<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    if task_cb.st.get(&*lock) != TaskSt::RUNNABLE {
        Traits::fatal_error("make_unrunnable: state is not exactly RUNNABLE");
    }
    if ptr_from_option_ref(Traits::state().idle_task.get(&*lock)) == task_cb as *const _ {
        Traits::fatal_error("the idle task must stay runnable");
    }

    task_cb.st.replace(&mut *lock, TaskSt::empty());

    let priority = task_cb.effective_priority.get(&*lock);
    let became_empty =
        Traits::state()
            .task_ready_queue
            .remove_task(lock.borrow_mut().into(), task_cb, priority);

    if became_empty {
        find_next_task(lock.borrow_mut());
    } else if ptr_from_option_ref(Traits::state().next_task(lock.borrow_mut()))
        == task_cb as *const _
    {
        // The departing task was the scheduling choice; advance to the
        // new head of the same priority's queue
        let new_head = Traits::state()
            .task_ready_queue
            .front_task_at(lock.borrow_mut().into(), priority);
        Traits::state().next_task.replace(&mut *lock, new_head);
    }
}

/// Re-elect [`State::next_task`](crate::State) from scratch: the head
/// of the most urgent non-empty ready queue.
pub(super) fn find_next_task<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    let ready_queue = &Traits::state().task_ready_queue;
    let priority = ready_queue
        .highest_ready_priority(lock.borrow_mut().into())
        .unwrap_or_else(|| Traits::fatal_error("no runnable task (idle task is gone)"));
    let head = ready_queue.front_task_at(lock.borrow_mut().into(), priority);
    debug_assert!(head.is_some());
    Traits::state().next_task.replace(&mut *lock, head);
}

/// Move a `RUNNABLE` task to `new_priority`: tail of the new ready
/// queue (the round-robin tie-break), then re-elect the next task.
pub(super) fn change_running_task_priority<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    new_priority: usize,
) {
    if !task_cb.st.get(&*lock).contains(TaskSt::RUNNABLE) {
        Traits::fatal_error("repositioning a task that is not runnable");
    }

    let old_priority = task_cb
        .effective_priority
        .replace(&mut *lock, new_priority);
    Traits::state()
        .task_ready_queue
        .reposition_task(lock.borrow_mut().into(), task_cb, old_priority);

    find_next_task(lock.borrow_mut());
}

pub(super) fn set_suspended<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    if !(task_cb.st.get(&*lock) & !TaskSt::WAITING).is_empty() {
        Traits::fatal_error("set_suspended: only WAITING may be set");
    }
    task_cb
        .st
        .replace_with(&mut *lock, |st| *st | TaskSt::SUSPENDED);
}

pub(super) fn clear_suspended<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    let st = task_cb.st.get(&*lock);
    if !st.contains(TaskSt::SUSPENDED) || !(st & !(TaskSt::WAITING | TaskSt::SUSPENDED)).is_empty()
    {
        Traits::fatal_error("clear_suspended: bad state");
    }
    task_cb
        .st
        .replace_with(&mut *lock, |st| *st & !TaskSt::SUSPENDED);
}

/// Transition a task whose state is "none" into `DORMANT`, restoring
/// its base priority and resetting the time-slice account.
pub(super) fn set_dormant<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    if !task_cb.st.get(&*lock).is_empty() {
        Traits::fatal_error("set_dormant: state is not none");
    }
    if !task_cb.held_mutexes.get(&*lock).is_empty() {
        Traits::fatal_error("set_dormant: task still holds mutexes");
    }

    let base_priority = task_cb.base_priority.get(&*lock);
    task_cb
        .effective_priority
        .replace(&mut *lock, base_priority);
    task_cb.st.replace(&mut *lock, TaskSt::DORMANT);
    task_cb.tslice_count.replace(&mut *lock, 0);
}

/// Transition a `DORMANT` task into "none", preparing its stack for the
/// first dispatch via the port.
fn clear_dormant<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    if task_cb.st.get(&*lock) != TaskSt::DORMANT {
        Traits::fatal_error("clear_dormant: state is not exactly DORMANT");
    }

    // Safety: CPU Lock active, the task is Dormant
    unsafe { Traits::initialize_task_state(task_cb) };

    task_cb.st.replace(&mut *lock, TaskSt::empty());
}

/// Implements task activation (shared by `activate_task`,
/// `iactivate_task`, and the create-and-activate option).
pub(super) fn activate<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) -> Result<(), ActivateTaskError> {
    if !task_cb.st.get(&*lock).contains(TaskSt::DORMANT) {
        return Err(ActivateTaskError::BadObjectState);
    }

    clear_dormant(lock.borrow_mut(), task_cb);
    make_runnable(lock.borrow_mut(), task_cb);
    Ok(())
}

// Termination
// ---------------------------------------------------------------------------

/// The common tail of `exit_task` and `terminate_task`: the task's
/// state is "none"; unlock every held mutex (waking waiters as needed)
/// and drive the task back to `DORMANT`.
fn terminate_inner<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    if !task_cb.st.get(&*lock).is_empty() {
        Traits::fatal_error("terminating a task that is still in some state");
    }

    mutex::unlock_all_by_task(lock.borrow_mut(), task_cb);
    set_dormant(lock.borrow_mut(), task_cb);
}

// Wait-related workers
// ---------------------------------------------------------------------------

fn wakeup<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) -> Result<(), BadObjectStateError> {
    let st = task_cb.st.get(&*lock);
    let sleeping = st.contains(TaskSt::WAITING)
        && matches!(task_cb.wait.wait_on.get(&*lock), Some(wait::WaitOn::Sleep));

    if sleeping {
        wait::complete_wait(lock.borrow_mut(), task_cb, Ok(()));
        Ok(())
    } else {
        Err(BadObjectStateError::BadObjectState)
    }
}

fn release_wait<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) -> Result<(), BadObjectStateError> {
    if task_cb.st.get(&*lock).contains(TaskSt::WAITING) {
        wait::complete_wait(
            lock.borrow_mut(),
            task_cb,
            Err(WaitTimeoutError::Interrupted),
        );
        Ok(())
    } else {
        Err(BadObjectStateError::BadObjectState)
    }
}

// Preemption
// ---------------------------------------------------------------------------

/// Relinquish CPU Lock. After that, if the scheduling decision differs
/// from the running task, ask the port to pend a context switch.
///
/// System services that may have changed
/// [`State::next_task`](crate::State) call this before returning to the
/// caller. In an interrupt context the port defers the switch to the
/// interrupt epilogue; during boot there is nothing to switch from, so
/// the pend is skipped.
pub(super) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
) {
    let state = Traits::state();
    let needs_switch = match (
        state.running_task(lock.borrow_mut()),
        state.next_task(lock.borrow_mut()),
    ) {
        (Some(running), Some(next)) => !ptr::eq(running, next),
        _ => false,
    };

    // Relinquish CPU Lock
    drop(lock);

    if needs_switch {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}
