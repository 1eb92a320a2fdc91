//! `keel` is a preemptive, priority-based real-time kernel core for
//! resource-constrained microcontrollers: a fixed-priority scheduler
//! with O(1) ready-task selection, a task state machine, time-bounded
//! waiting backed by a one-shot timeout engine, and mutexes with
//! priority inheritance (and, optionally, priority ceiling).
//!
//! The kernel owns no memory and performs no allocation. Every kernel
//! object — task control blocks, mutexes, stacks — is supplied by the
//! application as a `'static` control block and registered at runtime
//! (`create_task`, `create_mutex`). A magic identity tag written at
//! creation and cleared at deletion guards every API entry point
//! against stale references.
//!
//! # Ports
//!
//! The architecture-specific part (context switching, interrupt
//! masking, stack frame construction) is out of the kernel's hands. A
//! *port* supplies it by implementing [`PortThreading`] on a system
//! type, along with [`KernelCfg1`] and [`KernelCfg2`] which pin down
//! the priority-level count and the storage for the scheduler
//! structures. In return the port drives the kernel through
//! [`PortToKernel`]: it calls `choose_running_task` from its dispatcher
//! and `timer_tick` from the system tick interrupt.
//!
//! # Contexts
//!
//! Kernel services are classified by calling context: *task context*
//! (the common case), *interrupt context* (only the `i`-prefixed
//! variants are legal there), and the *boot context* before
//! [`System::start`] returns control to the first task (only object
//! creation is legal there). Calling a service from the wrong context
//! fails with `BadContext` before any state is touched.
//!
//! # Critical sections
//!
//! All kernel state is guarded by the *CPU Lock* — the port masks
//! interrupts at the kernel's system priority. The lock is represented
//! by a zero-sized token (see `klock`), so access to shared state
//! without the critical section is a compile error. Higher-priority
//! interrupts stay enabled but must not call kernel services.
#![cfg_attr(not(test), no_std)]

use core::borrow::BorrowMut;
use core::fmt;
use core::marker::PhantomData;

mod error;
mod klock;
mod mutex;
mod startup;
mod state;
mod task;
mod timeout;
pub mod utils;
mod wait;

#[cfg(test)]
mod tests;

pub use self::error::*;
#[cfg(feature = "deadlock_detection")]
pub use self::mutex::DeadlockHook;
pub use self::mutex::{MutexCb, MutexProtocol};
#[doc(hidden)]
pub use self::task::readyqueue::Ctx;
pub use self::task::readyqueue::{BitmapQueue, Queue};
pub use self::task::{TaskCb, TaskOptions, TaskSt, TaskStack};
pub use self::timeout::{Ticks, NO_TIME_SLICE, WAIT_INFINITE};

use self::klock::CpuLockCell;
use self::utils::{intrusive_list::StaticListHead, Init};

/// The machine word type stacks are made of.
pub type UWord = usize;

/// The value `create_task` fills the stack with, so that a debugger (or
/// a stack-usage probe) can tell how much of it was ever used.
pub const STACK_FILL_VAL: UWord = 0xAA55_AA55_u64 as UWord;

/// Magic values stored in kernel objects' identity-tag fields. An
/// object is *live* iff its tag holds the magic for its kind; `delete`
/// resets the tag, turning any retained reference into a detectable
/// dangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ObjectId(u32);

impl ObjectId {
    pub(crate) const NONE: Self = Self(0);
    pub(crate) const TASK: Self = Self(0x3c96_a5d2);
    pub(crate) const MUTEX: Self = Self(0x815e_c70b);
}

impl Init for ObjectId {
    const INIT: Self = Self::NONE;
}

/// Associates a system type with basic scheduler parameters needed by
/// both [`PortThreading`] and [`KernelCfg2`].
///
/// # Safety
///
/// Implementations must uphold the documented requirements of each
/// item; the kernel trusts them for memory safety (e.g. priority
/// values are used as indices into `ReadyQueue`).
pub unsafe trait KernelCfg1: Sized + Send + Sync + 'static {
    /// The number of task priority levels, including the lowest slot
    /// reserved for the idle task. Must be at least 2.
    const NUM_PRIORITY_LEVELS: usize;
}

/// Implemented by a port. This trait contains items related to
/// low-level operations for controlling CPU states and context
/// switching.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible
/// for initializing the execution environment and providing a
/// dispatcher implementation.
///
/// These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortThreading: KernelCfg1 {
    /// Port-specific per-task state (e.g. the saved stack pointer).
    /// Placed at offset zero of [`TaskCb`] so assembly code can reach
    /// it without knowing the TCB layout.
    type PortTaskState: Send + Sync + Init + fmt::Debug + 'static;

    /// The smallest stack length (in [`UWord`]s) the port can build an
    /// initial context frame in.
    const STACK_MIN_LEN: usize;

    /// Transfer the control to the task designated by
    /// [`State::next_task`], discarding the current (startup) context.
    ///
    /// Precondition: CPU Lock active, boot phase
    unsafe fn dispatch_first_task() -> !;

    /// Yield the processor.
    ///
    /// In a task context, this method immediately transfers the control
    /// to a dispatcher. The dispatcher should call
    /// [`PortToKernel::choose_running_task`] and transfer the control
    /// to [`State::running_task`].
    ///
    /// In an interrupt context, the effect of this method is deferred
    /// until the interrupt epilogue.
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn yield_cpu();

    /// Destroy the state of the previously running task (`task`, which
    /// has already been unscheduled) and proceed to the dispatcher
    /// without saving the current context. Used by `exit_task`; a
    /// normal context switch cannot substitute for this because there
    /// is no live context to save.
    ///
    /// Precondition: CPU Lock active
    unsafe fn exit_and_dispatch(task: &'static TaskCb<Self>) -> !;

    /// Disable all kernel-managed interrupts (this state is called
    /// *CPU Lock*).
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_cpu_lock();

    /// Re-enable kernel-managed interrupts previously disabled by
    /// `enter_cpu_lock`, thus deactivating the CPU Lock state.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Prepare the task for activation: construct an initial context
    /// frame on the task's stack such that the next dispatch of this
    /// task enters `attr.entry_point(attr.entry_param)`, and record the
    /// resulting initial stack pointer in
    /// [`TaskCb::port_task_state`]. The stack grows in whichever
    /// direction the architecture dictates; use [`TaskCb::read_attr`]
    /// to obtain the stack region.
    ///
    /// Precondition: CPU Lock active, the task is Dormant
    unsafe fn initialize_task_state(task: &'static TaskCb<Self>);

    /// Return a flag indicating whether a CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is a task
    /// context (neither an interrupt handler nor the boot phase).
    fn is_task_context() -> bool;

    /// Return a flag indicating whether the current context is an
    /// interrupt handler to which kernel services are available.
    fn is_interrupt_context() -> bool;

    /// The fatal-error trap. Called when the kernel detects a broken
    /// internal invariant (e.g. an impossible task state encountered
    /// inside a critical section). Must not return; a typical port
    /// breaks into the debugger or halts.
    fn fatal_error(msg: &'static str) -> !;
}

/// Associates a system type with kernel-private storage.
///
/// # Safety
///
/// `state()` must return the same instance every time, and that
/// instance must not be shared with another system type.
pub unsafe trait KernelCfg2: PortThreading {
    /// The ready structure: per-priority FIFO queues plus the ready
    /// bitmap. Use [`BitmapQueue`] with a bitmap type that can hold
    /// [`KernelCfg1::NUM_PRIORITY_LEVELS`] bits and a matching `LEN`.
    type TaskReadyQueue: Queue<Self>;

    /// The backing array for the per-priority time slice lengths.
    /// `borrow_mut().len()` must equal `NUM_PRIORITY_LEVELS`.
    type TimeSliceTable: BorrowMut<[Ticks]> + Init + Send + Sync + 'static;

    /// Access the kernel's global state.
    fn state() -> &'static State<Self>;
}

/// The complete set of traits a system type must implement for the
/// kernel to run on it. Automatically implemented.
pub trait KernelTraits: PortThreading + KernelCfg2 + 'static {}
impl<T: PortThreading + KernelCfg2 + 'static> KernelTraits for T {}

/// Global kernel state. One instance per system type, provided through
/// [`KernelCfg2::state`] (typically a `static`).
pub struct State<Traits: KernelCfg2> {
    /// The task whose context is on the CPU. `None` until the first
    /// dispatch, and momentarily while a task is exiting.
    running_task: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    /// The task scheduled to run next. A context switch is pended
    /// whenever this differs from `running_task` at the end of a
    /// critical section.
    next_task: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    /// The task ready queues (one FIFO per priority) and the ready
    /// bitmap, in which bit `p` is set iff queue `p` is non-empty.
    task_ready_queue: Traits::TaskReadyQueue,

    /// All tasks that have been created and not yet deleted.
    created_tasks: CpuLockCell<Traits, StaticListHead<TaskCb<Traits>>>,
    created_task_count: CpuLockCell<Traits, usize>,

    /// The built-in idle task, once `start` has created it. Always
    /// runnable; clearing its runnable state is a fatal error.
    idle_task: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    /// Becomes `true` when `start` hands control to the first task,
    /// ending the boot phase.
    started: CpuLockCell<Traits, bool>,

    /// The global state of the timekeeping system.
    timeout: timeout::TimeoutGlobals<Traits>,

    #[cfg(feature = "deadlock_detection")]
    deadlock_hook: CpuLockCell<Traits, Option<mutex::DeadlockHook<Traits>>>,
}

impl<Traits: KernelCfg2> Init for State<Traits> {
    const INIT: Self = Self {
        running_task: Init::INIT,
        next_task: Init::INIT,
        task_ready_queue: Init::INIT,
        created_tasks: Init::INIT,
        created_task_count: Init::INIT,
        idle_task: Init::INIT,
        started: Init::INIT,
        timeout: Init::INIT,
        #[cfg(feature = "deadlock_detection")]
        deadlock_hook: Init::INIT,
    };
}

impl<Traits: KernelTraits> State<Traits> {
    /// Get the currently running task.
    pub(crate) fn running_task(
        &self,
        lock: klock::CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        self.running_task.get(&*lock)
    }

    /// Get the task scheduled to run next.
    pub(crate) fn next_task(
        &self,
        lock: klock::CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        self.next_task.get(&*lock)
    }
}

impl<Traits: KernelTraits> fmt::Debug for State<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("State")
            .field(
                "running_task",
                &self
                    .running_task
                    .debug_fmt_with(|t, f| t.map(|t| t as *const _).fmt(f)),
            )
            .field(
                "next_task",
                &self
                    .next_task
                    .debug_fmt_with(|t, f| t.map(|t| t as *const _).fmt(f)),
            )
            .field("created_task_count", &self.created_task_count)
            .field("started", &self.started)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Provides access to the API functions exposed by the kernel, bound to
/// a particular system type.
///
/// All methods are associated functions; `System<Traits>` is never
/// instantiated.
pub struct System<Traits>(PhantomData<Traits>);

/// Methods intended to be called by a port.
///
/// # Safety
///
/// These are only meant to be called by the port.
#[allow(clippy::missing_safety_doc)]
pub trait PortToKernel {
    /// Commit the pending scheduling decision: make
    /// [`State::next_task`] the running task. The port's dispatcher
    /// calls this at the actual context-switch point, right before
    /// restoring the incoming task's context.
    ///
    /// Precondition: CPU Lock active / Postcondition: CPU Lock active
    unsafe fn choose_running_task();

    /// Called by the system tick driver once per tick, with CPU Lock
    /// inactive, from an interrupt context. Advances the timeout engine
    /// and charges the running task's time slice.
    unsafe fn timer_tick();
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn choose_running_task() {
        // Safety: The precondition of this method includes CPU Lock
        // being active
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        let next = Traits::state().next_task(lock.borrow_mut());
        Traits::state().running_task.replace(&mut *lock, next);

        // Post-condition: CPU Lock active
        core::mem::forget(lock);
    }

    unsafe fn timer_tick() {
        timeout::handle_tick::<Traits>();
    }
}
