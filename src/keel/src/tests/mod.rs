//! Kernel behavior tests, driven through a simulation port.
//!
//! The simulation port runs everything on the test thread. It performs
//! no real context switching: `yield_cpu` merely commits the pending
//! scheduling decision (`running_task := next_task`), so a blocking
//! service call marks the calling task as waiting and then *returns to
//! the test*, which plays the part of every task in turn. Assertions
//! therefore target the kernel's observable state — task state sets,
//! queue membership, priorities, recorded wake causes — rather than
//! call-stack blocking, which is the real port's domain.
//!
//! Each test declares its own system type with [`sim_kernel!`], giving
//! it a private kernel state; tests are thus independent and can run
//! concurrently.
use crate::{
    klock, mutex, task,
    task::{TaskCb, TaskOptions, TaskStack},
    KernelTraits, PortToKernel, TaskSt,
};

mod mutex_suite;

/// Define a system type backed by the simulation port, with its own
/// kernel state. Invoke once per test function.
macro_rules! sim_kernel {
    ($name:ident, levels: $levels:expr) => {
        struct $name;

        #[derive(Debug)]
        struct SimTaskState {
            initial_sp: ::std::sync::atomic::AtomicUsize,
        }

        impl $crate::utils::Init for SimTaskState {
            const INIT: Self = Self {
                initial_sp: ::std::sync::atomic::AtomicUsize::new(0),
            };
        }

        static CPU_LOCK: ::std::sync::atomic::AtomicBool =
            ::std::sync::atomic::AtomicBool::new(false);
        static IN_ISR: ::std::sync::atomic::AtomicBool =
            ::std::sync::atomic::AtomicBool::new(false);
        static KERNEL_STATE: $crate::State<$name> =
            <$crate::State<$name> as $crate::utils::Init>::INIT;

        unsafe impl $crate::KernelCfg1 for $name {
            const NUM_PRIORITY_LEVELS: usize = $levels;
        }

        unsafe impl $crate::PortThreading for $name {
            type PortTaskState = SimTaskState;
            const STACK_MIN_LEN: usize = 16;

            unsafe fn dispatch_first_task() -> ! {
                unreachable!("the simulation port never really dispatches")
            }

            unsafe fn yield_cpu() {
                // Commit the scheduling decision on the spot, standing
                // in for the dispatcher
                unsafe {
                    Self::enter_cpu_lock();
                    <$name as $crate::PortToKernel>::choose_running_task();
                    Self::leave_cpu_lock();
                }
            }

            unsafe fn exit_and_dispatch(_task: &'static $crate::TaskCb<Self>) -> ! {
                unsafe {
                    <$name as $crate::PortToKernel>::choose_running_task();
                    Self::leave_cpu_lock();
                }
                panic!("task exited");
            }

            unsafe fn enter_cpu_lock() {
                assert!(
                    !CPU_LOCK.swap(true, ::std::sync::atomic::Ordering::Relaxed),
                    "CPU Lock is already active"
                );
            }

            unsafe fn leave_cpu_lock() {
                assert!(
                    CPU_LOCK.swap(false, ::std::sync::atomic::Ordering::Relaxed),
                    "CPU Lock is not active"
                );
            }

            unsafe fn initialize_task_state(task: &'static $crate::TaskCb<Self>) {
                let attr = unsafe { task.read_attr() };
                let stack = attr.stack;
                // Full-descending convention: start at the upper end
                let top = stack.as_ptr() as *mut $crate::UWord as usize
                    + stack.len() * ::core::mem::size_of::<$crate::UWord>();
                task.port_task_state
                    .initial_sp
                    .store(top, ::std::sync::atomic::Ordering::Relaxed);
            }

            fn is_cpu_lock_active() -> bool {
                CPU_LOCK.load(::std::sync::atomic::Ordering::Relaxed)
            }

            fn is_task_context() -> bool {
                !Self::is_interrupt_context()
            }

            fn is_interrupt_context() -> bool {
                IN_ISR.load(::std::sync::atomic::Ordering::Relaxed)
            }

            fn fatal_error(msg: &'static str) -> ! {
                panic!("kernel fatal error: {msg}");
            }
        }

        unsafe impl $crate::KernelCfg2 for $name {
            type TaskReadyQueue = $crate::BitmapQueue<
                Self,
                $crate::utils::OneLevelPrioBitmap<{ $levels }>,
                { $levels },
            >;
            type TimeSliceTable = [$crate::Ticks; $levels];

            fn state() -> &'static $crate::State<Self> {
                &KERNEL_STATE
            }
        }

        /// Run `f` in a simulated interrupt context.
        #[allow(dead_code)]
        fn with_isr_context<R>(f: impl FnOnce() -> R) -> R {
            IN_ISR.store(true, ::std::sync::atomic::Ordering::Relaxed);
            let result = f();
            IN_ISR.store(false, ::std::sync::atomic::Ordering::Relaxed);
            result
        }
    };
}

pub(self) use sim_kernel;

/// Leak a stack buffer for a test task.
pub(super) fn test_stack(len: usize) -> TaskStack {
    TaskStack::new(Box::leak(vec![0; len].into_boxed_slice()))
}

pub(super) unsafe fn noop_entry(_: usize) {}

/// `TaskOptions` with the fields most tests don't care about filled in.
pub(super) fn opts(priority: usize, activate: bool) -> TaskOptions {
    TaskOptions {
        entry_point: noop_entry,
        entry_param: 0,
        priority,
        stack: test_stack(64),
        activate,
    }
}

/// Stand-in for `System::start`: create the idle task, end the boot
/// phase, and elect the first running task — without the final
/// (diverging) dispatch.
pub(super) fn start_scheduler<Traits: KernelTraits>(idle_task_cb: &'static TaskCb<Traits>) {
    let mut lock = klock::lock_cpu::<Traits>().unwrap();

    task::create_task_inner(
        lock.borrow_mut(),
        idle_task_cb,
        TaskOptions {
            entry_point: noop_entry,
            entry_param: 0,
            priority: Traits::NUM_PRIORITY_LEVELS - 1,
            stack: test_stack(64),
            activate: true,
        },
        true,
    )
    .unwrap();
    Traits::state()
        .idle_task
        .replace(&mut *lock, Some(idle_task_cb));

    Traits::state().started.replace(&mut *lock, true);
    task::find_next_task(lock.borrow_mut());
    let first = Traits::state().next_task(lock.borrow_mut());
    Traits::state().running_task.replace(&mut *lock, first);

    drop(lock);
}

/// Deliver `n` system ticks.
pub(super) fn tick_n<Traits: KernelTraits>(n: u32) {
    for _ in 0..n {
        unsafe { <Traits as PortToKernel>::timer_tick() };
    }
}

pub(super) fn running_task<Traits: KernelTraits>() -> Option<&'static TaskCb<Traits>> {
    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    let task = Traits::state().running_task(lock.borrow_mut());
    drop(lock);
    task
}

pub(super) fn assert_running<Traits: KernelTraits>(expected: &'static TaskCb<Traits>) {
    let actual = running_task::<Traits>().expect("no running task");
    assert!(
        core::ptr::eq(actual, expected),
        "expected {:p} to be running, but {:p} is",
        expected as *const _,
        actual as *const _
    );
}

pub(super) fn wait_result_of<Traits: KernelTraits>(
    task_cb: &'static TaskCb<Traits>,
) -> Result<(), crate::WaitTimeoutError> {
    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    let result = task_cb.wait.result.get(&*lock.borrow_mut());
    drop(lock);
    result
}

pub(super) fn state_of<Traits: KernelTraits>(task_cb: &'static TaskCb<Traits>) -> TaskSt {
    let lock = klock::lock_cpu::<Traits>().unwrap();
    let st = task_cb.st.get(&*lock);
    drop(lock);
    st
}

pub(super) fn effective_priority_of<Traits: KernelTraits>(
    task_cb: &'static TaskCb<Traits>,
) -> usize {
    let lock = klock::lock_cpu::<Traits>().unwrap();
    let priority = task_cb.effective_priority.get(&*lock);
    drop(lock);
    priority
}

/// Check every auditable invariant over the given object population.
/// Call after each step of a scenario.
pub(super) fn audit_invariants<Traits: KernelTraits>(
    tasks: &[&'static TaskCb<Traits>],
    mutexes: &[&'static crate::MutexCb<Traits>],
) {
    use crate::task::readyqueue::Queue as _;

    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    let ready_queue = &Traits::state().task_ready_queue;

    // The ready bitmap agrees with the ready queues
    for priority in 0..Traits::NUM_PRIORITY_LEVELS {
        assert_eq!(
            ready_queue.ready_bit(lock.borrow_mut().into(), priority),
            ready_queue
                .front_task_at(lock.borrow_mut().into(), priority)
                .is_some(),
            "ready bitmap out of sync at priority {priority}"
        );
    }

    // The running task is runnable
    if let Some(running) = Traits::state().running_task(lock.borrow_mut()) {
        assert!(running.st.get(&*lock).contains(TaskSt::RUNNABLE));
    }

    for &task_cb in tasks {
        let st = task_cb.st.get(&*lock);

        // Exactly one of the legal state sets holds
        let legal = [
            TaskSt::DORMANT,
            TaskSt::RUNNABLE,
            TaskSt::WAITING,
            TaskSt::SUSPENDED,
            TaskSt::WAITING | TaskSt::SUSPENDED,
        ];
        assert!(legal.contains(&st), "illegal state set {st:?}");

        // Queue-membership flags agree with the state
        let linked = task_cb.link.get(&*lock).is_some();
        let wait_queue = task_cb.wait.queue.get(&*lock);
        if st.contains(TaskSt::RUNNABLE) {
            assert!(linked, "runnable task is not in a ready queue");
            assert!(wait_queue.is_none());
        } else {
            assert_eq!(
                wait_queue.is_some(),
                linked,
                "wait-queue backref and link are out of sync"
            );
            assert!(wait_queue.is_none() || st.contains(TaskSt::WAITING));
        }

        // The wait timer runs only for finite timed waits
        if task_cb.timer.is_active(lock.borrow_mut()) {
            assert!(st.contains(TaskSt::WAITING));
        }
    }

    for &mutex_cb in mutexes {
        let holder = mutex_cb.owning_task.get(&*lock);

        if let Some(holder) = holder {
            // The holder's held list contains the mutex
            let held = {
                let accessor = crate::utils::intrusive_list::ListAccessorCell::new(
                    &holder.held_mutexes,
                    |m: &crate::MutexCb<Traits>| &m.held_link,
                    lock.borrow_mut(),
                );
                accessor.iter().any(|item| {
                    let crate::utils::intrusive_list::Ident(m) =
                        item.expect("held-mutex list corrupted");
                    core::ptr::eq(m, mutex_cb)
                })
            };
            assert!(held, "mutex is not in its holder's held list");
            assert!(mutex_cb.lock_count.get(&*lock) > 0);

            // The holder's boost equation holds
            let expected = mutex::evaluate_task_effective_priority(lock.borrow_mut(), holder);
            assert_eq!(
                holder.effective_priority.get(&*lock),
                expected,
                "holder's effective priority deviates from the boost equation"
            );
        } else {
            assert_eq!(mutex_cb.lock_count.get(&*lock), 0);
        }
    }

    drop(lock);
}
