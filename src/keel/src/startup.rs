//! Kernel startup and the built-in idle task.
use crate::{
    klock, task,
    task::{TaskCb, TaskOptions, TaskStack},
    KernelCfg1, KernelTraits, System,
};

impl<Traits: KernelTraits> System<Traits> {
    /// Start the scheduler.
    ///
    /// Creates and activates the built-in idle task at the lowest
    /// priority (always runnable, so the scheduler never runs out of
    /// tasks), invokes `startup_hook` — which must create, and
    /// typically activate, the application's first tasks — then
    /// dispatches the most urgent runnable task. Never returns.
    ///
    /// `idle_hook`, when given, is invoked repeatedly from the idle
    /// task; a typical implementation puts the CPU into a low-power
    /// state until the next interrupt.
    pub fn start(
        idle_task_cb: &'static TaskCb<Traits>,
        idle_stack: TaskStack,
        idle_hook: Option<fn()>,
        startup_hook: fn(),
    ) -> ! {
        // The port may hand over control with CPU Lock already active
        let mut lock = unsafe {
            if !Traits::is_cpu_lock_active() {
                Traits::enter_cpu_lock();
            }
            klock::assume_cpu_lock::<Traits>()
        };

        if Traits::state().started.get(&*lock) {
            Traits::fatal_error("the scheduler is already running");
        }

        task::create_task_inner(
            lock.borrow_mut(),
            idle_task_cb,
            TaskOptions {
                entry_point: idle_task_body,
                entry_param: idle_hook.map_or(0, |hook| hook as usize),
                priority: <Traits as KernelCfg1>::NUM_PRIORITY_LEVELS - 1,
                stack: idle_stack,
                activate: true,
            },
            true,
        )
        .unwrap_or_else(|_| Traits::fatal_error("could not create the idle task"));
        Traits::state()
            .idle_task
            .replace(&mut *lock, Some(idle_task_cb));

        // Let the application register its initial objects. Interrupts
        // are unmasked here, but nothing is dispatched until below.
        drop(lock);
        startup_hook();
        let mut lock = klock::lock_cpu::<Traits>()
            .unwrap_or_else(|_| Traits::fatal_error("startup hook left CPU Lock active"));

        // End the boot phase and elect the first task
        Traits::state().started.replace(&mut *lock, true);
        task::find_next_task(lock.borrow_mut());
        let first = Traits::state().next_task(lock.borrow_mut());
        Traits::state().running_task.replace(&mut *lock, first);

        core::mem::forget(lock);

        // Safety: CPU Lock active, boot phase
        unsafe { Traits::dispatch_first_task() }
    }
}

/// The idle task. `hook` is the application's idle hook smuggled
/// through the entry parameter, or `0`.
unsafe fn idle_task_body(hook: usize) {
    if hook != 0 {
        // Safety: `start` stored a valid `fn()` here
        let hook: fn() = unsafe { core::mem::transmute(hook) };
        loop {
            hook();
        }
    }

    #[allow(clippy::empty_loop)]
    loop {}
}
