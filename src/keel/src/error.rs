//! Result codes and per-operation error types.
use core::fmt;

macro_rules! define_error {
    (
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident $(: $($subty:ident),* $(,)*)? {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic
        /// descriptions.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for
                // cost-free conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    $(
                        Err($name::$vname) => Self::$vname,
                    )*
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                match x {
                    $(
                        $name::$vname => Self::$vname,
                    )*
                }
            }
        }

        $($(
            $subty!(impl From<_> for $name);
        )*)?

        #[allow(unused_macros)]
        macro_rules! $name {
            (impl From<_> for $dest_ty:ty) => {
                impl From<$name> for $dest_ty {
                    #[inline]
                    fn from(x: $name) -> Self {
                        match x {
                            $(
                                $name::$vname => Self::$vname,
                            )*
                        }
                    }
                }
            };
        }
    };
}

/// All result codes (including success) that the kernel can produce.
///
/// Failure codes have negative values; the numbering is part of the
/// stable interface so that result codes can be forwarded through
/// foreign-function or message boundaries unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i8)]
pub enum ResultCode {
    /// The operation was successful.
    Success = 0,
    /// The wait operation timed out, or a polling operation found the
    /// resource busy.
    Timeout = -1,
    /// The current execution context disallows the operation.
    BadContext = -3,
    /// A target object is in a state that disallows the operation.
    BadObjectState = -4,
    /// A parameter is invalid in a way that is not covered by any other
    /// error code.
    BadParam = -5,
    /// A protocol violation with a definite caller at fault, such as
    /// unlocking a mutex the caller does not hold or overflowing a
    /// recursive lock count.
    IllegalUse = -6,
    /// The object reference does not designate a live kernel object
    /// (the identity tag does not match).
    BadId = -7,
    /// The wait operation was forcibly terminated by
    /// [`release_wait`](crate::System::release_wait) or by task
    /// termination.
    Interrupted = -9,
    /// A mutex wait would close a wait-for cycle. Only reported through
    /// the deadlock notification hook, never as an operation result.
    Deadlock = -11,
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

define_error! {
    pub(crate) enum BadContextError {
        BadContext,
    }
}

define_error! {
    pub(crate) enum BadIdError {
        BadId,
    }
}

define_error! {
    pub(crate) enum BadObjectStateError {
        BadObjectState,
    }
}

define_error! {
    pub(crate) enum BadParamError {
        BadParam,
    }
}

define_error! {
    pub(crate) enum IllegalUseError {
        IllegalUse,
    }
}

define_error! {
    /// The cause of a completed wait, stored in the waiting task's
    /// wait-result field by the waking party. `Ok(())` means a normal
    /// wake-up.
    pub enum WaitTimeoutError {
        /// The wait elapsed without the awaited event occurring.
        Timeout,
        /// The wait was forcibly released.
        Interrupted,
    }
}

define_error! {
    /// Error type for [`create_task`](crate::System::create_task).
    pub enum CreateTaskError: BadContextError, BadParamError {
        /// Called from an interrupt context.
        BadContext,
        /// The priority is out of range (or designates the idle slot),
        /// the stack is too small, or the control block is already a
        /// live task.
        BadParam,
    }
}

define_error! {
    /// Error type for [`activate_task`](crate::System::activate_task)
    /// and its interrupt variant.
    pub enum ActivateTaskError: BadContextError, BadIdError, BadObjectStateError {
        BadId,
        BadContext,
        /// The task is not in the Dormant state.
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`suspend_task`](crate::System::suspend_task).
    pub enum SuspendTaskError: BadContextError, BadIdError, BadObjectStateError {
        BadId,
        BadContext,
        /// The task is already suspended, or is Dormant.
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`resume_task`](crate::System::resume_task).
    pub enum ResumeTaskError: BadContextError, BadIdError, BadObjectStateError {
        BadId,
        BadContext,
        /// The task is not suspended.
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`sleep`](crate::System::sleep).
    ///
    /// `Err(Timeout)` is the *normal* completion of a full sleep;
    /// `Ok(())` means some other task cut the sleep short with
    /// [`wakeup_task`](crate::System::wakeup_task).
    pub enum SleepError: BadContextError, WaitTimeoutError {
        /// The sleep duration elapsed.
        Timeout,
        /// The sleep was forcibly released.
        Interrupted,
        BadContext,
    }
}

define_error! {
    /// Error type for [`wakeup_task`](crate::System::wakeup_task) and
    /// its interrupt variant.
    pub enum WakeupTaskError: BadContextError, BadIdError, BadObjectStateError {
        BadId,
        BadContext,
        /// The task is not sleeping.
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`release_wait`](crate::System::release_wait) and
    /// its interrupt variant.
    pub enum ReleaseWaitError: BadContextError, BadIdError, BadObjectStateError {
        BadId,
        BadContext,
        /// The task is not waiting.
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`exit_task`](crate::System::exit_task).
    pub enum ExitTaskError: BadContextError {
        BadContext,
    }
}

define_error! {
    /// Error type for [`terminate_task`](crate::System::terminate_task).
    pub enum TerminateTaskError: BadContextError, BadIdError, BadObjectStateError {
        BadId,
        /// Called from an interrupt context, or the target is the
        /// calling task (use [`exit_task`](crate::System::exit_task)).
        BadContext,
        /// The task is already Dormant.
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`delete_task`](crate::System::delete_task).
    pub enum DeleteTaskError: BadContextError, BadIdError, BadObjectStateError {
        BadId,
        BadContext,
        /// The task is not Dormant.
        BadObjectState,
    }
}

define_error! {
    /// Error type for
    /// [`change_task_priority`](crate::System::change_task_priority).
    pub enum SetTaskPriorityError: BadContextError, BadIdError, BadObjectStateError, BadParamError {
        BadId,
        BadContext,
        /// The priority is out of range or designates the idle slot.
        BadParam,
        /// The task is Dormant.
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`task_state`](crate::System::task_state).
    pub enum GetTaskStateError: BadContextError, BadIdError {
        BadId,
        BadContext,
    }
}

define_error! {
    /// Error type for
    /// [`task_base_priority`](crate::System::task_base_priority) and
    /// [`task_effective_priority`](crate::System::task_effective_priority).
    pub enum GetTaskPriorityError: BadContextError, BadIdError, BadObjectStateError {
        BadId,
        BadContext,
        /// The task is Dormant.
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`current_task`](crate::System::current_task).
    pub enum GetCurrentTaskError: BadContextError {
        BadContext,
    }
}

define_error! {
    /// Error type for [`create_mutex`](crate::System::create_mutex).
    pub enum CreateMutexError: BadContextError, BadParamError {
        BadContext,
        /// The ceiling priority is out of range, or the control block
        /// is already a live mutex.
        BadParam,
    }
}

define_error! {
    /// Error type for [`delete_mutex`](crate::System::delete_mutex).
    pub enum DeleteMutexError: BadContextError, BadIdError, BadObjectStateError {
        BadId,
        BadContext,
        /// The mutex is held or has waiters.
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`lock_mutex`](crate::System::lock_mutex).
    pub enum LockMutexError: BadContextError, BadIdError, IllegalUseError {
        BadId,
        BadContext,
        /// The recursive lock count would overflow, or the ceiling
        /// protocol forbids this task from locking the mutex.
        IllegalUse,
        /// The wait was forcibly released.
        Interrupted,
    }
}

define_error! {
    /// Error type for
    /// [`lock_mutex_timeout`](crate::System::lock_mutex_timeout).
    pub enum LockMutexTimeoutError: BadContextError, BadIdError, IllegalUseError, WaitTimeoutError {
        BadId,
        BadContext,
        IllegalUse,
        /// The timeout elapsed (or, for a zero timeout, the mutex was
        /// held by another task).
        Timeout,
        /// The wait was forcibly released.
        Interrupted,
    }
}

define_error! {
    /// Error type for [`unlock_mutex`](crate::System::unlock_mutex).
    pub enum UnlockMutexError: BadContextError, BadIdError, IllegalUseError {
        BadId,
        BadContext,
        /// The calling task does not hold the mutex.
        IllegalUse,
    }
}

define_error! {
    /// Error type for [`set_time_slice`](crate::System::set_time_slice).
    pub enum SetTimeSliceError: BadContextError, BadParamError {
        BadContext,
        /// The priority is out of range.
        BadParam,
    }
}

define_error! {
    /// Error type for [`tick_count`](crate::System::tick_count).
    pub enum GetTickCountError: BadContextError {
        BadContext,
    }
}

define_error! {
    /// Error type for
    /// [`created_task_count`](crate::System::created_task_count).
    pub enum GetTaskCountError: BadContextError {
        BadContext,
    }
}

define_error! {
    /// Error type for [`mutex_is_locked`](crate::System::mutex_is_locked).
    pub enum QueryMutexError: BadContextError, BadIdError {
        BadId,
        BadContext,
    }
}

define_error! {
    /// Error type for
    /// [`set_deadlock_hook`](crate::System::set_deadlock_hook).
    pub enum SetDeadlockHookError: BadContextError {
        BadContext,
    }
}

/// Convert `e` to [`LockMutexError`], panicking if `e == Timeout`.
/// Used by waits with an infinite timeout, which can never time out.
#[inline]
pub(crate) fn expect_not_timeout(e: WaitTimeoutError) -> LockMutexError {
    match e {
        WaitTimeoutError::Interrupted => LockMutexError::Interrupted,
        WaitTimeoutError::Timeout => {
            unreachable!("got timeout result for a non-timeout wait")
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
