//! Execution-context checks shared by the API entry points.
use crate::{error::BadContextError, klock::CpuLockTokenRefMut, KernelTraits};

/// If the current context is not a task context, return
/// `Err(BadContext)`.
pub(super) fn expect_task_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_task_context() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// If the current context is not an interrupt context, return
/// `Err(BadContext)`. Used by the `i`-prefixed service variants.
pub(super) fn expect_interrupt_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_interrupt_context() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// If the current context is neither a task context nor the boot phase,
/// return `Err(BadContext)`. Object creation and deletion are the only
/// services available during boot.
pub(super) fn expect_task_or_boot_context<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> Result<(), BadContextError> {
    if Traits::is_task_context() {
        return Ok(());
    }
    let booting = !Traits::state().started.get(&*lock);
    if booting && !Traits::is_interrupt_context() {
        Ok(())
    } else {
        Err(BadContextError::BadContext)
    }
}
