//! Task ready queue implementation (internal use only).
//!
//! **This module is exempt from the API stability guarantee.**
use core::fmt;

use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    task::TaskCb,
    utils::{
        intrusive_list::{Ident, ListAccessorCell, StaticListHead},
        Init, PrioBitmap,
    },
    KernelTraits, PortThreading,
};

/// Represents the scheduler's ready structure: one FIFO queue of Ready
/// tasks per priority level, plus a bitmap tracking which queues are
/// non-empty.
///
/// This trait is not intended to be implemented on custom types.
pub trait Queue<Traits>: Send + Sync + Init + 'static + private::Sealed {
    /// Insert `task` at the back of the ready queue for its effective
    /// priority and set the corresponding bitmap bit.
    ///
    /// The task must not currently be in any queue.
    fn push_back_task(&self, ctx: Ctx<'_, Traits>, task: &'static TaskCb<Traits>)
    where
        Traits: KernelTraits;

    /// Remove `task` from the ready queue for `priority`. Returns
    /// `true` if that queue became empty (in which case the bitmap bit
    /// was cleared).
    ///
    /// The task must have lastly been inserted with that priority.
    fn remove_task(
        &self,
        ctx: Ctx<'_, Traits>,
        task: &'static TaskCb<Traits>,
        priority: usize,
    ) -> bool
    where
        Traits: KernelTraits;

    /// Get the head of the ready queue for `priority`.
    fn front_task_at(
        &self,
        ctx: Ctx<'_, Traits>,
        priority: usize,
    ) -> Option<&'static TaskCb<Traits>>
    where
        Traits: KernelTraits;

    /// Find the most urgent (lowest-numbered) priority with a ready
    /// task.
    fn highest_ready_priority(&self, ctx: Ctx<'_, Traits>) -> Option<usize>
    where
        Traits: KernelTraits;

    /// Move `task` from the queue for `old_priority` to the back of
    /// the queue for its current effective priority, updating the
    /// bitmap. The two priorities may be equal, in which case this
    /// degenerates to the round-robin rotation.
    fn reposition_task(
        &self,
        ctx: Ctx<'_, Traits>,
        task: &'static TaskCb<Traits>,
        old_priority: usize,
    ) where
        Traits: KernelTraits;

    /// Read the ready bitmap bit for `priority` (invariant audits).
    #[cfg(test)]
    fn ready_bit(&self, ctx: Ctx<'_, Traits>, priority: usize) -> bool
    where
        Traits: KernelTraits;
}

/// Implements [the sealed trait pattern], which prevents [`Queue`]
/// against downstream implementations.
///
/// [the sealed trait pattern]: https://rust-lang.github.io/api-guidelines/future-proofing.html
mod private {
    pub trait Sealed {}
}

/// The context type for [`Queue`]. Only constructible inside the
/// kernel, which keeps the trait methods uncallable from outside even
/// though the trait is nominally public.
pub struct Ctx<'a, Traits> {
    pub(super) lock: CpuLockTokenRefMut<'a, Traits>,
}

impl<'a, Traits: PortThreading> From<CpuLockTokenRefMut<'a, Traits>> for Ctx<'a, Traits> {
    #[inline]
    fn from(lock: CpuLockTokenRefMut<'a, Traits>) -> Self {
        Self { lock }
    }
}

/// The ready queue implementation backed by a set of queues segregated
/// by the priorities of contained tasks.
///
/// `LEN` must equal [`KernelCfg1::NUM_PRIORITY_LEVELS`] and `Bitmap`
/// must be able to hold `LEN` bits.
///
/// [`KernelCfg1::NUM_PRIORITY_LEVELS`]: crate::KernelCfg1::NUM_PRIORITY_LEVELS
pub struct BitmapQueue<Traits: PortThreading, Bitmap: 'static, const LEN: usize> {
    /// The set of segregated task ready queues, in which each queue
    /// stores the list of Ready tasks at the corresponding priority.
    ///
    /// Invariant: `queues[i].first.is_some() == bitmap.get(i)`
    queues: [CpuLockCell<Traits, StaticListHead<TaskCb<Traits>>>; LEN],

    /// The task ready bitmap, in which each bit indicates whether the
    /// segregated queue corresponding to that bit contains a task or
    /// not.
    bitmap: CpuLockCell<Traits, Bitmap>,
}

impl<Traits: PortThreading, Bitmap: Init + 'static, const LEN: usize> Init
    for BitmapQueue<Traits, Bitmap, LEN>
{
    const INIT: Self = Self {
        queues: Init::INIT,
        bitmap: Init::INIT,
    };
}

impl<Traits: KernelTraits, Bitmap: PrioBitmap, const LEN: usize> fmt::Debug
    for BitmapQueue<Traits, Bitmap, LEN>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BitmapQueue")
            .field("bitmap", &self.bitmap)
            .finish_non_exhaustive()
    }
}

/// Get a `ListAccessorCell` used to access a task ready queue.
macro_rules! list_accessor {
    ($head:expr, $key:expr) => {
        ListAccessorCell::new($head, |task_cb: &TaskCb<_>| &task_cb.link, $key)
    };
}

impl<Traits: KernelTraits, Bitmap: PrioBitmap, const LEN: usize> Queue<Traits>
    for BitmapQueue<Traits, Bitmap, LEN>
{
    #[inline]
    fn push_back_task(&self, Ctx { mut lock }: Ctx<'_, Traits>, task: &'static TaskCb<Traits>) {
        let pri = task.effective_priority.get(&*lock);

        if list_accessor!(&self.queues[pri], lock.borrow_mut())
            .push_back(Ident(task))
            .is_err()
        {
            Traits::fatal_error("task is already in a queue");
        }

        self.bitmap.write(&mut *lock).set(pri);
    }

    #[inline]
    fn remove_task(
        &self,
        Ctx { mut lock }: Ctx<'_, Traits>,
        task: &'static TaskCb<Traits>,
        priority: usize,
    ) -> bool {
        let mut accessor = list_accessor!(&self.queues[priority], lock.borrow_mut());
        if accessor.remove(Ident(task)).is_err() {
            Traits::fatal_error("task is not in the ready queue");
        }
        let became_empty = accessor.is_empty();

        if became_empty {
            self.bitmap.write(&mut *lock).clear(priority);
        }

        became_empty
    }

    #[inline]
    fn front_task_at(
        &self,
        Ctx { mut lock }: Ctx<'_, Traits>,
        priority: usize,
    ) -> Option<&'static TaskCb<Traits>> {
        list_accessor!(&self.queues[priority], lock.borrow_mut())
            .front()
            .map(|Ident(task)| task)
    }

    #[inline]
    fn highest_ready_priority(&self, Ctx { lock }: Ctx<'_, Traits>) -> Option<usize> {
        self.bitmap.read(&*lock).find_set()
    }

    #[inline]
    fn reposition_task(
        &self,
        Ctx { mut lock }: Ctx<'_, Traits>,
        task: &'static TaskCb<Traits>,
        old_priority: usize,
    ) {
        let old_pri_empty = {
            let mut accessor = list_accessor!(&self.queues[old_priority], lock.borrow_mut());
            if accessor.remove(Ident(task)).is_err() {
                Traits::fatal_error("task is not in the ready queue");
            }
            accessor.is_empty()
        };

        let pri = task.effective_priority.get(&*lock);
        list_accessor!(&self.queues[pri], lock.borrow_mut())
            .push_back(Ident(task))
            .unwrap_or_else(|_| Traits::fatal_error("task is already in a queue"));

        // Clear the old bit first so that rotation (`pri ==
        // old_priority`) nets out to the bit staying set.
        let bitmap = self.bitmap.write(&mut *lock);
        if old_pri_empty {
            bitmap.clear(old_priority);
        }
        bitmap.set(pri);
    }

    #[cfg(test)]
    fn ready_bit(&self, Ctx { lock }: Ctx<'_, Traits>, priority: usize) -> bool {
        self.ready_bit_inner(lock, priority)
    }
}

impl<Traits: KernelTraits, Bitmap: PrioBitmap, const LEN: usize> BitmapQueue<Traits, Bitmap, LEN> {
    #[cfg(test)]
    fn ready_bit_inner(&self, lock: CpuLockTokenRefMut<'_, Traits>, priority: usize) -> bool {
        self.bitmap.read(&*lock).get(priority)
    }
}

impl<Traits: KernelTraits, Bitmap: PrioBitmap, const LEN: usize> private::Sealed
    for BitmapQueue<Traits, Bitmap, LEN>
{
}
