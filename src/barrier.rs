//! The snapshot-at-the-beginning write barrier.
//!
//! Every store of a reference-typed field goes through [`update`]. While
//! tracing is armed, the first store to a clean white object first copies
//! all of that object's reference fields into the mutator's log buffer, so
//! the tracer can see the reference graph as it was when the cycle began.
//! While snooping is armed, every stored value is recorded so it can be
//! added to the roots; that is what catches objects published between the
//! install-snoop and install-barrier handshakes.

use std::sync::atomic::Ordering;

use crate::header::ObjectHeader;
use crate::mutator::Mutator;

/// Perform `o.field[offset] = new` with the full barrier protocol. The body
/// runs inside the preemption bracket: a mutator suspended at a safepoint
/// has either not started or fully finished it.
#[inline]
pub(crate) fn update(mutator: &Mutator, o: *mut ObjectHeader, offset: usize, new: *mut ObjectHeader) {
    mutator.preempt_disable();
    debug_assert!(mutator.in_critical(), "barrier outside the preemption bracket");
    unsafe {
        debug_assert!(!(*o).is_free(), "store into a free cell");

        if mutator.trace_on.load(Ordering::Relaxed)
            && (*o).color() == mutator.runtime().colors().white()
            && (*o).log_pointer().is_null()
        {
            log_snapshot(mutator, o);
        }

        (*o).write_ref_field(offset, new);
        mutator.runtime().heap().mark_dirty(o as usize + offset);

        if mutator.snoop.load(Ordering::Relaxed) && !new.is_null() {
            (*mutator.snooped.get()).insert(new as usize);
        }
    }
    mutator.preempt_enable();
}

/// Copy `o`'s reference fields into the log buffer and try to publish the
/// snapshot. Losing the publication race to a barrier on another thread is
/// fine: the reservation is simply never committed and the winner's
/// snapshot stands. At most one snapshot per object per cycle ever becomes
/// visible.
#[cold]
unsafe fn log_snapshot(mutator: &Mutator, o: *mut ObjectHeader) {
    let ty = &*(*o).ty();
    let offsets = ty.reference_offsets;
    let buffer = &mut *mutator.buffer.get();
    let slots = buffer.reserve(offsets.len());
    for (i, &offset) in offsets.iter().enumerate() {
        *slots.add(i) = (*o).ref_field(offset);
    }
    if (*o).publish_log_pointer(slots) {
        buffer.commit(o, offsets.len());
        log::trace!("gc: logged {} field snapshot of {:p}", offsets.len(), o);
    }
}
