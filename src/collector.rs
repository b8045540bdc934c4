//! The collection cycle.
//!
//! One cycle is four global handshakes wrapped around a concurrent trace
//! and sweep:
//!
//! 1. install snoop: every store anywhere now records its value;
//! 2. install barrier: stores to clean white objects now snapshot first
//!    (the gap matters: snooping must already cover the whole system
//!    before tracing can begin, or a store could escape both);
//! 3. ingest roots: colors flip, fresh allocations turn black, thread
//!    roots and snoop sets drain into the global root set;
//! 4. disarm barrier: tracing is over, stores stop logging.
//!
//! Mutators keep running between handshakes; the only global stop is each
//! thread's own brief suspension.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use hashbrown::HashSet;

use crate::header::ObjectHeader;
use crate::mutator::DefaultHashBuilder;
use crate::runtime::Runtime;

/// Collector-private scratch, reused across cycles.
pub(crate) struct CollectorState {
    roots: HashSet<usize, DefaultHashBuilder>,
    mark_stack: Vec<*mut ObjectHeader>,
    scratch: Vec<*mut ObjectHeader>,
}

impl CollectorState {
    pub fn new() -> Self {
        Self {
            roots: HashSet::default(),
            mark_stack: Vec::new(),
            scratch: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn roots(&self) -> &HashSet<usize, DefaultHashBuilder> {
        &self.roots
    }
}

pub(crate) fn collection_cycle(rt: &Runtime, st: &mut CollectorState) {
    log::debug!("gc: cycle starting over {} mutators", rt.registry().count());
    install_snoop(rt);
    install_barrier(rt);
    get_roots(rt, st);
    trace_heap(rt, st);
    sweep(rt);
    prepare(rt, st);
}

/// Handshake 1: after this returns, every managed store in the system
/// records its stored value into the storing thread's snoop set.
pub(crate) fn install_snoop(rt: &Runtime) {
    rt.registry().handshake(
        "install snoop",
        |phase| phase.snoop = true,
        |m| m.snoop.store(true, Ordering::Relaxed),
    );
}

/// Handshake 2: after this returns, every store to a clean white object
/// logs a pre-mutation snapshot first.
pub(crate) fn install_barrier(rt: &Runtime) {
    rt.registry().handshake(
        "install barrier",
        |phase| phase.trace_on = true,
        |m| m.trace_on.store(true, Ordering::Relaxed),
    );
}

/// Flip the colors and run handshake 3: every mutator starts allocating
/// black, stops snooping, and surrenders its roots and snoop set.
pub(crate) fn get_roots(rt: &Runtime, st: &mut CollectorState) {
    rt.colors().flip();
    let black = rt.colors().black();

    let roots = &mut st.roots;
    rt.registry().handshake(
        "ingest roots",
        |phase| {
            phase.alloc_black = black;
            phase.snoop = false;
        },
        |m| unsafe {
            m.alloc_color.store(black, Ordering::Relaxed);
            m.snoop.store(false, Ordering::Relaxed);
            m.copy_roots_into(roots);
            roots.extend(m.take_snooped());
        },
    );

    // Threads that died since the last cycle may have snooped stores the
    // live handshake cannot see any more.
    rt.registry().drain_retired_snoops(roots);

    // Runtime globals.
    roots.extend(rt.global_roots().lock().iter().copied());

    log::trace!("gc: {} roots", roots.len());
}

/// Drain the mark stack. A clean object is read live; a dirty one is read
/// through its published snapshot, which holds the reference fields from
/// before its first mutation this cycle. Coloring is idempotent, so every
/// white object is expanded at most once and the loop terminates.
pub(crate) fn trace_heap(rt: &Runtime, st: &mut CollectorState) {
    let white = rt.colors().white();
    let black = rt.colors().black();

    for &root in &st.roots {
        st.mark_stack.push(root as *mut ObjectHeader);
    }

    let mut visited = 0usize;
    while let Some(o) = st.mark_stack.pop() {
        unsafe {
            if (*o).color() != white {
                continue;
            }
            visited += 1;
            let ty = &*(*o).ty();
            let offsets = ty.reference_offsets;
            let lp = (*o).log_pointer();
            if lp.is_null() {
                // Take a replica of the live fields, then make sure no
                // barrier published a snapshot while we were reading: if
                // one did, the replica may already contain post-store
                // values and the snapshot is the truth.
                st.scratch.clear();
                for &offset in offsets {
                    st.scratch.push((*o).ref_field(offset));
                }
                let lp = (*o).log_pointer();
                if lp.is_null() {
                    for &child in &st.scratch {
                        if !child.is_null() {
                            st.mark_stack.push(child);
                        }
                    }
                } else {
                    for i in 0..offsets.len() {
                        let child = *lp.add(i);
                        if !child.is_null() {
                            st.mark_stack.push(child);
                        }
                    }
                }
            } else {
                for i in 0..offsets.len() {
                    let child = *lp.add(i);
                    if !child.is_null() {
                        st.mark_stack.push(child);
                    }
                }
            }
            (*o).set_color(black);
        }
    }
    log::trace!("gc: traced {} objects", visited);
}

/// Handshake 4, then reclaim every cell the trace left white. The list head
/// races mutators prepending fresh allocations, so removing the first
/// element goes through a compare-exchange; on failure the new prefix is
/// walked to find the predecessor. Interior links are collector-owned.
pub(crate) fn sweep(rt: &Runtime) {
    rt.registry().handshake(
        "disarm barrier",
        |phase| phase.trace_on = false,
        |m| m.trace_on.store(false, Ordering::Relaxed),
    );

    let white = rt.colors().white();
    let head = rt.all_objects();
    let mut freed = 0usize;
    let mut last: *mut ObjectHeader = std::ptr::null_mut();
    let mut swept = head.load(Ordering::Acquire);
    while !swept.is_null() {
        unsafe {
            let next = (*swept).next();
            if (*swept).color() == white {
                if last.is_null() {
                    match head.compare_exchange(swept, next, Ordering::AcqRel, Ordering::Acquire) {
                        Ok(_) => {}
                        Err(mut cur) => {
                            // Mutators prepended since we read the head;
                            // walk the new prefix down to the victim.
                            while cur != swept {
                                last = cur;
                                cur = (*cur).next();
                            }
                            (*last).set_next(next);
                        }
                    }
                } else {
                    (*last).set_next(next);
                }
                debug_assert!(!(*swept).ty().is_null(), "typeless object on the list");
                rt.heap().free(swept);
                freed += 1;
            } else {
                last = swept;
            }
            swept = next;
        }
    }
    log::trace!("gc: swept {} objects", freed);
}

/// Clear every log pointer published this cycle and drop the buffers, then
/// reset the root set. No suspension needed: the disarm handshake already
/// fenced every barrier out of the buffers.
pub(crate) fn prepare(rt: &Runtime, st: &mut CollectorState) {
    rt.registry().for_each_locked(|m| unsafe { m.reset_log() });
    for mut retired in rt.registry().take_retired() {
        unsafe { retired.buffer.reset() };
    }
    st.roots.clear();
    debug_assert!(st.mark_stack.is_empty());
}

pub(crate) fn collector_loop(rt: Arc<Runtime>) {
    log::trace!("gc: collector thread started");
    let mut state = CollectorState::new();
    loop {
        log::trace!("gc: going to sleep");
        if !rt.conductor().next() {
            break;
        }
        log::trace!("gc: starting collection");
        collection_cycle(&rt, &mut state);
    }
    log::trace!("gc: collector thread exiting");
}
