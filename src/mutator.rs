//! Mutator-thread state for the collector.
//!
//! Every thread that allocates or stores managed references owns a
//! [`Mutator`]. The collector is the only other writer of its fields, and it
//! only writes them while it holds the mutator suspended at a safepoint, so
//! the barrier's hot path reads them with plain relaxed loads.
//!
//! Suspension is cooperative: the collector posts a request and the mutator
//! traps at its next allocation or barrier exit. A mutator that is about to
//! block (waiting for a collection, detaching) parks itself first so a
//! handshake can claim it without waiting.

use std::cell::{Cell, UnsafeCell};
use std::ops::Deref;
use std::ptr::{null_mut, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::ThreadId;

use atomic::Atomic;
use hashbrown::HashSet;
use parking_lot::{Condvar, Mutex};

/// Hasher for the root and snoop sets.
pub type DefaultHashBuilder = ahash::RandomState;

use crate::barrier;
use crate::globals::MAX_ALLOC;
use crate::header::{ObjectHeader, RefSlot, COLOR_A};
use crate::rtti::TypeDescriptor;
use crate::runtime::{GcError, ObjRef, Runtime};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum RunState {
    /// Executing managed code; will poll at the next safepoint.
    Running = 0,
    /// The collector asked this mutator to trap.
    SafepointRequested = 1,
    /// Trapped, waiting for the collector to resume it.
    AtSafepoint = 2,
    /// Blocked outside managed code; a handshake may claim it in place.
    Parked = 3,
    /// Parked and claimed by the collector; unpark must wait.
    ParkedRequested = 4,
}

pub(crate) struct SuspendToken {
    parked: bool,
}

const LOG_CHUNK: usize = 256;

struct LogChunk {
    len: usize,
    slots: Box<[RefSlot]>,
}

/// Cycle-scoped append-only store of pre-mutation field snapshots. Chunked
/// so that a published `log_pointer` into it stays valid while the buffer
/// keeps growing.
pub(crate) struct LogBuffer {
    chunks: Vec<LogChunk>,
    logged: Vec<*mut ObjectHeader>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            logged: Vec::new(),
        }
    }

    /// Make room for `count` contiguous slots at the tail and return the
    /// address of the first one. Nothing is committed yet: a barrier that
    /// loses the publication race simply never calls [`LogBuffer::commit`]
    /// and the slots are reused by the next reservation.
    pub fn reserve(&mut self, count: usize) -> *mut RefSlot {
        let needs_chunk = match self.chunks.last() {
            Some(chunk) => chunk.len + count > chunk.slots.len(),
            None => true,
        };
        if needs_chunk {
            self.chunks.push(LogChunk {
                len: 0,
                slots: vec![null_mut(); LOG_CHUNK.max(count)].into_boxed_slice(),
            });
        }
        let chunk = self.chunks.last_mut().unwrap();
        unsafe { chunk.slots.as_mut_ptr().add(chunk.len) }
    }

    /// Commit the last reservation as the published snapshot of `owner`.
    pub fn commit(&mut self, owner: *mut ObjectHeader, count: usize) {
        let chunk = self.chunks.last_mut().unwrap();
        chunk.len += count;
        self.logged.push(owner);
    }

    /// Number of snapshots published into this buffer this cycle.
    pub fn published(&self) -> usize {
        self.logged.len()
    }

    /// Null the log pointer of every object that published into this buffer,
    /// then drop the storage. Runs in the collector's prepare phase, after
    /// the disarm handshake has made sure no barrier is still appending.
    pub unsafe fn reset(&mut self) {
        for &obj in &self.logged {
            (*obj).clear_log_pointer();
        }
        self.logged.clear();
        self.chunks.clear();
    }
}

pub struct Mutator {
    runtime: Arc<Runtime>,
    serial: u64,
    thread: ThreadId,

    state: Atomic<RunState>,
    lock: Mutex<()>,
    cv_suspend: Condvar,
    cv_resume: Condvar,

    pub(crate) trace_on: AtomicBool,
    pub(crate) snoop: AtomicBool,
    pub(crate) alloc_color: AtomicU8,
    pub(crate) buffer: UnsafeCell<LogBuffer>,
    pub(crate) snooped: UnsafeCell<HashSet<usize, DefaultHashBuilder>>,
    roots: UnsafeCell<HashSet<usize, DefaultHashBuilder>>,

    no_preempt: Cell<u32>,
}

impl Mutator {
    fn new(runtime: Arc<Runtime>, serial: u64, phase: Phase) -> Self {
        Self {
            runtime,
            serial,
            thread: std::thread::current().id(),
            state: Atomic::new(RunState::Running),
            lock: Mutex::new(()),
            cv_suspend: Condvar::new(),
            cv_resume: Condvar::new(),
            trace_on: AtomicBool::new(phase.trace_on),
            snoop: AtomicBool::new(phase.snoop),
            alloc_color: AtomicU8::new(phase.alloc_black),
            buffer: UnsafeCell::new(LogBuffer::new()),
            snooped: UnsafeCell::new(HashSet::default()),
            roots: UnsafeCell::new(HashSet::default()),
            no_preempt: Cell::new(0),
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    // ---- preemption bracket -------------------------------------------

    #[inline(always)]
    pub(crate) fn preempt_disable(&self) {
        self.no_preempt.set(self.no_preempt.get() + 1);
    }

    #[inline(always)]
    pub(crate) fn preempt_enable(&self) {
        let nesting = self.no_preempt.get() - 1;
        self.no_preempt.set(nesting);
        if nesting == 0 {
            self.safepoint();
        }
    }

    #[inline(always)]
    pub(crate) fn in_critical(&self) -> bool {
        self.no_preempt.get() > 0
    }

    // ---- safepoint protocol -------------------------------------------

    /// Poll for a pending suspension request. One relaxed load on the fast
    /// path; allocation and the write barrier poll here on exit.
    #[inline(always)]
    pub fn safepoint(&self) {
        if self.state.load(Ordering::Relaxed) == RunState::SafepointRequested {
            self.safepoint_slow();
        }
    }

    #[cold]
    #[inline(never)]
    fn safepoint_slow(&self) {
        let mut guard = self.lock.lock();
        self.state.store(RunState::AtSafepoint, Ordering::Release);
        self.cv_suspend.notify_all();
        while self.state.load(Ordering::Acquire) == RunState::AtSafepoint {
            self.cv_resume.wait(&mut guard);
        }
    }

    /// Enter the parked state before blocking outside managed code.
    pub(crate) fn park(&self) {
        loop {
            match self.state.load(Ordering::Acquire) {
                RunState::Running => {
                    if self
                        .state
                        .compare_exchange(
                            RunState::Running,
                            RunState::Parked,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                RunState::SafepointRequested => self.safepoint_slow(),
                state => unreachable!("parking from state {:?}", state),
            }
        }
    }

    pub(crate) fn unpark(&self) {
        loop {
            match self.state.load(Ordering::Acquire) {
                RunState::Parked => {
                    if self
                        .state
                        .compare_exchange(
                            RunState::Parked,
                            RunState::Running,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                RunState::ParkedRequested => {
                    let mut guard = self.lock.lock();
                    while self.state.load(Ordering::Acquire) == RunState::ParkedRequested {
                        self.cv_resume.wait(&mut guard);
                    }
                }
                state => unreachable!("unparking from state {:?}", state),
            }
        }
    }

    /// Bring this mutator to a stop. Returns once it is guaranteed not to
    /// execute a managed store until [`Mutator::resume`], with any barrier
    /// that was in flight fully completed. Collector-only.
    pub(crate) unsafe fn suspend(&self) -> SuspendToken {
        let mut guard = self.lock.lock();
        loop {
            match self.state.load(Ordering::Acquire) {
                RunState::Running => {
                    if self
                        .state
                        .compare_exchange(
                            RunState::Running,
                            RunState::SafepointRequested,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        while self.state.load(Ordering::Acquire) != RunState::AtSafepoint {
                            self.cv_suspend.wait(&mut guard);
                        }
                        return SuspendToken { parked: false };
                    }
                }
                RunState::Parked => {
                    if self
                        .state
                        .compare_exchange(
                            RunState::Parked,
                            RunState::ParkedRequested,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return SuspendToken { parked: true };
                    }
                }
                state => unreachable!("suspending mutator in state {:?}", state),
            }
        }
    }

    pub(crate) unsafe fn resume(&self, token: SuspendToken) {
        let _guard = self.lock.lock();
        let restored = if token.parked {
            RunState::Parked
        } else {
            RunState::Running
        };
        self.state.store(restored, Ordering::Release);
        self.cv_resume.notify_all();
    }

    // ---- allocation ----------------------------------------------------

    /// Allocate a zeroed cell for `ty`, painted with this mutator's
    /// allocation color, and prepend it to the all-objects list.
    pub fn alloc_object(&self, ty: &'static TypeDescriptor) -> Result<ObjRef, GcError> {
        ty.validate();
        if ty.size > MAX_ALLOC {
            return Err(GcError::TooLarge(ty.size));
        }
        self.preempt_disable();
        let paint = self.alloc_color.load(Ordering::Relaxed);
        let result = match self.runtime.heap().alloc(ty.size, paint) {
            Some(cell) => {
                unsafe {
                    cell.as_ref().set_ty(ty);
                    // While the snoop window is open this allocation may
                    // still be painted the outgoing color; recording it
                    // makes it a root for the cycle, exactly like any
                    // other reference published before the roots
                    // handshake.
                    if self.snoop.load(Ordering::Relaxed) {
                        (*self.snooped.get()).insert(cell.as_ptr() as usize);
                    }
                }
                self.runtime.push_all_objects(cell.as_ptr());
                Ok(ObjRef::from_nonnull(cell))
            }
            None => Err(GcError::Exhausted),
        };
        self.preempt_enable();
        result
    }

    /// Allocate, and on heap exhaustion run one synchronous collection and
    /// retry before giving up. The caller turns the second failure into the
    /// managed out-of-memory condition.
    pub fn alloc_object_or_collect(&self, ty: &'static TypeDescriptor) -> Result<ObjRef, GcError> {
        match self.alloc_object(ty) {
            Err(GcError::Exhausted) => self.alloc_after_collect(ty),
            result => result,
        }
    }

    #[cold]
    fn alloc_after_collect(&self, ty: &'static TypeDescriptor) -> Result<ObjRef, GcError> {
        self.gc_wait();
        self.alloc_object(ty)
    }

    // ---- field access --------------------------------------------------

    /// The write barrier. Must wrap every store of a reference-typed field.
    pub fn write_ref(&self, obj: ObjRef, offset: usize, value: Option<ObjRef>) {
        barrier::update(
            self,
            obj.as_ptr(),
            offset,
            value.map_or(null_mut(), |v| v.as_ptr()),
        );
    }

    /// Plain field read; loads take no barrier.
    pub fn read_ref(&self, obj: ObjRef, offset: usize) -> Option<ObjRef> {
        unsafe { ObjRef::from_raw((*obj.as_ptr()).ref_field(offset)) }
    }

    // ---- roots ---------------------------------------------------------

    /// Register `obj` as a root of this thread until removed.
    pub fn add_root(&self, obj: ObjRef) {
        unsafe { (*self.roots.get()).insert(obj.addr()) };
    }

    pub fn remove_root(&self, obj: ObjRef) {
        unsafe { (*self.roots.get()).remove(&obj.addr()) };
    }

    pub(crate) unsafe fn copy_roots_into(&self, out: &mut HashSet<usize, DefaultHashBuilder>) {
        out.extend((*self.roots.get()).iter().copied());
    }

    pub(crate) unsafe fn take_snooped(&self) -> HashSet<usize, DefaultHashBuilder> {
        std::mem::take(&mut *self.snooped.get())
    }

    pub(crate) unsafe fn reset_log(&self) {
        (*self.buffer.get()).reset();
    }

    // ---- collection triggers ------------------------------------------

    /// Trigger a collection and block until the cycle finishes. Multiple
    /// concurrent waiters collapse onto a single cycle.
    pub fn gc_wait(&self) {
        self.park();
        self.runtime.conductor().wait();
        self.unpark();
    }

    /// Fire-and-forget collection trigger.
    pub fn gc_wake(&self) {
        self.runtime.conductor().wake();
    }
}

/// Global handshake phase, inherited by mutators attached mid-cycle. This
/// is what makes threads born during a collection implicitly safe: they
/// come up with exactly the flags the last handshake installed everywhere
/// else.
#[derive(Clone, Copy)]
pub(crate) struct Phase {
    pub snoop: bool,
    pub trace_on: bool,
    pub alloc_black: u8,
}

/// Buffer and snoop set of a mutator that detached while a cycle may have
/// been in flight. The collector drains these at its next root ingestion
/// (snooped values become roots) and prepare (log pointers get cleared).
pub(crate) struct Retired {
    pub buffer: LogBuffer,
    pub snooped: HashSet<usize, DefaultHashBuilder>,
}

struct RegistryInner {
    mutators: Vec<*mut Mutator>,
    phase: Phase,
    retired: Vec<Retired>,
    next_serial: u64,
}

/// The all-threads lock: every attached mutator, the current handshake
/// phase, and the graveyard of retired per-thread state.
pub(crate) struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                mutators: Vec::new(),
                phase: Phase {
                    snoop: false,
                    trace_on: false,
                    alloc_black: COLOR_A,
                },
                retired: Vec::new(),
                next_serial: 0,
            }),
        }
    }

    pub fn attach(&self, runtime: Arc<Runtime>) -> MutatorRef {
        let mut inner = self.inner.lock();
        let serial = inner.next_serial;
        inner.next_serial += 1;
        let mutator = Box::into_raw(Box::new(Mutator::new(runtime, serial, inner.phase)));
        inner.mutators.push(mutator);
        log::debug!("gc: attached mutator #{}", serial);
        MutatorRef {
            ptr: unsafe { NonNull::new_unchecked(mutator) },
        }
    }

    /// Remove a mutator, retiring its cycle-scoped state. The caller has
    /// already parked it, so a handshake in progress has either finished
    /// with it or will no longer see it.
    pub fn detach(&self, mutator: *mut Mutator) {
        let mut inner = self.inner.lock();
        inner.mutators.retain(|&m| m != mutator);
        let boxed = unsafe { Box::from_raw(mutator) };
        let retired = Retired {
            buffer: std::mem::replace(unsafe { &mut *boxed.buffer.get() }, LogBuffer::new()),
            snooped: unsafe { std::mem::take(&mut *boxed.snooped.get()) },
        };
        log::debug!("gc: detached mutator #{}", boxed.serial);
        inner.retired.push(retired);
    }

    /// One global handshake: update the inherited phase, then suspend each
    /// mutator in turn, apply `each`, and resume it. The calling thread's
    /// own mutator (if any) gets `each` applied in place; a thread cannot
    /// wait for itself to reach a safepoint.
    pub fn handshake(&self, name: &str, update: impl FnOnce(&mut Phase), mut each: impl FnMut(&Mutator)) {
        let current = std::thread::current().id();
        let mut inner = self.inner.lock();
        update(&mut inner.phase);
        log::trace!("gc: handshake '{}' over {} mutators", name, inner.mutators.len());
        for &mutator in &inner.mutators {
            unsafe {
                let mutator = &*mutator;
                if mutator.thread == current {
                    each(mutator);
                } else {
                    let token = mutator.suspend();
                    each(mutator);
                    mutator.resume(token);
                }
            }
        }
    }

    /// Visit every mutator under the all-threads lock without suspending
    /// anyone. Only sound for state that handshakes have already fenced off,
    /// which is exactly what the prepare phase needs.
    pub fn for_each_locked(&self, mut f: impl FnMut(&Mutator)) {
        let inner = self.inner.lock();
        for &mutator in &inner.mutators {
            f(unsafe { &*mutator });
        }
    }

    pub fn drain_retired_snoops(&self, roots: &mut HashSet<usize, DefaultHashBuilder>) {
        let mut inner = self.inner.lock();
        for retired in inner.retired.iter_mut() {
            roots.extend(retired.snooped.drain());
        }
    }

    pub fn take_retired(&self) -> Vec<Retired> {
        std::mem::take(&mut self.inner.lock().retired)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().mutators.len()
    }
}

// Mutator pointers in the registry are only dereferenced by the collector
// under the all-threads lock and the suspend protocol.
unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

/// Owning handle to an attached mutator. Dropping it detaches the thread.
pub struct MutatorRef {
    ptr: NonNull<Mutator>,
}

impl Deref for MutatorRef {
    type Target = Mutator;
    fn deref(&self) -> &Mutator {
        unsafe { self.ptr.as_ref() }
    }
}

impl Drop for MutatorRef {
    fn drop(&mut self) {
        unsafe {
            let mutator = self.ptr.as_ref();
            mutator.park();
            let runtime = mutator.runtime.clone();
            runtime.registry().detach(self.ptr.as_ptr());
        }
    }
}
