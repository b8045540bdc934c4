//! Runtime assembly: the heap, the mutator registry, the conductor and the
//! collector thread, glued together behind the entry points the managed
//! runtime calls.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use hashbrown::HashSet;
use parking_lot::Mutex;
use thiserror::Error;

use crate::collector;
use crate::conductor::Conductor;
use crate::header::{ColorRegister, ObjectHeader};
use crate::heap::{Heap, HeapConfig, HeapStats};
use crate::mutator::{DefaultHashBuilder, MutatorRef, Registry};
use crate::rtti::TypeDescriptor;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GcError {
    #[error("failed to reserve the managed address range")]
    Reserve,
    #[error("failed to start the collector thread")]
    Collector,
    #[error("allocation of {0} bytes exceeds the largest size class")]
    TooLarge(usize),
    #[error("object heap exhausted")]
    Exhausted,
}

/// A reference to a managed object. Copyable and shareable; validity is the
/// collector's business, not the type system's.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ObjRef {
    ptr: NonNull<ObjectHeader>,
}

impl ObjRef {
    pub(crate) fn from_nonnull(ptr: NonNull<ObjectHeader>) -> Self {
        Self { ptr }
    }

    pub fn from_raw(ptr: *mut ObjectHeader) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr })
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut ObjectHeader {
        self.ptr.as_ptr()
    }

    #[inline(always)]
    pub fn addr(self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline(always)]
    pub fn header(&self) -> &ObjectHeader {
        unsafe { self.ptr.as_ref() }
    }

    /// Type descriptor stamped at allocation. Meaningless once the object
    /// has been reclaimed.
    pub fn ty(&self) -> &'static TypeDescriptor {
        unsafe { &*self.header().ty() }
    }
}

unsafe impl Send for ObjRef {}
unsafe impl Sync for ObjRef {}

pub struct Runtime {
    heap: Heap,
    registry: Registry,
    conductor: Conductor,
    colors: ColorRegister,
    all_objects: AtomicPtr<ObjectHeader>,
    global_roots: Mutex<HashSet<usize, DefaultHashBuilder>>,
}

impl Runtime {
    /// Reserve the heap, start the collector thread and wait for it to
    /// reach its first idle point.
    pub fn new(config: HeapConfig) -> Result<Arc<Runtime>, GcError> {
        let rt = Arc::new(Runtime {
            heap: Heap::new(config)?,
            registry: Registry::new(),
            conductor: Conductor::new(),
            colors: ColorRegister::new(),
            all_objects: AtomicPtr::new(std::ptr::null_mut()),
            global_roots: Mutex::new(HashSet::default()),
        });
        let for_collector = rt.clone();
        std::thread::Builder::new()
            .name("sable-gc".into())
            .spawn(move || collector::collector_loop(for_collector))
            .map_err(|_| GcError::Collector)?;
        rt.conductor.wait_idle();
        Ok(rt)
    }

    /// Register the calling thread as a mutator. The handle detaches it on
    /// drop.
    pub fn attach_current_thread(self: &Arc<Self>) -> MutatorRef {
        self.registry.attach(self.clone())
    }

    /// Trigger a collection without waiting for it.
    pub fn gc_wake(&self) {
        self.conductor.wake();
    }

    /// Stop the collector thread once any in-flight cycle completes. The
    /// heap stays usable for allocation; no further cycles run.
    pub fn shutdown(&self) {
        self.conductor.shutdown();
    }

    /// Pin `obj` as a root independent of any thread.
    pub fn add_global_root(&self, obj: ObjRef) {
        self.global_roots.lock().insert(obj.addr());
    }

    pub fn remove_global_root(&self, obj: ObjRef) {
        self.global_roots.lock().remove(&obj.addr());
    }

    /// Conservative address test: the base of the mapped cell containing
    /// `addr`, if there is one.
    pub fn find(&self, addr: usize) -> Option<ObjRef> {
        self.heap.find(addr).map(ObjRef::from_nonnull)
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Number of objects on the all-objects list. Only meaningful while no
    /// mutator is allocating and no sweep is running.
    pub fn live_objects(&self) -> usize {
        let mut count = 0;
        let mut cur = self.all_objects.load(Ordering::Acquire);
        while !cur.is_null() {
            unsafe {
                debug_assert!(!(*cur).is_free(), "free cell on the all-objects list");
                count += 1;
                cur = (*cur).next();
            }
        }
        count
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn conductor(&self) -> &Conductor {
        &self.conductor
    }

    pub(crate) fn colors(&self) -> &ColorRegister {
        &self.colors
    }

    pub(crate) fn all_objects(&self) -> &AtomicPtr<ObjectHeader> {
        &self.all_objects
    }

    pub(crate) fn global_roots(&self) -> &Mutex<HashSet<usize, DefaultHashBuilder>> {
        &self.global_roots
    }

    /// Lock-free prepend to the all-objects list, racing other allocators
    /// and the sweep's head removal.
    pub(crate) fn push_all_objects(&self, obj: *mut ObjectHeader) {
        let mut head = self.all_objects.load(Ordering::Relaxed);
        loop {
            unsafe { (*obj).set_next(head) };
            match self.all_objects.compare_exchange_weak(
                head,
                obj,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
    }
}
