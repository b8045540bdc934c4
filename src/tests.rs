use std::sync::Arc;

use crate::collector::{self, CollectorState};
use crate::globals::*;
use crate::header::{COLOR_BLUE, HEADER_SIZE};
use crate::heap::HeapConfig;
use crate::pages::{PageEntry, PageLevel, ENTRY_DIRTY, ENTRY_HUGE, ENTRY_PRESENT};
use crate::rtti::TypeDescriptor;
use crate::runtime::{GcError, ObjRef, Runtime};

// Reference-field offsets used by the test types.
const F0: usize = 32;
const F1: usize = 40;

fn test_config() -> HeapConfig {
    HeapConfig {
        subpools_per_pool: 2,
        physical_budget: 256 * MB,
    }
}

fn test_runtime() -> Arc<Runtime> {
    let _ = env_logger::builder().is_test(true).try_init();
    Runtime::new(test_config()).unwrap()
}

fn leak_ty(name: &'static str, size: usize, offsets: &[usize]) -> &'static TypeDescriptor {
    Box::leak(Box::new(TypeDescriptor {
        size,
        reference_offsets: Box::leak(offsets.to_vec().into_boxed_slice()),
        name,
    }))
}

fn node1() -> &'static TypeDescriptor {
    leak_ty("Node1", 40, &[F0])
}

fn node2() -> &'static TypeDescriptor {
    leak_ty("Node2", 48, &[F0, F1])
}

#[test]
fn size_class_math() {
    assert_eq!(aligned_cell_size(1), 32);
    assert_eq!(aligned_cell_size(32), 32);
    assert_eq!(aligned_cell_size(33), 64);
    assert_eq!(aligned_cell_size(48), 64);
    assert_eq!(aligned_cell_size(96), 128);

    assert_eq!(pool_index(32), 0);
    assert_eq!(pool_index(33), 1);
    assert_eq!(pool_index(48), 1);
    assert_eq!(pool_index(96), 2);
    assert_eq!(pool_index(4 * KB), 7);
    assert_eq!(pool_index(2 * MB), 16);
    assert_eq!(pool_index(4 * MB), 17);
    assert_eq!(pool_index(512 * MB), 24);

    for idx in 0..POOL_COUNT {
        assert_eq!(pool_index(cell_size(idx)), idx);
    }
}

#[test]
fn page_entry_masks_match_bitfield() {
    assert_eq!(PageEntry::new().with_present(true).into_bytes()[0], ENTRY_PRESENT);
    assert_eq!(PageEntry::new().with_huge(true).into_bytes()[0], ENTRY_HUGE);
    assert_eq!(PageEntry::new().with_dirty(true).into_bytes()[0], ENTRY_DIRTY);
}

#[test]
fn object_header_is_one_min_cell() {
    assert_eq!(HEADER_SIZE, MIN_CELL);
}

#[test]
fn find_is_the_inverse_of_the_address_layout() {
    let rt = test_runtime();
    let m = rt.attach_current_thread();

    let obj = m.alloc_object(node1()).unwrap();
    let addr = obj.addr();
    let cell = rt.heap().cell_size_of(addr);
    assert_eq!(cell, 64);
    assert_eq!(addr % cell, 0);

    // every interior address maps back to the cell base
    for k in 0..cell {
        assert_eq!(rt.find(addr + k).unwrap().addr(), addr);
    }

    // outside the managed range
    assert!(rt.find(rt.heap().base() - 1).is_none());
    // inside the range but in a pool no one has touched
    let untouched = rt.heap().base() + 25 * (2 * GB);
    assert!(rt.find(untouched).is_none());

    rt.shutdown();
}

#[test]
fn page_presence_levels() {
    let rt = test_runtime();
    let m = rt.attach_current_thread();

    let probe = rt.heap().base() + 24 * (2 * GB);
    assert!(!rt.heap().is_present(probe, PageLevel::SubPool));
    assert!(!rt.heap().is_present(probe, PageLevel::Huge));
    assert!(!rt.heap().is_present(probe, PageLevel::Small));

    let obj = m.alloc_object(node1()).unwrap();
    assert!(rt.heap().is_present(obj.addr(), PageLevel::SubPool));
    assert!(rt.heap().is_present(obj.addr(), PageLevel::Huge));
    assert!(rt.heap().is_present(obj.addr(), PageLevel::Small));

    rt.shutdown();
}

// Scenario: single-threaded acyclic graph. A -> B -> C, root dropped,
// everything reclaimed in one synchronous cycle.
#[test]
fn acyclic_graph_is_reclaimed() {
    let rt = test_runtime();
    let m = rt.attach_current_thread();

    let a = m.alloc_object(node1()).unwrap();
    let b = m.alloc_object(node1()).unwrap();
    let c = m.alloc_object(node1()).unwrap();
    m.write_ref(a, F0, Some(b));
    m.write_ref(b, F0, Some(c));
    m.add_root(a);
    assert_eq!(rt.live_objects(), 3);

    m.remove_root(a);
    m.gc_wait();

    assert_eq!(rt.live_objects(), 0);
    for obj in [a, b, c].iter() {
        assert_eq!(obj.header().color(), COLOR_BLUE);
    }
    assert_eq!(rt.stats().cells_freed, 3);

    // the cells stay mapped for reuse
    let mut blue = 0;
    rt.heap().iterate_objects(|cell| {
        if unsafe { (*cell).is_free() } {
            blue += 1;
        }
    });
    assert!(blue >= 3);

    rt.shutdown();
}

// Scenario: cycle reclamation. A and B reference each other, no roots.
#[test]
fn reference_cycle_is_reclaimed() {
    let rt = test_runtime();
    let m = rt.attach_current_thread();

    let a = m.alloc_object(node1()).unwrap();
    let b = m.alloc_object(node1()).unwrap();
    m.write_ref(a, F0, Some(b));
    m.write_ref(b, F0, Some(a));

    m.gc_wait();

    assert_eq!(rt.live_objects(), 0);
    assert_eq!(a.header().color(), COLOR_BLUE);
    assert_eq!(b.header().color(), COLOR_BLUE);

    rt.shutdown();
}

// Scenario: the barrier preserves a live child. The only reference to B is
// overwritten while tracing is armed; the pre-mutation snapshot must carry
// B through the cycle.
#[test]
fn barrier_preserves_overwritten_child() {
    let rt = test_runtime();
    let m = rt.attach_current_thread();
    let mut st = CollectorState::new();

    let a = m.alloc_object(node1()).unwrap();
    let b = m.alloc_object(node1()).unwrap();
    m.write_ref(a, F0, Some(b));
    m.add_root(a);

    collector::install_snoop(&rt);
    collector::install_barrier(&rt);
    collector::get_roots(&rt, &mut st);

    // A is white now; this store must log the snapshot [B] first.
    m.write_ref(a, F0, None);
    assert!(!a.header().log_pointer().is_null());
    assert_eq!(unsafe { (*m.buffer.get()).published() }, 1);

    collector::trace_heap(&rt, &mut st);
    assert_eq!(b.header().color(), rt.colors().black());

    collector::sweep(&rt);
    collector::prepare(&rt, &mut st);

    assert_eq!(rt.live_objects(), 2);
    assert!(a.header().log_pointer().is_null());

    // next cycle sees the overwritten field and lets B go
    m.gc_wait();
    assert_eq!(rt.live_objects(), 1);
    assert_eq!(b.header().color(), COLOR_BLUE);

    rt.shutdown();
}

// Scenario: the snoop set catches a reference published between the two
// arming handshakes, even if the heap location it was stored to is
// overwritten before tracing starts.
#[test]
fn snoop_captures_late_publication() {
    let rt = test_runtime();
    let m = rt.attach_current_thread();
    let mut st = CollectorState::new();

    let container = m.alloc_object(node1()).unwrap();
    let x = m.alloc_object(node1()).unwrap();
    m.add_root(container);

    collector::install_snoop(&rt);
    // store between the handshakes: X lands in the snoop set
    m.write_ref(container, F0, Some(x));
    // and is promptly overwritten, so only the snoop set still knows it
    m.write_ref(container, F0, None);
    collector::install_barrier(&rt);
    collector::get_roots(&rt, &mut st);

    assert!(st.roots().contains(&x.addr()));

    collector::trace_heap(&rt, &mut st);
    collector::sweep(&rt);
    collector::prepare(&rt, &mut st);

    assert_eq!(x.header().color(), rt.colors().black());
    assert_eq!(rt.live_objects(), 2);

    // the snoop root was good for one cycle only
    m.gc_wait();
    assert_eq!(x.header().color(), COLOR_BLUE);
    assert_eq!(rt.live_objects(), 1);

    rt.shutdown();
}

// Scenario: an object allocated after the roots handshake is born black and
// survives the cycle it was born in, then dies in the next one.
#[test]
fn fresh_allocation_survives_current_cycle() {
    let rt = test_runtime();
    let m = rt.attach_current_thread();
    let mut st = CollectorState::new();

    collector::install_snoop(&rt);
    collector::install_barrier(&rt);
    collector::get_roots(&rt, &mut st);

    let d = m.alloc_object(node1()).unwrap();
    assert_eq!(d.header().color(), rt.colors().black());

    collector::trace_heap(&rt, &mut st);
    collector::sweep(&rt);
    collector::prepare(&rt, &mut st);

    assert_eq!(rt.live_objects(), 1);

    m.gc_wait();
    assert_eq!(rt.live_objects(), 0);
    assert_eq!(d.header().color(), COLOR_BLUE);

    rt.shutdown();
}

// Scenario: size-class isolation. Two batches in different pools, all
// dropped; both pools drain completely and the address math still derives
// their cell sizes afterwards.
#[test]
fn size_classes_stay_isolated() {
    let rt = test_runtime();
    let m = rt.attach_current_thread();

    let small = leak_ty("Small48", 48, &[F0]);
    let fat = leak_ty("Fat96", 96, &[F0]);

    let mut addrs = Vec::new();
    for _ in 0..100 {
        addrs.push((m.alloc_object(small).unwrap().addr(), 64));
        addrs.push((m.alloc_object(fat).unwrap().addr(), 128));
    }
    assert_eq!(rt.live_objects(), 200);

    m.gc_wait();

    assert_eq!(rt.live_objects(), 0);
    let mut live = 0;
    rt.heap().iterate_objects(|cell| {
        if !unsafe { (*cell).is_free() } {
            live += 1;
        }
    });
    assert_eq!(live, 0);

    for &(addr, cell) in &addrs {
        assert_eq!(rt.heap().cell_size_of(addr), cell);
        assert_eq!(addr % cell, 0);
        assert_eq!(rt.find(addr + cell / 2).unwrap().addr(), addr);
    }

    rt.shutdown();
}

// Any number of barrier hits on one object publish exactly one snapshot per
// cycle.
#[test]
fn barrier_publishes_at_most_once() {
    let rt = test_runtime();
    let m = rt.attach_current_thread();
    let mut st = CollectorState::new();

    let a = m.alloc_object(node1()).unwrap();
    let b = m.alloc_object(node1()).unwrap();
    m.add_root(a);
    m.add_root(b);

    collector::install_snoop(&rt);
    collector::install_barrier(&rt);
    collector::get_roots(&rt, &mut st);

    for i in 0..32 {
        let value = if i % 2 == 0 { Some(b) } else { None };
        m.write_ref(a, F0, value);
    }
    let published = a.header().log_pointer();
    assert!(!published.is_null());
    assert_eq!(unsafe { (*m.buffer.get()).published() }, 1);

    for _ in 0..8 {
        m.write_ref(a, F0, None);
    }
    assert_eq!(a.header().log_pointer(), published);

    collector::trace_heap(&rt, &mut st);
    collector::sweep(&rt);
    collector::prepare(&rt, &mut st);
    assert_eq!(unsafe { (*m.buffer.get()).published() }, 0);

    rt.shutdown();
}

// The published snapshot is the reference fields as they were before the
// first barrier of the cycle fired.
#[test]
fn snapshot_matches_pre_mutation_fields() {
    let rt = test_runtime();
    let m = rt.attach_current_thread();
    let mut st = CollectorState::new();

    let a = m.alloc_object(node2()).unwrap();
    let b = m.alloc_object(node1()).unwrap();
    let c = m.alloc_object(node1()).unwrap();
    m.write_ref(a, F0, Some(b));
    m.write_ref(a, F1, Some(c));
    m.add_root(a);

    collector::install_snoop(&rt);
    collector::install_barrier(&rt);
    collector::get_roots(&rt, &mut st);

    m.write_ref(a, F0, None);
    m.write_ref(a, F1, None);

    let snapshot = a.header().log_pointer();
    assert!(!snapshot.is_null());
    unsafe {
        assert_eq!(*snapshot.add(0), b.as_ptr());
        assert_eq!(*snapshot.add(1), c.as_ptr());
    }

    collector::trace_heap(&rt, &mut st);
    assert_eq!(b.header().color(), rt.colors().black());
    assert_eq!(c.header().color(), rt.colors().black());
    collector::sweep(&rt);
    collector::prepare(&rt, &mut st);

    rt.shutdown();
}

// The four handshakes install and remove flags in order.
#[test]
fn handshake_ordering_is_observable() {
    let rt = test_runtime();
    let m = rt.attach_current_thread();
    let mut st = CollectorState::new();

    use std::sync::atomic::Ordering;

    assert!(!m.snoop.load(Ordering::Relaxed));
    assert!(!m.trace_on.load(Ordering::Relaxed));
    let old_black = rt.colors().black();
    assert_eq!(m.alloc_color.load(Ordering::Relaxed), old_black);

    collector::install_snoop(&rt);
    assert!(m.snoop.load(Ordering::Relaxed));
    assert!(!m.trace_on.load(Ordering::Relaxed));

    collector::install_barrier(&rt);
    assert!(m.snoop.load(Ordering::Relaxed));
    assert!(m.trace_on.load(Ordering::Relaxed));

    collector::get_roots(&rt, &mut st);
    let new_black = rt.colors().black();
    assert_ne!(new_black, old_black);
    assert!(!m.snoop.load(Ordering::Relaxed));
    assert!(m.trace_on.load(Ordering::Relaxed));
    assert_eq!(m.alloc_color.load(Ordering::Relaxed), new_black);

    collector::trace_heap(&rt, &mut st);
    collector::sweep(&rt);
    assert!(!m.trace_on.load(Ordering::Relaxed));
    collector::prepare(&rt, &mut st);

    rt.shutdown();
}

// Physical exhaustion mid-cell rolls back every page the attempt acquired;
// the next, smaller allocation still succeeds from what is left.
#[test]
fn physical_oom_rolls_back_partial_cells() {
    let _ = env_logger::builder().is_test(true).try_init();
    let rt = Runtime::new(HeapConfig {
        subpools_per_pool: 2,
        // room for two level tables, one huge page, and change
        physical_budget: 2 * PAGE_SIZE + 3 * MB,
    })
    .unwrap();
    let m = rt.attach_current_thread();

    // 4MB cells need two huge pages; only one fits the budget.
    let big = leak_ty("Big4M", 4 * MB, &[]);
    assert_eq!(m.alloc_object(big), Err(GcError::Exhausted));
    // the failed attempts left nothing committed but the two sub-pool
    // tables the scan walked through
    assert_eq!(rt.stats().physical_used, 2 * PAGE_SIZE);

    // a single-huge-page cell still fits
    let medium = leak_ty("Med2M", 2 * MB, &[]);
    let obj = m.alloc_object(medium).unwrap();
    assert_eq!(rt.heap().cell_size_of(obj.addr()), 2 * MB);
    assert_eq!(rt.stats().physical_used, 3 * PAGE_SIZE + 2 * MB);

    rt.shutdown();
}

#[test]
fn oversized_allocation_is_rejected() {
    let rt = test_runtime();
    let m = rt.attach_current_thread();

    let monster = leak_ty("Monster", 600 * MB, &[]);
    assert_eq!(m.alloc_object(monster), Err(GcError::TooLarge(600 * MB)));

    rt.shutdown();
}

// Allocation and the write barrier leave card marks; draining the dirty
// walk clears them until the next store.
#[test]
fn dirty_cards_track_stores() {
    let rt = test_runtime();
    let m = rt.attach_current_thread();

    let a = m.alloc_object(node1()).unwrap();
    assert!(rt.heap().page_dirty(a.addr(), PageLevel::Small));

    let mut seen = Vec::new();
    rt.heap().iterate_dirty_objects(|cell| seen.push(cell as usize));
    assert!(seen.contains(&a.addr()));

    seen.clear();
    rt.heap().iterate_dirty_objects(|cell| seen.push(cell as usize));
    assert!(seen.is_empty());
    assert!(!rt.heap().page_dirty(a.addr(), PageLevel::Small));

    m.write_ref(a, F0, None);
    assert!(rt.heap().page_dirty(a.addr(), PageLevel::Small));

    rt.heap().clear_page_dirty(a.addr(), PageLevel::Small);
    assert!(!rt.heap().page_dirty(a.addr(), PageLevel::Small));

    rt.shutdown();
}

// A mutator that detaches mid-arming leaves its snoop set behind; the next
// root ingestion must still see it.
#[test]
fn retired_snoop_set_reaches_the_roots() {
    let rt = test_runtime();
    let mut st = CollectorState::new();

    collector::install_snoop(&rt);

    let (tx, rx) = std::sync::mpsc::channel();
    let worker_rt = rt.clone();
    std::thread::spawn(move || {
        let m = worker_rt.attach_current_thread();
        // phase inheritance: attached mid-cycle, snooping from birth
        assert!(m.snoop.load(std::sync::atomic::Ordering::Relaxed));
        let container = m.alloc_object(node1()).unwrap();
        let x = m.alloc_object(node1()).unwrap();
        m.write_ref(container, F0, Some(x));
        tx.send((container, x)).unwrap();
    })
    .join()
    .unwrap();
    let (container, x) = rx.recv().unwrap();

    collector::install_barrier(&rt);
    collector::get_roots(&rt, &mut st);
    assert!(st.roots().contains(&x.addr()));

    collector::trace_heap(&rt, &mut st);
    collector::sweep(&rt);
    collector::prepare(&rt, &mut st);

    // both were snooped by the dead thread (the container at allocation,
    // x when it was stored) and survive exactly one cycle
    assert_eq!(x.header().color(), rt.colors().black());
    assert_eq!(container.header().color(), rt.colors().black());

    let m = rt.attach_current_thread();
    m.gc_wait();
    assert_eq!(rt.live_objects(), 0);
    assert_eq!(x.header().color(), COLOR_BLUE);

    rt.shutdown();
}

#[test]
fn global_roots_pin_objects() {
    let rt = test_runtime();
    let m = rt.attach_current_thread();

    let a = m.alloc_object(node1()).unwrap();
    rt.add_global_root(a);

    m.gc_wait();
    assert_eq!(rt.live_objects(), 1);

    rt.remove_global_root(a);
    m.gc_wait();
    assert_eq!(rt.live_objects(), 0);

    rt.shutdown();
}

#[test]
fn allocation_retries_after_collection() {
    let _ = env_logger::builder().is_test(true).try_init();
    let rt = Runtime::new(HeapConfig {
        subpools_per_pool: 2,
        // one sub-pool table plus one huge page: exactly one 2MB cell
        physical_budget: PAGE_SIZE + 2 * MB,
    })
    .unwrap();
    let m = rt.attach_current_thread();

    let medium = leak_ty("Med2M", 2 * MB, &[]);
    let first = m.alloc_object(medium).unwrap();
    // the pool's only mappable cell is taken; a plain alloc fails
    assert_eq!(m.alloc_object(medium), Err(GcError::Exhausted));

    // dropping the object and letting the retry path collect frees the cell
    let second = m.alloc_object_or_collect(medium).unwrap();
    assert_eq!(second.addr(), first.addr());

    rt.shutdown();
}

#[test]
fn repeated_cycles_stay_consistent() {
    let rt = test_runtime();
    let m = rt.attach_current_thread();

    for round in 0..5 {
        let keep: Vec<ObjRef> = (0..25)
            .map(|_| m.alloc_object(node1()).unwrap())
            .collect();
        let _drop: Vec<ObjRef> = (0..25)
            .map(|_| m.alloc_object(node1()).unwrap())
            .collect();
        for obj in &keep {
            m.add_root(*obj);
        }

        m.gc_wait();
        assert_eq!(rt.live_objects(), 25, "round {}", round);

        for obj in &keep {
            assert_ne!(obj.header().color(), COLOR_BLUE);
            m.remove_root(*obj);
        }
        m.gc_wait();
        assert_eq!(rt.live_objects(), 0, "round {}", round);
    }

    rt.shutdown();
}

// Randomised multi-mutator workload: graphs are built, rewired and
// unrooted while asynchronous cycles run. Afterwards a few quiescent
// cycles must drain the heap completely: one to absorb any cycle that was
// in flight at detach time, one to harvest retired snoop sets, one to
// reclaim what those kept alive.
#[test]
fn concurrent_mutators_under_collection() {
    use rand::Rng;

    let rt = test_runtime();
    let mut workers = Vec::new();
    for worker in 0..4u64 {
        let rt = rt.clone();
        workers.push(std::thread::spawn(move || {
            let m = rt.attach_current_thread();
            let mut rng = rand::thread_rng();
            // Stores only ever go through objects this thread still has
            // rooted; anything unrooted may be reclaimed under our feet.
            let mut rooted: Vec<ObjRef> = Vec::new();
            for step in 0..400usize {
                match rng.gen_range(0..10) {
                    0..=3 => {
                        let obj = m.alloc_object(node2()).unwrap();
                        if rooted.is_empty() || rng.gen_bool(0.5) {
                            m.add_root(obj);
                            rooted.push(obj);
                        } else {
                            // hang the fresh object off a live one
                            let parent = rooted[rng.gen_range(0..rooted.len())];
                            m.write_ref(parent, F0, Some(obj));
                        }
                    }
                    4..=6 => {
                        if !rooted.is_empty() {
                            let from = rooted[rng.gen_range(0..rooted.len())];
                            let to = rooted[rng.gen_range(0..rooted.len())];
                            let offset = if rng.gen_bool(0.5) { F0 } else { F1 };
                            let value = if rng.gen_bool(0.8) { Some(to) } else { None };
                            m.write_ref(from, offset, value);
                        }
                    }
                    7..=8 => {
                        if rooted.len() > 1 {
                            let victim = rooted.swap_remove(rng.gen_range(0..rooted.len()));
                            m.remove_root(victim);
                        }
                    }
                    _ => {
                        if step % 50 == worker as usize {
                            m.gc_wake();
                        }
                        m.safepoint();
                    }
                }
            }
            for obj in rooted {
                m.remove_root(obj);
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    let m = rt.attach_current_thread();
    m.gc_wait();
    m.gc_wait();
    m.gc_wait();
    assert_eq!(rt.live_objects(), 0);

    let mut live = 0;
    rt.heap().iterate_objects(|cell| {
        if !unsafe { (*cell).is_free() } {
            live += 1;
        }
    });
    assert_eq!(live, 0);

    rt.shutdown();
}

// Several synchronous waiters collapse onto one cycle and all return.
#[test]
fn concurrent_waiters_all_return() {
    let rt = test_runtime();

    let mut waiters = Vec::new();
    for _ in 0..4 {
        let rt = rt.clone();
        waiters.push(std::thread::spawn(move || {
            let m = rt.attach_current_thread();
            for _ in 0..10 {
                let obj = m.alloc_object(node1()).unwrap();
                m.add_root(obj);
                m.gc_wait();
                assert_ne!(obj.header().color(), COLOR_BLUE);
                m.remove_root(obj);
            }
        }));
    }
    for waiter in waiters {
        waiter.join().unwrap();
    }

    rt.shutdown();
}
