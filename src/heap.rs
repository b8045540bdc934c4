//! The size-segregated object heap.
//!
//! The managed range is carved into [`POOL_COUNT`] top-level pools, one per
//! size class, so the cell size of any address is a pure function of its
//! high bits; sweep, find and iterate never store size metadata. Each pool
//! is split into 1GB sub-pools, and sub-pools are grouped into bands of
//! `subpools / cpu_count` so one spinlock never serialises two cores that
//! could have allocated independently.
//!
//! Cells of 2MB and up are backed by one huge page each; cells between 4KB
//! and 2MB get one 4KB page each; smaller cells share pages. Page-table
//! levels are materialised lazily and charged against the physical budget,
//! and a partially mapped cell is always rolled back before the scan moves
//! on.

use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use spin::Mutex as SpinMutex;

use crate::globals::*;
use crate::header::{ObjectHeader, COLOR_BLUE, HEADER_SIZE};
use crate::mmap::Mmap;
use crate::pages::{EntryCell, Level1, Level2, PageBudget, PageLevel};
use crate::runtime::GcError;

/// Geometry and resource limits of the heap.
#[derive(Clone, Copy, Debug)]
pub struct HeapConfig {
    /// Sub-pools (1GB slices) per size-class pool. Must be a power of two.
    /// The production layout is 512 (26 pools of 512GB); tests scale this
    /// down to shrink the reservation without touching page sizes, level
    /// fan-out or band math.
    pub subpools_per_pool: usize,
    /// Bytes of physical memory the heap may commit, page tables included.
    pub physical_budget: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            subpools_per_pool: MAX_SUBPOOLS,
            physical_budget: usize::MAX / 2,
        }
    }
}

struct SubPool {
    table: AtomicPtr<Level2>,
}

struct Pool {
    base: usize,
    cell: usize,
    subpools: Box<[SubPool]>,
    bands: Box<[CachePadded<SpinMutex<()>>]>,
    subpools_per_band: usize,
}

impl Pool {
    #[inline]
    fn table(&self, sub: usize) -> Option<&Level2> {
        let ptr = self.subpools[sub].table.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }

    fn band_range(&self, band: usize, subpool_count: usize) -> core::ops::Range<usize> {
        let lo = band * self.subpools_per_band;
        let hi = (lo + self.subpools_per_band).min(subpool_count);
        lo..hi
    }
}

pub struct Heap {
    map: Mmap,
    budget: PageBudget,
    base: usize,
    end: usize,
    pool_shift: u32,
    subpool_count: usize,
    pools: Vec<Pool>,
    cells_allocated: AtomicUsize,
    cells_freed: AtomicUsize,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HeapStats {
    pub cells_allocated: usize,
    pub cells_freed: usize,
    pub physical_used: usize,
}

impl Heap {
    pub fn new(config: HeapConfig) -> Result<Self, GcError> {
        assert!(
            config.subpools_per_pool.is_power_of_two()
                && config.subpools_per_pool <= MAX_SUBPOOLS,
            "sub-pool count must be a power of two up to {}",
            MAX_SUBPOOLS
        );
        let pool_span = config.subpools_per_pool * SUBPOOL_SPAN;
        // One extra sub-pool span of slack so the base can be aligned to the
        // largest cell size.
        let map = Mmap::reserve(POOL_COUNT * pool_span + SUBPOOL_SPAN).ok_or(GcError::Reserve)?;
        let base = map.aligned(SUBPOOL_SPAN) as usize;

        let cpus = num_cpus::get().clamp(1, config.subpools_per_pool);
        let subpools_per_band = (config.subpools_per_pool / cpus).max(1);
        let band_count = (config.subpools_per_pool + subpools_per_band - 1) / subpools_per_band;

        let pools = (0..POOL_COUNT)
            .map(|idx| Pool {
                base: base + idx * pool_span,
                cell: cell_size(idx),
                subpools: (0..config.subpools_per_pool)
                    .map(|_| SubPool {
                        table: AtomicPtr::new(null_mut()),
                    })
                    .collect(),
                bands: (0..band_count)
                    .map(|_| CachePadded::new(SpinMutex::new(())))
                    .collect(),
                subpools_per_band,
            })
            .collect();

        log::debug!(
            "heap: reserved {} pools of {}GB at {:#x}, {} bands per pool",
            POOL_COUNT,
            pool_span / GB,
            base,
            band_count
        );

        Ok(Self {
            map,
            budget: PageBudget::new(config.physical_budget),
            base,
            end: base + POOL_COUNT * pool_span,
            pool_shift: pool_span.trailing_zeros(),
            subpool_count: config.subpools_per_pool,
            pools,
            cells_allocated: AtomicUsize::new(0),
            cells_freed: AtomicUsize::new(0),
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end
    }

    /// Cell size of the pool that owns `addr`, straight from the high bits.
    #[inline(always)]
    pub fn cell_size_of(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr));
        cell_size((addr - self.base) >> self.pool_shift)
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            cells_allocated: self.cells_allocated.load(Ordering::Relaxed),
            cells_freed: self.cells_freed.load(Ordering::Relaxed),
            physical_used: self.budget.used(),
        }
    }

    /// Find a free cell in the size class for `request` and claim it,
    /// painted `paint`, with the payload zeroed up to `request` bytes.
    ///
    /// Contended bands are skipped outright: the pool has as many bands as
    /// cores, so a caller that loses every band races allocators that will
    /// free up a band before it returns empty-handed. Returns None when the
    /// pool is exhausted or physical memory ran out.
    pub fn alloc(&self, request: usize, paint: u8) -> Option<NonNull<ObjectHeader>> {
        if request > MAX_ALLOC {
            return None;
        }
        debug_assert!(paint != COLOR_BLUE, "allocation painted as a free cell");
        let pool = &self.pools[pool_index(request)];
        for band in 0..pool.bands.len() {
            let guard = match pool.bands[band].try_lock() {
                Some(guard) => guard,
                None => continue,
            };
            let mut found = None;
            for sub in pool.band_range(band, self.subpool_count) {
                found = self.alloc_in_subpool(pool, sub, request, paint);
                if found.is_some() {
                    break;
                }
            }
            drop(guard);
            if found.is_some() {
                return found;
            }
        }
        None
    }

    fn alloc_in_subpool(
        &self,
        pool: &Pool,
        sub: usize,
        request: usize,
        paint: u8,
    ) -> Option<NonNull<ObjectHeader>> {
        let table = self.ensure_table(pool, sub)?;
        let sub_base = pool.base + sub * SUBPOOL_SPAN;
        if pool.cell >= HUGE_PAGE_SIZE {
            self.alloc_huge(table, sub_base, pool.cell, request, paint)
        } else if pool.cell >= PAGE_SIZE {
            self.alloc_paged(table, sub_base, pool.cell, request, paint)
        } else {
            self.alloc_packed(table, sub_base, pool.cell, request, paint)
        }
    }

    /// Cells of one or more huge pages: presence is tracked per 2MB entry
    /// and the whole cell is mapped (or rolled back) in one go.
    fn alloc_huge(
        &self,
        table: &Level2,
        sub_base: usize,
        cell: usize,
        request: usize,
        paint: u8,
    ) -> Option<NonNull<ObjectHeader>> {
        let entries_per_cell = cell / HUGE_PAGE_SIZE;
        let mut ptr = sub_base;
        while ptr + cell <= sub_base + SUBPOOL_SPAN {
            let idx = (ptr - sub_base) / HUGE_PAGE_SIZE;
            if !table.entries[idx].is_present()
                && !self.map_cell(ptr, HUGE_PAGE_SIZE, entries_per_cell, |i, ok| {
                    if ok {
                        table.entries[idx + i].set_present(true);
                    } else {
                        table.entries[idx + i].clear();
                    }
                })
            {
                ptr += cell;
                continue;
            }
            let obj = ptr as *mut ObjectHeader;
            if unsafe { (*obj).is_free() } {
                unsafe { self.claim(obj, paint, request) };
                return NonNull::new(obj);
            }
            ptr += cell;
        }
        None
    }

    /// Cells between one page and one huge page: one 4KB page per
    /// `cell / 4KB` slice, presence tracked at the innermost level.
    fn alloc_paged(
        &self,
        table: &Level2,
        sub_base: usize,
        cell: usize,
        request: usize,
        paint: u8,
    ) -> Option<NonNull<ObjectHeader>> {
        let pages_per_cell = cell / PAGE_SIZE;
        for l2 in 0..LEVEL_FANOUT {
            let leaf = match self.ensure_leaf(table, l2) {
                Some(leaf) => leaf,
                None => continue,
            };
            let chunk_base = sub_base + l2 * HUGE_PAGE_SIZE;
            let mut ptr = chunk_base;
            while ptr + cell <= chunk_base + HUGE_PAGE_SIZE {
                let idx = (ptr - chunk_base) / PAGE_SIZE;
                if !leaf.entries[idx].is_present()
                    && !self.map_cell(ptr, PAGE_SIZE, pages_per_cell, |i, ok| {
                        if ok {
                            leaf.entries[idx + i].set_present(false);
                        } else {
                            leaf.entries[idx + i].clear();
                        }
                    })
                {
                    ptr += cell;
                    continue;
                }
                let obj = ptr as *mut ObjectHeader;
                if unsafe { (*obj).is_free() } {
                    unsafe { self.claim(obj, paint, request) };
                    return NonNull::new(obj);
                }
                ptr += cell;
            }
        }
        None
    }

    /// Sub-page cells: several cells share each 4KB page.
    fn alloc_packed(
        &self,
        table: &Level2,
        sub_base: usize,
        cell: usize,
        request: usize,
        paint: u8,
    ) -> Option<NonNull<ObjectHeader>> {
        for l2 in 0..LEVEL_FANOUT {
            let leaf = match self.ensure_leaf(table, l2) {
                Some(leaf) => leaf,
                None => continue,
            };
            let chunk_base = sub_base + l2 * HUGE_PAGE_SIZE;
            for page in 0..LEVEL_FANOUT {
                let page_base = chunk_base + page * PAGE_SIZE;
                if !leaf.entries[page].is_present() {
                    if !self.map_cell(page_base, PAGE_SIZE, 1, |_, ok| {
                        if ok {
                            leaf.entries[page].set_present(false);
                        } else {
                            leaf.entries[page].clear();
                        }
                    }) {
                        continue;
                    }
                }
                let mut ptr = page_base;
                while ptr + cell <= page_base + PAGE_SIZE {
                    let obj = ptr as *mut ObjectHeader;
                    if unsafe { (*obj).is_free() } {
                        unsafe { self.claim(obj, paint, request) };
                        return NonNull::new(obj);
                    }
                    ptr += cell;
                }
            }
        }
        None
    }

    /// Commit `count` pages of `page_size` starting at `base`, charging the
    /// physical budget. On failure every page acquired by this call is
    /// decommitted and refunded before reporting, so an out-of-memory cell
    /// never leaves half-mapped state behind.
    fn map_cell(
        &self,
        base: usize,
        page_size: usize,
        count: usize,
        mut entry: impl FnMut(usize, bool),
    ) -> bool {
        for i in 0..count {
            let page = (base + i * page_size) as *mut u8;
            let charged = self.budget.take(page_size);
            if !charged || !self.map.commit(page, page_size) {
                if charged {
                    self.budget.give(page_size);
                }
                log::warn!(
                    "heap: out of memory mapping {} pages of {}B at {:#x}",
                    count,
                    page_size,
                    base
                );
                for j in 0..i {
                    self.map.decommit((base + j * page_size) as *mut u8, page_size);
                    self.budget.give(page_size);
                    entry(j, false);
                }
                return false;
            }
            entry(i, true);
        }
        true
    }

    fn ensure_table<'a>(&self, pool: &'a Pool, sub: usize) -> Option<&'a Level2> {
        if let Some(table) = pool.table(sub) {
            return Some(table);
        }
        if !self.budget.take(PAGE_SIZE) {
            log::warn!(
                "heap: out of memory setting up sub-pool {} of the {}B pool",
                sub,
                pool.cell
            );
            return None;
        }
        let table = Box::into_raw(Level2::new_boxed());
        pool.subpools[sub].table.store(table, Ordering::Release);
        Some(unsafe { &*table })
    }

    fn ensure_leaf<'a>(&self, table: &'a Level2, idx: usize) -> Option<&'a Level1> {
        if let Some(leaf) = table.child(idx) {
            return Some(leaf);
        }
        if !self.budget.take(PAGE_SIZE) {
            log::warn!("heap: out of memory setting up an inner page table");
            return None;
        }
        let leaf = Box::into_raw(Level1::new_boxed());
        table.children[idx].store(leaf, Ordering::Release);
        table.entries[idx].set_present(false);
        Some(unsafe { &*leaf })
    }

    unsafe fn claim(&self, obj: *mut ObjectHeader, paint: u8, request: usize) {
        let header = &*obj;
        debug_assert!(header.is_free(), "allocator claimed a live cell");
        header.reset_for_alloc();
        header.set_color(paint);
        let payload = request.max(HEADER_SIZE) - HEADER_SIZE;
        core::ptr::write_bytes(header.payload(), 0, payload);
        self.mark_dirty(obj as usize);
        self.cells_allocated.fetch_add(1, Ordering::Relaxed);
    }

    /// Repaint a cell free. The physical pages stay mapped for reuse by
    /// later allocations in the same size class.
    pub unsafe fn free(&self, obj: *mut ObjectHeader) {
        debug_assert!(!(*obj).is_free(), "double free of {:p}", obj);
        (*obj).set_color(COLOR_BLUE);
        self.cells_freed.fetch_add(1, Ordering::Relaxed);
    }

    /// Conservative pointer test: if `ptr` falls inside a mapped cell,
    /// return the cell base, deriving the cell size from the address alone.
    pub fn find(&self, ptr: usize) -> Option<NonNull<ObjectHeader>> {
        if !self.contains(ptr) {
            return None;
        }
        let pool = &self.pools[(ptr - self.base) >> self.pool_shift];
        let table = pool.table((ptr - pool.base) / SUBPOOL_SPAN)?;
        let l2 = ptr % SUBPOOL_SPAN / HUGE_PAGE_SIZE;
        if !table.entries[l2].is_present() {
            return None;
        }
        if pool.cell < HUGE_PAGE_SIZE {
            let leaf = table.child(l2)?;
            if !leaf.entries[ptr % HUGE_PAGE_SIZE / PAGE_SIZE].is_present() {
                return None;
            }
        }
        NonNull::new(align_down(ptr, pool.cell) as *mut ObjectHeader)
    }

    /// Is the page-table entry covering `addr` present at `level`?
    pub fn is_present(&self, addr: usize, level: PageLevel) -> bool {
        if !self.contains(addr) {
            return false;
        }
        if level == PageLevel::SubPool {
            let pool = &self.pools[(addr - self.base) >> self.pool_shift];
            return pool.table((addr - pool.base) / SUBPOOL_SPAN).is_some();
        }
        self.entry_view(addr, level, |entry| entry.is_present())
            .unwrap_or(false)
    }

    pub fn page_dirty(&self, addr: usize, level: PageLevel) -> bool {
        self.entry_view(addr, level, |entry| entry.is_dirty())
            .unwrap_or(false)
    }

    pub fn clear_page_dirty(&self, addr: usize, level: PageLevel) {
        self.entry_view(addr, level, |entry| entry.clear_dirty());
    }

    /// Resolve the entry covering `addr` at `level`. Sub-pool presence has
    /// no entry byte (it is the table itself), so only the two page levels
    /// resolve here.
    fn entry_view<R>(
        &self,
        addr: usize,
        level: PageLevel,
        f: impl FnOnce(&EntryCell) -> R,
    ) -> Option<R> {
        if !self.contains(addr) {
            return None;
        }
        let pool = &self.pools[(addr - self.base) >> self.pool_shift];
        let table = pool.table((addr - pool.base) / SUBPOOL_SPAN);
        match level {
            PageLevel::SubPool => None,
            PageLevel::Huge => table.map(|t| f(&t.entries[addr % SUBPOOL_SPAN / HUGE_PAGE_SIZE])),
            PageLevel::Small => table
                .and_then(|t| t.child(addr % SUBPOOL_SPAN / HUGE_PAGE_SIZE))
                .map(|leaf| f(&leaf.entries[addr % HUGE_PAGE_SIZE / PAGE_SIZE])),
        }
    }

    /// Set the innermost dirty bit covering `addr`. This is the write
    /// barrier's card mark; hardware would do it for free.
    #[inline]
    pub fn mark_dirty(&self, addr: usize) {
        debug_assert!(self.contains(addr));
        let pool = &self.pools[(addr - self.base) >> self.pool_shift];
        let table = match pool.table((addr - pool.base) / SUBPOOL_SPAN) {
            Some(table) => table,
            None => return,
        };
        let l2 = addr % SUBPOOL_SPAN / HUGE_PAGE_SIZE;
        if pool.cell >= HUGE_PAGE_SIZE {
            table.entries[l2].set_dirty();
        } else if let Some(leaf) = table.child(l2) {
            leaf.entries[addr % HUGE_PAGE_SIZE / PAGE_SIZE].set_dirty();
        }
    }

    /// Walk every mapped cell in address order. The callback sees free and
    /// live cells alike and can read the header color.
    pub fn iterate_objects(&self, mut callback: impl FnMut(*mut ObjectHeader)) {
        for pool in &self.pools {
            self.iterate_pool(pool, &mut callback);
        }
    }

    fn iterate_pool(&self, pool: &Pool, callback: &mut impl FnMut(*mut ObjectHeader)) {
        for band in 0..pool.bands.len() {
            let _guard = pool.bands[band].lock();
            for sub in pool.band_range(band, self.subpool_count) {
                let table = match pool.table(sub) {
                    Some(table) => table,
                    None => continue,
                };
                let sub_base = pool.base + sub * SUBPOOL_SPAN;
                if pool.cell >= HUGE_PAGE_SIZE {
                    let mut ptr = sub_base;
                    while ptr + pool.cell <= sub_base + SUBPOOL_SPAN {
                        if table.entries[(ptr - sub_base) / HUGE_PAGE_SIZE].is_present() {
                            callback(ptr as *mut ObjectHeader);
                        }
                        ptr += pool.cell;
                    }
                } else {
                    for l2 in 0..LEVEL_FANOUT {
                        let leaf = match table.child(l2) {
                            Some(leaf) => leaf,
                            None => continue,
                        };
                        let chunk_base = sub_base + l2 * HUGE_PAGE_SIZE;
                        if pool.cell >= PAGE_SIZE {
                            let mut ptr = chunk_base;
                            while ptr + pool.cell <= chunk_base + HUGE_PAGE_SIZE {
                                if leaf.entries[(ptr - chunk_base) / PAGE_SIZE].is_present() {
                                    callback(ptr as *mut ObjectHeader);
                                }
                                ptr += pool.cell;
                            }
                        } else {
                            for page in 0..LEVEL_FANOUT {
                                if !leaf.entries[page].is_present() {
                                    continue;
                                }
                                let page_base = chunk_base + page * PAGE_SIZE;
                                let mut ptr = page_base;
                                while ptr + pool.cell <= page_base + PAGE_SIZE {
                                    callback(ptr as *mut ObjectHeader);
                                    ptr += pool.cell;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Walk mapped cells whose innermost page-table entry is dirty, clearing
    /// each dirty bit after its cells have been visited. Card-marking
    /// substrate for incremental collection; the cycle itself does not
    /// depend on it.
    pub fn iterate_dirty_objects(&self, mut callback: impl FnMut(*mut ObjectHeader)) {
        for pool in &self.pools {
            self.iterate_dirty_pool(pool, &mut callback);
        }
    }

    fn iterate_dirty_pool(&self, pool: &Pool, callback: &mut impl FnMut(*mut ObjectHeader)) {
        for band in 0..pool.bands.len() {
            let _guard = pool.bands[band].lock();
            for sub in pool.band_range(band, self.subpool_count) {
                let table = match pool.table(sub) {
                    Some(table) => table,
                    None => continue,
                };
                let sub_base = pool.base + sub * SUBPOOL_SPAN;
                if pool.cell >= HUGE_PAGE_SIZE {
                    for idx in 0..LEVEL_FANOUT {
                        let entry = &table.entries[idx];
                        if !entry.is_present() || !entry.is_dirty() {
                            continue;
                        }
                        let granule = sub_base + idx * HUGE_PAGE_SIZE;
                        let mut ptr = align_down(granule, pool.cell);
                        while ptr < granule + HUGE_PAGE_SIZE {
                            callback(ptr as *mut ObjectHeader);
                            ptr += pool.cell;
                        }
                        // cleared only after every covered cell was visited
                        entry.clear_dirty();
                    }
                } else {
                    for l2 in 0..LEVEL_FANOUT {
                        let leaf = match table.child(l2) {
                            Some(leaf) => leaf,
                            None => continue,
                        };
                        let chunk_base = sub_base + l2 * HUGE_PAGE_SIZE;
                        for page in 0..LEVEL_FANOUT {
                            let entry = &leaf.entries[page];
                            if !entry.is_present() || !entry.is_dirty() {
                                continue;
                            }
                            let granule = chunk_base + page * PAGE_SIZE;
                            let mut ptr = align_down(granule, pool.cell);
                            while ptr < granule + PAGE_SIZE {
                                callback(ptr as *mut ObjectHeader);
                                ptr += pool.cell;
                            }
                            entry.clear_dirty();
                        }
                    }
                }
            }
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for pool in &self.pools {
            for sub in pool.subpools.iter() {
                let table = sub.table.swap(null_mut(), Ordering::AcqRel);
                if !table.is_null() {
                    unsafe { drop(Box::from_raw(table)) };
                }
            }
        }
    }
}
