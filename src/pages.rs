//! Software page tables over the managed reservation.
//!
//! The heap mirrors a three-level hardware walk: one [`Level2`] table per
//! sub-pool (1GB, entries of 2MB), with a lazily attached [`Level1`] table
//! (entries of 4KB) under every 2MB entry that backs cells smaller than a
//! huge page. Entries are a single byte so presence and dirty queries are
//! one atomic load.

use std::mem::MaybeUninit;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use modular_bitfield::prelude::*;

use crate::globals::LEVEL_FANOUT;

#[bitfield(bits = 8)]
#[derive(Clone, Copy, Debug)]
pub struct PageEntry {
    pub present: bool,
    pub huge: bool,
    pub dirty: bool,
    #[skip]
    __: B5,
}

// Raw masks matching the bitfield encoding above; checked by a test so the
// lock-free fetch_or/fetch_and paths cannot drift from the decoder.
pub const ENTRY_PRESENT: u8 = 0b001;
pub const ENTRY_HUGE: u8 = 0b010;
pub const ENTRY_DIRTY: u8 = 0b100;

/// One page-table entry, readable without any lock.
#[repr(transparent)]
pub struct EntryCell(AtomicU8);

impl EntryCell {
    #[inline(always)]
    pub fn get(&self) -> PageEntry {
        PageEntry::from_bytes([self.0.load(Ordering::Acquire)])
    }

    #[inline(always)]
    pub fn is_present(&self) -> bool {
        self.0.load(Ordering::Acquire) & ENTRY_PRESENT != 0
    }

    #[inline(always)]
    pub fn is_dirty(&self) -> bool {
        self.0.load(Ordering::Acquire) & ENTRY_DIRTY != 0
    }

    pub fn set_present(&self, huge: bool) {
        let bits = ENTRY_PRESENT | if huge { ENTRY_HUGE } else { 0 };
        self.0.fetch_or(bits, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }

    #[inline(always)]
    pub fn set_dirty(&self) {
        self.0.fetch_or(ENTRY_DIRTY, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.0.fetch_and(!ENTRY_DIRTY, Ordering::Release);
    }
}

/// Innermost level: 512 entries of 4KB covering one 2MB range.
pub struct Level1 {
    pub entries: [EntryCell; LEVEL_FANOUT],
}

/// Middle level: 512 entries of 2MB covering one sub-pool, each entry
/// optionally carrying a [`Level1`] table when the pool's cells are smaller
/// than a huge page.
pub struct Level2 {
    pub entries: [EntryCell; LEVEL_FANOUT],
    pub children: [AtomicPtr<Level1>; LEVEL_FANOUT],
}

impl Level1 {
    pub fn new_boxed() -> Box<Self> {
        // All-zero bytes are valid for both arrays: absent entries.
        unsafe { Box::new(MaybeUninit::zeroed().assume_init()) }
    }
}

impl Level2 {
    pub fn new_boxed() -> Box<Self> {
        unsafe { Box::new(MaybeUninit::zeroed().assume_init()) }
    }

    #[inline]
    pub fn child(&self, idx: usize) -> Option<&Level1> {
        let ptr = self.children[idx].load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }
}

impl Drop for Level2 {
    fn drop(&mut self) {
        for child in self.children.iter() {
            let ptr = child.swap(null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                unsafe { drop(Box::from_raw(ptr)) };
            }
        }
    }
}

/// Page-table levels addressable from the query surface.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageLevel {
    /// 4KB granularity (innermost entries).
    Small,
    /// 2MB granularity.
    Huge,
    /// 1GB granularity (a sub-pool's table).
    SubPool,
}

/// The physical page source, modelled as a byte budget. Taking from the
/// budget stands in for pulling pages out of the physical allocator;
/// exhaustion is how out-of-physical-memory is injected and observed.
pub struct PageBudget {
    remaining: AtomicUsize,
    total: usize,
}

impl PageBudget {
    pub fn new(total: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(total),
            total,
        }
    }

    /// Try to take `len` bytes out of the budget.
    pub fn take(&self, len: usize) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_sub(len)
            })
            .is_ok()
    }

    pub fn give(&self, len: usize) {
        self.remaining.fetch_add(len, Ordering::AcqRel);
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn used(&self) -> usize {
        self.total - self.remaining()
    }
}
