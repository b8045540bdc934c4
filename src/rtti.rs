//! Type descriptors for managed objects.
//!
//! The metadata loader owns these; the collector only ever needs the
//! allocated size and the offsets of reference-typed fields.

use crate::header::HEADER_SIZE;

/// Immutable description of a managed type. `size` covers the whole cell
/// payload including the object header; `reference_offsets` are byte offsets
/// from the object base, ascending, each naming a word-sized managed
/// reference field.
#[derive(Debug)]
pub struct TypeDescriptor {
    pub size: usize,
    pub reference_offsets: &'static [usize],
    pub name: &'static str,
}

impl TypeDescriptor {
    /// Sanity-check the descriptor shape. Violations are loader bugs.
    pub fn validate(&self) {
        debug_assert!(self.size >= HEADER_SIZE, "{}: size below header", self.name);
        let mut prev = 0;
        for &offset in self.reference_offsets {
            debug_assert!(offset >= HEADER_SIZE, "{}: offset inside header", self.name);
            debug_assert!(offset % 8 == 0, "{}: unaligned reference field", self.name);
            debug_assert!(offset + 8 <= self.size, "{}: offset past object end", self.name);
            debug_assert!(offset >= prev, "{}: offsets not ascending", self.name);
            prev = offset;
        }
    }
}
