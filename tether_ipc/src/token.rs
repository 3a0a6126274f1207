//! Opaque buffer tokens.
//!
//! What the external process gets instead of raw addresses: a token names a
//! buffer, carries its placement and precision, and is tied to the
//! reallocation generation it was minted under. A token outlives its
//! generation only as a way to fail loudly — resolving it after a remap is a
//! stale-token error, never a dangling read.

use tether_core::Precision;

use crate::layout::BufferKind;

/// Opaque handle to one named buffer within a channel mapping.
///
/// Valid until the next reallocation or teardown. In output mode the forces
/// token points at the position-echo sub-region rather than the payload
/// start, since positions are appended after the force payload there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferToken {
    kind: BufferKind,
    offset: usize,
    records: usize,
    precision: Precision,
    generation: u64,
}

impl BufferToken {
    pub(crate) fn new(
        kind: BufferKind,
        offset: usize,
        records: usize,
        precision: Precision,
        generation: u64,
    ) -> Self {
        Self {
            kind,
            offset,
            records,
            precision,
            generation,
        }
    }

    /// Buffer this token resolves to.
    #[inline]
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Byte offset from the start of the mapping.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Capacity in 4-wide records.
    #[inline]
    pub fn records(&self) -> usize {
        self.records
    }

    /// Element precision the region was laid out under.
    #[inline]
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Reallocation generation the token was minted under.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}
