//! Force-mode policy.
//!
//! Governs how the force buffer written by the external engine combines with
//! the force array the simulation already holds. Each variant carries its own
//! combine rule so the policy lives in one place instead of being branched on
//! inside the send/receive sequence.

use crate::types::{Element, Quad};

/// Policy for combining externally computed forces with the simulation's own
/// force accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForceMode {
    /// Replace the simulation's force array with the received buffer.
    Overwrite,
    /// Sum the received buffer into the simulation's existing force array,
    /// preserving contributions from other force computations.
    Add,
    /// Discard received forces; only positions and virial are taken from the
    /// exchange (the external engine is an observer).
    Ignore,
    /// Like [`ForceMode::Overwrite`], and additionally read back a position
    /// array the external engine may have written.
    Output,
}

impl ForceMode {
    /// Apply this mode's combine rule to the simulation's force array.
    ///
    /// `existing` and `received` must have equal lengths; callers shape-check
    /// against the channel layout before reaching this point.
    pub fn combine<T: Element>(&self, existing: &mut [Quad<T>], received: &[Quad<T>]) {
        debug_assert_eq!(existing.len(), received.len());
        match self {
            ForceMode::Overwrite | ForceMode::Output => existing.copy_from_slice(received),
            ForceMode::Add => {
                for (f, r) in existing.iter_mut().zip(received) {
                    *f += *r;
                }
            }
            ForceMode::Ignore => {}
        }
    }

    /// Whether the work region reserves the position-echo sub-region.
    #[inline]
    pub const fn reserves_echo(&self) -> bool {
        matches!(self, ForceMode::Output)
    }

    /// Whether the force payload carries per-neighbor terms
    /// (`n * (1 + nneighs)` records instead of `n`).
    #[inline]
    pub const fn multi_body(&self) -> bool {
        matches!(self, ForceMode::Output)
    }

    /// Wire tag stored in the mapped channel header.
    #[inline]
    pub const fn tag(&self) -> u32 {
        match self {
            ForceMode::Overwrite => 0,
            ForceMode::Add => 1,
            ForceMode::Ignore => 2,
            ForceMode::Output => 3,
        }
    }

    /// Recover a mode from its wire tag, if valid.
    #[inline]
    pub const fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(ForceMode::Overwrite),
            1 => Some(ForceMode::Add),
            2 => Some(ForceMode::Ignore),
            3 => Some(ForceMode::Output),
            _ => None,
        }
    }
}
