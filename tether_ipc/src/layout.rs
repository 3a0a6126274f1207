//! Exchange layout computation.
//!
//! Buffer placement is a pure function of `(n, nneighs, precision, mode)`.
//! Element counts follow the wire contract:
//!
//! - positions: `n` records, at the start of the state region
//! - virial: `n` records, one particle's worth of space after the positions
//!   base (it shares the state region's allocation)
//! - forces: `n` records, at the start of the work region; in output mode the
//!   engine-facing payload spans `n·(1+nneighs)` records (the per-neighbor
//!   slots double as force-term slots after the neighbor send), and the extra
//!   `n` records at record offset `n·(1+nneighs)` are the position-echo
//!   sub-region
//! - neighbors: `n·nneighs` records, particle-major, at record offset `n`
//!   within the work region
//!
//! All offsets are in bytes from the start of the one backing mapping, whose
//! head is the [`SyncBlock`]. Any change to `n` produces a new layout and a
//! full reallocation; computing the same inputs twice yields identical
//! placement (no size drift).

use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64};

use tether_core::{ForceMode, Precision};

use crate::error::{ChannelError, Result};

/// Magic number identifying an exchange mapping.
pub const EXCHANGE_MAGIC: u32 = 0x54455448; // "TETH"

/// Size of the sync block at the head of the mapping.
pub const SYNC_BLOCK_SIZE: usize = 128;

/// Number of named buffers carrying a publish sequence.
pub const BUFFER_COUNT: usize = 4;

/// One of the four named buffers a channel exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Particle position snapshot (simulation → engine).
    Positions,
    /// Neighbor-list snapshot (simulation → engine).
    Neighbors,
    /// Force buffer (engine → simulation).
    Forces,
    /// Per-particle virial buffer (engine → simulation).
    Virial,
}

impl BufferKind {
    /// All buffer kinds, in sequence-slot order.
    pub const ALL: [BufferKind; BUFFER_COUNT] = [
        BufferKind::Positions,
        BufferKind::Neighbors,
        BufferKind::Forces,
        BufferKind::Virial,
    ];

    /// Slot of this buffer's publish sequence in the sync block.
    #[inline]
    pub const fn index(&self) -> usize {
        match self {
            BufferKind::Positions => 0,
            BufferKind::Neighbors => 1,
            BufferKind::Forces => 2,
            BufferKind::Virial => 3,
        }
    }
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferKind::Positions => write!(f, "positions"),
            BufferKind::Neighbors => write!(f, "neighbors"),
            BufferKind::Forces => write!(f, "forces"),
            BufferKind::Virial => write!(f, "virial"),
        }
    }
}

/// Sync block at the head of the mapping.
///
/// Cache-line aligned; the atomics here are the channel's only
/// synchronization object. Writable fields are rewritten only during
/// reallocation, which never runs while data is in flight.
#[repr(C, align(64))]
pub struct SyncBlock {
    /// Magic number for validation.
    pub magic: u32,
    /// Element width in bytes (4 or 8), fixing the channel's precision.
    pub element_width: u32,
    /// Per-particle neighbor capacity.
    pub neighbor_capacity: u32,
    /// Force-mode wire tag.
    pub mode_tag: u32,
    /// Particle count the active layout was computed for.
    pub particle_count: u64,
    /// Reallocation generation; bumped by every remap.
    pub generation: AtomicU64,
    /// Nonzero once either side has torn down.
    pub closed: AtomicU32,
    _pad0: u32,
    /// Publish sequence per named buffer (odd = write in progress).
    pub seqs: [AtomicU64; BUFFER_COUNT],
    _pad1: [u8; 56],
}

impl SyncBlock {
    /// Create a fresh block for the given configuration.
    pub fn new(
        particle_count: usize,
        neighbor_capacity: usize,
        precision: Precision,
        mode: ForceMode,
        generation: u64,
    ) -> Self {
        Self {
            magic: EXCHANGE_MAGIC,
            element_width: precision.width() as u32,
            neighbor_capacity: neighbor_capacity as u32,
            mode_tag: mode.tag(),
            particle_count: particle_count as u64,
            generation: AtomicU64::new(generation),
            closed: AtomicU32::new(0),
            _pad0: 0,
            seqs: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
            _pad1: [0; 56],
        }
    }

    /// Validate the header against the caller's expected precision.
    ///
    /// Returns the channel's force mode on success.
    pub fn validate(&self, expected: Precision) -> Result<ForceMode> {
        if self.magic != EXCHANGE_MAGIC {
            return Err(ChannelError::InvalidHeader {
                message: "bad magic",
            });
        }
        let found = Precision::from_width(self.element_width as usize).ok_or(
            ChannelError::InvalidHeader {
                message: "unrecognized element width",
            },
        )?;
        if found != expected {
            return Err(ChannelError::PrecisionMismatch { expected, found });
        }
        ForceMode::from_tag(self.mode_tag).ok_or(ChannelError::InvalidHeader {
            message: "unrecognized force-mode tag",
        })
    }
}

/// Placement of one named buffer inside the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Byte offset from the start of the mapping.
    pub offset: usize,
    /// Capacity in 4-wide records.
    pub records: usize,
}

/// Buffer placement for one `(n, nneighs, precision, mode)` configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeLayout {
    /// Particle count this layout was computed for.
    pub particle_count: usize,
    /// Per-particle neighbor capacity.
    pub neighbor_capacity: usize,
    /// Element precision.
    pub precision: Precision,
    /// Force mode.
    pub mode: ForceMode,
    /// Position snapshot span.
    pub positions: Span,
    /// Virial span, immediately after the positions records.
    pub virial: Span,
    /// Engine-facing force payload span. `n` records, or `n·(1+nneighs)` in
    /// output mode where it subsumes the neighbor slots; the leading `n`
    /// records are always the per-particle totals.
    pub forces: Span,
    /// Neighbor-list span, particle-major, at record offset `n` within the
    /// work region.
    pub neighbors: Span,
    /// Position-echo sub-region, reserved in output mode only.
    pub echo: Option<Span>,
    /// Total mapping size in bytes, sync block included.
    pub total_size: usize,
}

#[inline]
const fn align64(x: usize) -> usize {
    (x + 63) & !63
}

fn overflow() -> ChannelError {
    ChannelError::AllocationFailure {
        message: "layout size overflow".into(),
    }
}

impl ExchangeLayout {
    /// Compute the layout for a configuration.
    ///
    /// Total for all `n ≥ 0`, `nneighs ≥ 0`; arithmetic overflow is an
    /// allocation error, never a wrap.
    pub fn compute(
        n: usize,
        nneighs: usize,
        precision: Precision,
        mode: ForceMode,
    ) -> Result<Self> {
        let record = precision.record_width();
        let n_bytes = n.checked_mul(record).ok_or_else(overflow)?;

        let state_offset = SYNC_BLOCK_SIZE;
        let positions = Span {
            offset: state_offset,
            records: n,
        };
        let virial = Span {
            offset: state_offset.checked_add(n_bytes).ok_or_else(overflow)?,
            records: n,
        };
        let state_end = virial.offset.checked_add(n_bytes).ok_or_else(overflow)?;
        let work_offset = align64(state_end);

        let slots = nneighs.checked_add(1).ok_or_else(overflow)?;
        let body_records = n.checked_mul(slots).ok_or_else(overflow)?;
        let force_records = if mode.multi_body() { body_records } else { n };
        let forces = Span {
            offset: work_offset,
            records: force_records,
        };
        let neighbors = Span {
            offset: work_offset.checked_add(n_bytes).ok_or_else(overflow)?,
            records: n.checked_mul(nneighs).ok_or_else(overflow)?,
        };
        let body_bytes = body_records.checked_mul(record).ok_or_else(overflow)?;
        let echo = if mode.reserves_echo() {
            Some(Span {
                offset: work_offset.checked_add(body_bytes).ok_or_else(overflow)?,
                records: n,
            })
        } else {
            None
        };

        let work_bytes = match echo {
            Some(_) => body_bytes.checked_add(n_bytes).ok_or_else(overflow)?,
            None => body_bytes,
        };
        let total_size = work_offset.checked_add(work_bytes).ok_or_else(overflow)?;

        Ok(Self {
            particle_count: n,
            neighbor_capacity: nneighs,
            precision,
            mode,
            positions,
            virial,
            forces,
            neighbors,
            echo,
            total_size,
        })
    }

    /// Placement of a named buffer.
    #[inline]
    pub fn span(&self, kind: BufferKind) -> Span {
        match kind {
            BufferKind::Positions => self.positions,
            BufferKind::Neighbors => self.neighbors,
            BufferKind::Forces => self.forces,
            BufferKind::Virial => self.virial,
        }
    }

    /// Width of one record in bytes.
    #[inline]
    pub fn record_size(&self) -> usize {
        self.precision.record_width()
    }

    /// True when the channel exchanges 8-byte elements.
    #[inline]
    pub fn is_double_precision(&self) -> bool {
        self.precision == Precision::Double
    }

    /// Byte length of a span under this layout's precision.
    #[inline]
    pub fn span_bytes(&self, span: Span) -> usize {
        span.records * self.record_size()
    }
}
