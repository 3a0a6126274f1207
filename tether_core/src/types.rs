//! Exchange record and precision types.
//!
//! Every buffer exchanged with the external engine is a sequence of 4-wide
//! records ([`Quad`]): positions carry an auxiliary scalar in `w`, force
//! records an energy-like scalar, and virial records the per-particle
//! symmetric stress components. The element width (single or double) is fixed
//! for the lifetime of a channel and validated when the peer attaches.

use core::fmt;
use core::ops::{Add, AddAssign};

use bytemuck::{Pod, Zeroable};

/// Element precision of a channel, fixed for its lifetime.
///
/// A channel created under one precision cannot be read under another; the
/// width is recorded in the mapped header and checked on attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    /// 4-byte elements (`f32`).
    Single,
    /// 8-byte elements (`f64`).
    Double,
}

impl Precision {
    /// Element width in bytes.
    #[inline]
    pub const fn width(&self) -> usize {
        match self {
            Precision::Single => 4,
            Precision::Double => 8,
        }
    }

    /// Width of one 4-component record in bytes.
    #[inline]
    pub const fn record_width(&self) -> usize {
        self.width() * 4
    }

    /// Recover a precision from an element width, if valid.
    #[inline]
    pub const fn from_width(width: usize) -> Option<Self> {
        match width {
            4 => Some(Precision::Single),
            8 => Some(Precision::Double),
            _ => None,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Single => write!(f, "single"),
            Precision::Double => write!(f, "double"),
        }
    }
}

/// Scalar element of an exchanged record.
///
/// Implemented for `f32` and `f64` only; the associated [`Precision`] tag is
/// what channels record in their headers and tokens.
pub trait Element:
    Pod
    + Default
    + PartialEq
    + PartialOrd
    + Add<Output = Self>
    + AddAssign
    + fmt::Debug
    + Send
    + Sync
{
    /// Precision tag matching this element's width.
    const PRECISION: Precision;
    /// Additive identity.
    const ZERO: Self;

    /// Lossy conversion from `f64`, for constructing test fixtures and
    /// mode-independent constants.
    fn from_f64(value: f64) -> Self;
}

impl Element for f32 {
    const PRECISION: Precision = Precision::Single;
    const ZERO: Self = 0.0;

    #[inline]
    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl Element for f64 {
    const PRECISION: Precision = Precision::Double;
    const ZERO: Self = 0.0;

    #[inline]
    fn from_f64(value: f64) -> Self {
        value
    }
}

/// A 4-component exchange record.
///
/// The unit of every buffer crossing the process boundary. `#[repr(C)]` with
/// four identical scalar fields, so a slice of records is byte-castable to
/// the mapped region on either side.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Quad<T> {
    /// X component.
    pub x: T,
    /// Y component.
    pub y: T,
    /// Z component.
    pub z: T,
    /// Auxiliary component (type scalar, energy, or packed stress term).
    pub w: T,
}

// Safety: Quad is repr(C) with four fields of one Pod scalar type; there is
// no padding for any Element width.
unsafe impl<T: Element> Zeroable for Quad<T> {}
unsafe impl<T: Element> Pod for Quad<T> {}

impl<T: Element> Quad<T> {
    /// Create a record from all four components.
    #[inline]
    pub const fn new(x: T, y: T, z: T, w: T) -> Self {
        Self { x, y, z, w }
    }

    /// The all-zero record.
    #[inline]
    pub const fn zero() -> Self {
        Self {
            x: T::ZERO,
            y: T::ZERO,
            z: T::ZERO,
            w: T::ZERO,
        }
    }

    /// Create a record from the spatial components, zeroing `w`.
    #[inline]
    pub const fn from_xyz(x: T, y: T, z: T) -> Self {
        Self {
            x,
            y,
            z,
            w: T::ZERO,
        }
    }

    /// All components set to the same value.
    #[inline]
    pub const fn splat(value: T) -> Self {
        Self {
            x: value,
            y: value,
            z: value,
            w: value,
        }
    }

    /// Convert to an array.
    #[inline]
    pub const fn as_array(&self) -> [T; 4] {
        [self.x, self.y, self.z, self.w]
    }
}

impl<T: Element> From<[T; 4]> for Quad<T> {
    #[inline]
    fn from(arr: [T; 4]) -> Self {
        Self {
            x: arr[0],
            y: arr[1],
            z: arr[2],
            w: arr[3],
        }
    }
}

impl<T: Element> From<Quad<T>> for [T; 4] {
    #[inline]
    fn from(q: Quad<T>) -> Self {
        q.as_array()
    }
}

impl<T: Element> Add for Quad<T> {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self {
            x: self.x + other.x,
            y: self.y + other.y,
            z: self.z + other.z,
            w: self.w + other.w,
        }
    }
}

impl<T: Element> AddAssign for Quad<T> {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.x += other.x;
        self.y += other.y;
        self.z += other.z;
        self.w += other.w;
    }
}
