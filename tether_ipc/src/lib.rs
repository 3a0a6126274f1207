//! # tether_ipc
//!
//! Array channels between a host simulation process and an out-of-process
//! numerical engine, over file-backed shared memory (host channel) or CUDA
//! device memory behind IPC handles (device channel, feature `cuda`).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Backing Mapping (one file)                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Sync block (128 bytes, cache-line aligned)                     │
//! │  ├─ magic, element width, n, nneighs, mode tag                  │
//! │  ├─ generation: AtomicU64 (bumped by every reallocation)        │
//! │  ├─ closed: AtomicU32                                           │
//! │  └─ publish sequence per buffer: [AtomicU64; 4]                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  State region                                                   │
//! │  ├─ positions: [Quad<T>; n]                                     │
//! │  └─ virial:    [Quad<T>; n]                                     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Work region (64-byte aligned)                                  │
//! │  ├─ forces:    [Quad<T>; n]  (n·(1+nneighs) in output mode)     │
//! │  ├─ neighbors: [Quad<T>; n·nneighs]  (particle-major)           │
//! │  └─ echo:      [Quad<T>; n]  (output mode only)                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Synchronization
//!
//! Each named buffer carries a seqlock-style publish sequence in the sync
//! block:
//!
//! 1. **Writer**: bump sequence to ODD (write in progress), write the
//!    payload, fence, bump to EVEN (published).
//! 2. **Reader**: wait for an EVEN sequence newer than the last one it
//!    consumed, copy the payload out, fence, re-read the sequence; on a
//!    mismatch the copy is discarded and the wait restarts.
//!
//! A receive that returns therefore never exposes a torn region, across
//! processes and not merely across threads. Region ownership alternates
//! strictly between the two processes each timestep, so the sequences are
//! the only arbitration needed.
//!
//! # Lifecycle
//!
//! The host side creates, sizes, and removes the backing file; the peer side
//! only opens and maps it. Reallocation (particle-count change) rewrites the
//! header under a bumped generation; peers refresh their cached layout when
//! they observe the change. Teardown on either side raises the closed flag,
//! waking any peer blocked in a receive with `ChannelClosed`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod error;
pub mod layout;
pub mod region;
pub mod sync;
pub mod token;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use channel::{ArrayChannel, HostChannel};
pub use error::{ChannelError, Result};
pub use layout::{BufferKind, ExchangeLayout, Span, SyncBlock, EXCHANGE_MAGIC, SYNC_BLOCK_SIZE};
pub use region::SharedRegion;
pub use sync::WaitOutcome;
pub use token::BufferToken;

#[cfg(feature = "cuda")]
pub use cuda::{DeviceChannel, DeviceToken, DeviceTokenSet};

// Re-export the core model alongside the channels.
pub use tether_core::{Element, ForceMode, Precision, Quad};
