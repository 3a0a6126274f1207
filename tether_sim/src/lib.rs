//! # tether_sim
//!
//! Simulation-side orchestrator for the tether exchange protocol.
//!
//! One [`ForceExchange`] drives the per-timestep handshake with the external
//! engine, generic over the [`tether_ipc::ArrayChannel`] capability so the
//! host-memory and device-memory channels run the identical sequence:
//!
//! 1. Reallocate if the particle count changed
//! 2. Send the position snapshot
//! 3. Send the neighbor snapshot (when the force computation needs it)
//! 4. Block on forces (and the position echo in output mode)
//! 5. Apply the force-mode combine
//! 6. Accumulate the virial, if enabled
//!
//! Errors abort the step before any force, virial, or position mutation is
//! committed, carrying the failing phase for the simulation driver.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod exchange;

pub use config::ExchangeConfig;
pub use error::{StepError, StepPhase};
pub use exchange::ForceExchange;

// Re-export what driver code needs alongside the orchestrator.
pub use tether_core::{
    Element, ForceMode, NeighborSource, NoNeighbors, ParticleStore, Precision, Quad,
};
pub use tether_ipc::{
    ArrayChannel, BufferKind, BufferToken, ChannelError, ExchangeLayout, HostChannel,
};
