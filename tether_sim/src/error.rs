//! Step errors with phase context.

use core::fmt;

use thiserror::Error;

use tether_ipc::ChannelError;

/// Phase of the per-timestep protocol, for error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    /// Channel reallocation after a particle-count change.
    Reallocate,
    /// Position snapshot send.
    SendPositions,
    /// Neighbor snapshot send.
    SendNeighbors,
    /// Blocking receive of the force buffer.
    ReceiveForces,
    /// Read of the position-echo sub-region (output mode).
    ReceiveEcho,
    /// Blocking receive of the virial buffer.
    ReceiveVirial,
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepPhase::Reallocate => write!(f, "reallocate"),
            StepPhase::SendPositions => write!(f, "send positions"),
            StepPhase::SendNeighbors => write!(f, "send neighbors"),
            StepPhase::ReceiveForces => write!(f, "receive forces"),
            StepPhase::ReceiveEcho => write!(f, "receive echo"),
            StepPhase::ReceiveVirial => write!(f, "receive virial"),
        }
    }
}

/// A timestep aborted before any result was committed.
///
/// Identifies the timestep and phase that failed; the underlying channel
/// error names the buffer. Nothing is retried — the simulation driver
/// decides whether the run continues.
#[derive(Error, Debug)]
#[error("timestep {timestep}: {phase} failed: {source}")]
pub struct StepError {
    /// Timestep counter at the point of failure.
    pub timestep: u64,
    /// Protocol phase that failed.
    pub phase: StepPhase,
    /// The underlying channel failure.
    #[source]
    pub source: ChannelError,
}
