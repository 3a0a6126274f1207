//! Collaborator interfaces consumed by the per-timestep orchestrator.
//!
//! These traits abstract the host simulation's particle storage and its
//! neighbor-list collaborator, so the exchange protocol never touches engine
//! internals. The simulation implements them over whatever storage it owns.

use crate::types::{Element, Quad};

/// Access to the host simulation's per-particle arrays.
///
/// The particle count reported by [`ParticleStore::len`] is authoritative: a
/// change between steps triggers a full channel reallocation before the next
/// send.
pub trait ParticleStore<T: Element> {
    /// Number of particles currently in the store.
    fn len(&self) -> usize;

    /// True when the store holds no particles.
    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position snapshot, one record per particle, ordered by particle id.
    /// The auxiliary scalar rides in `w`.
    fn positions(&self) -> &[Quad<T>];

    /// Write back an externally produced position array (echo application in
    /// output mode). `positions.len()` equals [`ParticleStore::len`].
    fn apply_positions(&mut self, positions: &[Quad<T>]);

    /// Mutable per-particle force accumulator.
    fn forces_mut(&mut self) -> &mut [Quad<T>];

    /// Mutable per-particle virial accumulator. Contributions from multiple
    /// force computations sum here, so writes must be additive.
    fn virial_mut(&mut self) -> &mut [Quad<T>];
}

/// Producer of the fixed-capacity neighbor snapshot.
///
/// The neighbor list itself is owned by the simulation's neighbor-list
/// collaborator; this trait only copies the current snapshot into the channel
/// staging buffer each step.
pub trait NeighborSource<T: Element> {
    /// Per-particle neighbor capacity (`nneighs`).
    fn neighbor_capacity(&self) -> usize;

    /// Copy the particle-major neighbor records into `out`, zero-filling
    /// unused slots. `out.len()` equals `n * neighbor_capacity()`.
    fn gather(&self, out: &mut [Quad<T>]);
}

/// Placeholder source for exchanges whose force computation is not
/// neighbor-dependent (`nneighs == 0`); the neighbor send is skipped.
pub struct NoNeighbors;

impl<T: Element> NeighborSource<T> for NoNeighbors {
    fn neighbor_capacity(&self) -> usize {
        0
    }

    fn gather(&self, _out: &mut [Quad<T>]) {}
}
