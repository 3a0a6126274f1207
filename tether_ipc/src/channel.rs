//! Typed array channels.
//!
//! [`ArrayChannel`] is the capability the per-timestep orchestrator is
//! generic over: typed, shape-checked sends and receives of 4-wide records
//! plus the mapping lifecycle. [`HostChannel`] is the host-memory
//! implementation; the device-memory implementation lives in [`crate::cuda`]
//! and shares every piece of rendezvous logic through the sync block.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{fence, Ordering};
use std::time::Duration;

use tether_core::{Element, ForceMode, Quad};

use crate::error::{ChannelError, Result};
use crate::layout::{BufferKind, ExchangeLayout, Span, SyncBlock, BUFFER_COUNT, SYNC_BLOCK_SIZE};
use crate::region::SharedRegion;
use crate::sync::WaitOutcome;
use crate::token::BufferToken;

/// Capability over one exchange channel.
///
/// The protocol sequence in `tether_sim` is written once against this trait;
/// host-memory and device-memory channels differ only in how `send` and
/// `receive_into` move bytes. Both operations are shape-checked against the
/// active layout and fail with `SizeMismatch` on any disagreement, and with
/// `ChannelClosed` once either side has torn down.
pub trait ArrayChannel<T: Element> {
    /// Copy `records` into the named buffer and signal availability.
    fn send(&mut self, kind: BufferKind, records: &[Quad<T>]) -> Result<()>;

    /// Copy the force payload and the position echo together under a single
    /// forces publish (engine side, output mode only).
    fn send_with_echo(&mut self, forces: &[Quad<T>], echo: &[Quad<T>]) -> Result<()>;

    /// Block until the peer publishes the named buffer, then copy it into
    /// `out`. This is the protocol's only suspending operation; it fails
    /// rather than returning partial data.
    fn receive_into(&mut self, kind: BufferKind, out: &mut [Quad<T>]) -> Result<()>;

    /// Copy the position-echo sub-region into `out`. The echo rides the
    /// forces publish, so callers read it after a successful forces receive.
    fn read_echo_into(&self, out: &mut [Quad<T>]) -> Result<()>;

    /// Snapshot the current contents of the named buffer (diagnostics).
    fn read_back(&self, kind: BufferKind) -> Result<Vec<Quad<T>>>;

    /// Recompute the layout for a new particle count and remap every buffer.
    ///
    /// Atomic from the caller's perspective: on failure the prior buffers
    /// remain mapped and consistent. A no-op when `n` is unchanged.
    fn remap(&mut self, n: usize) -> Result<()>;

    /// The active layout.
    fn layout(&self) -> &ExchangeLayout;

    /// Opaque token for the named buffer under the active generation.
    fn token(&self, kind: BufferKind) -> BufferToken;

    /// Mark the channel closed, waking any peer blocked in a receive.
    fn close(&mut self);
}

/// Host-memory channel over one file-backed mapping.
///
/// The host side ([`HostChannel::create`]) owns allocation and teardown; the
/// engine side ([`HostChannel::attach`]) maps the same file and derives the
/// layout from the validated header, with no out-of-band parameters.
pub struct HostChannel<T: Element> {
    region: SharedRegion,
    layout: ExchangeLayout,
    generation: u64,
    receive_timeout: Option<Duration>,
    last_seen: [u64; BUFFER_COUNT],
    _marker: PhantomData<T>,
}

pub(crate) fn install_header(region: &mut SharedRegion, block: SyncBlock) {
    let generation = block.generation.load(Ordering::Relaxed);
    block.generation.store(0, Ordering::Relaxed);
    // Safety: the mapping is page-aligned and at least SYNC_BLOCK_SIZE bytes;
    // callers only reach this during construction or reallocation, when no
    // data is in flight.
    unsafe {
        let ptr = region.as_mut_slice().as_mut_ptr() as *mut SyncBlock;
        ptr.write(block);
        // Publish the generation last: a peer that observes it nonzero is
        // guaranteed to see every field written above. Zero means an install
        // is mid-flight and readers hold off.
        (*ptr).generation.store(generation, Ordering::Release);
    }
}

impl<T: Element> HostChannel<T> {
    /// Create the backing mapping and sync block (host side).
    pub fn create(
        path: &Path,
        n: usize,
        nneighs: usize,
        mode: ForceMode,
        receive_timeout: Option<Duration>,
    ) -> Result<Self> {
        let layout = ExchangeLayout::compute(n, nneighs, T::PRECISION, mode)?;
        let mut region = SharedRegion::create(path, layout.total_size)?;
        let generation = 1;
        install_header(
            &mut region,
            SyncBlock::new(n, nneighs, T::PRECISION, mode, generation),
        );

        Ok(Self {
            region,
            layout,
            generation,
            receive_timeout,
            last_seen: [0; BUFFER_COUNT],
            _marker: PhantomData,
        })
    }

    /// Map an existing channel (engine side).
    ///
    /// Validates the header — magic, element width against `T`, mode tag —
    /// and derives the layout from it.
    pub fn attach(path: &Path, receive_timeout: Option<Duration>) -> Result<Self> {
        let region = SharedRegion::open(path)?;
        if region.len() < SYNC_BLOCK_SIZE {
            return Err(ChannelError::InvalidHeader {
                message: "mapping shorter than the sync block",
            });
        }

        // Safety: length checked above; the mapping is page-aligned.
        let header = unsafe { &*(region.as_ptr() as *const SyncBlock) };
        // A nonzero generation means the host's header install is complete
        // and every other field is visible.
        let generation = header.settled_generation()?;
        let mode = header.validate(T::PRECISION)?;
        if header.is_closed() {
            return Err(ChannelError::ChannelClosed);
        }
        let n = header.particle_count as usize;
        let nneighs = header.neighbor_capacity as usize;

        let layout = ExchangeLayout::compute(n, nneighs, T::PRECISION, mode)?;
        if region.len() < layout.total_size {
            return Err(ChannelError::InvalidHeader {
                message: "mapping shorter than its layout",
            });
        }

        Ok(Self {
            region,
            layout,
            generation,
            receive_timeout,
            last_seen: [0; BUFFER_COUNT],
            _marker: PhantomData,
        })
    }

    /// Whether this side owns the backing file's lifetime.
    #[inline]
    pub fn is_owner(&self) -> bool {
        self.region.is_owner()
    }

    /// Reallocation generation of the mapping this side currently sees.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The channel's force mode.
    #[inline]
    pub fn mode(&self) -> ForceMode {
        self.layout.mode
    }

    /// Resolve a token to a typed view of its region.
    ///
    /// Fails if the token predates the last reallocation or was minted under
    /// a different precision.
    pub fn resolve_token(&self, token: &BufferToken) -> Result<&[Quad<T>]> {
        if token.generation() != self.generation {
            return Err(ChannelError::StaleToken {
                minted: token.generation(),
                current: self.generation,
            });
        }
        if token.precision() != T::PRECISION {
            return Err(ChannelError::PrecisionMismatch {
                expected: T::PRECISION,
                found: token.precision(),
            });
        }
        Ok(self.span_slice(Span {
            offset: token.offset(),
            records: token.records(),
        }))
    }

    fn header(&self) -> &SyncBlock {
        // Safety: the mapping was validated at construction (and after every
        // remap) to hold a sync block at offset 0; mmap memory is
        // page-aligned.
        unsafe { &*(self.region.as_ptr() as *const SyncBlock) }
    }

    fn span_range(&self, span: Span) -> core::ops::Range<usize> {
        span.offset..span.offset + span.records * core::mem::size_of::<Quad<T>>()
    }

    fn span_slice(&self, span: Span) -> &[Quad<T>] {
        bytemuck::cast_slice(&self.region.as_slice()[self.span_range(span)])
    }

    fn span_slice_mut(&mut self, span: Span) -> &mut [Quad<T>] {
        let range = self.span_range(span);
        bytemuck::cast_slice_mut(&mut self.region.as_mut_slice()[range])
    }

    fn check_shape(&self, kind: BufferKind, got: usize) -> Result<Span> {
        let span = self.layout.span(kind);
        if got != span.records {
            return Err(ChannelError::SizeMismatch {
                buffer: kind,
                expected: span.records,
                got,
            });
        }
        Ok(span)
    }

    /// Copy a span out under the named buffer's sequence, retrying until the
    /// copy is provably untorn. A stable region is still readable after a
    /// teardown; only a write that never completes fails the copy.
    fn verified_copy(&self, span: Span, seq_kind: BufferKind, out: &mut [Quad<T>]) -> Result<()> {
        loop {
            let seq = self.header().sequence(seq_kind);
            if seq & 1 == 0 {
                out.copy_from_slice(self.span_slice(span));
                fence(Ordering::Acquire);
                if self.header().sequence(seq_kind) == seq {
                    return Ok(());
                }
            }
            if self.header().is_closed() {
                return Err(ChannelError::ChannelClosed);
            }
            core::hint::spin_loop();
        }
    }

    /// Pick up a reallocation performed by the owning side (engine side).
    fn refresh_if_reallocated(&mut self) -> Result<()> {
        if self.region.is_owner() {
            return Ok(());
        }
        if self.header().load_generation() == self.generation {
            return Ok(());
        }

        self.region.remap()?;
        if self.region.len() < SYNC_BLOCK_SIZE {
            return Err(ChannelError::InvalidHeader {
                message: "mapping shorter than the sync block",
            });
        }

        let (mode, n, nneighs, generation) = {
            let header = self.header();
            let generation = header.settled_generation()?;
            let mode = header.validate(T::PRECISION)?;
            (
                mode,
                header.particle_count as usize,
                header.neighbor_capacity as usize,
                generation,
            )
        };
        let layout = ExchangeLayout::compute(n, nneighs, T::PRECISION, mode)?;
        if self.region.len() < layout.total_size {
            return Err(ChannelError::InvalidHeader {
                message: "mapping shorter than its layout",
            });
        }

        self.layout = layout;
        self.generation = generation;
        self.last_seen = [0; BUFFER_COUNT];
        Ok(())
    }
}

impl<T: Element> ArrayChannel<T> for HostChannel<T> {
    fn send(&mut self, kind: BufferKind, records: &[Quad<T>]) -> Result<()> {
        self.refresh_if_reallocated()?;
        if self.header().is_closed() {
            return Err(ChannelError::ChannelClosed);
        }
        let span = self.check_shape(kind, records.len())?;

        self.header().begin_write(kind);
        self.span_slice_mut(span).copy_from_slice(records);
        self.header().publish(kind);
        Ok(())
    }

    fn send_with_echo(&mut self, forces: &[Quad<T>], echo: &[Quad<T>]) -> Result<()> {
        self.refresh_if_reallocated()?;
        if self.header().is_closed() {
            return Err(ChannelError::ChannelClosed);
        }
        let echo_span = self.layout.echo.ok_or(ChannelError::EchoUnavailable {
            mode: self.layout.mode,
        })?;
        let span = self.check_shape(BufferKind::Forces, forces.len())?;
        if echo.len() != echo_span.records {
            return Err(ChannelError::SizeMismatch {
                buffer: BufferKind::Forces,
                expected: echo_span.records,
                got: echo.len(),
            });
        }

        self.header().begin_write(BufferKind::Forces);
        self.span_slice_mut(span).copy_from_slice(forces);
        self.span_slice_mut(echo_span).copy_from_slice(echo);
        self.header().publish(BufferKind::Forces);
        Ok(())
    }

    fn receive_into(&mut self, kind: BufferKind, out: &mut [Quad<T>]) -> Result<()> {
        loop {
            self.refresh_if_reallocated()?;
            let span = self.check_shape(kind, out.len())?;

            let outcome = self.header().wait_publish(
                kind,
                self.generation,
                self.last_seen[kind.index()],
                self.receive_timeout,
            )?;
            let seq = match outcome {
                // Layout moved mid-wait: refresh at the top of the loop.
                WaitOutcome::Reallocated => continue,
                WaitOutcome::Published(seq) => seq,
            };

            out.copy_from_slice(self.span_slice(span));
            fence(Ordering::Acquire);
            if self.header().sequence(kind) == seq {
                self.last_seen[kind.index()] = seq;
                return Ok(());
            }
            // Torn by a newer write: discard and wait for its publish.
        }
    }

    fn read_echo_into(&self, out: &mut [Quad<T>]) -> Result<()> {
        let echo = self.layout.echo.ok_or(ChannelError::EchoUnavailable {
            mode: self.layout.mode,
        })?;
        if out.len() != echo.records {
            return Err(ChannelError::SizeMismatch {
                buffer: BufferKind::Forces,
                expected: echo.records,
                got: out.len(),
            });
        }
        self.verified_copy(echo, BufferKind::Forces, out)
    }

    fn read_back(&self, kind: BufferKind) -> Result<Vec<Quad<T>>> {
        let span = self.layout.span(kind);
        let mut out = vec![Quad::zero(); span.records];
        self.verified_copy(span, kind, &mut out)?;
        Ok(out)
    }

    fn remap(&mut self, n: usize) -> Result<()> {
        if !self.region.is_owner() {
            return Err(ChannelError::AllocationFailure {
                message: "only the owning side may reallocate".into(),
            });
        }
        if n == self.layout.particle_count {
            return Ok(());
        }

        let layout =
            ExchangeLayout::compute(n, self.layout.neighbor_capacity, T::PRECISION, self.layout.mode)?;
        self.region.resize(layout.total_size)?;
        // Fresh capacity must never leak bytes from the previous size.
        self.region.as_mut_slice().fill(0);

        let generation = self.generation + 1;
        install_header(
            &mut self.region,
            SyncBlock::new(n, layout.neighbor_capacity, T::PRECISION, layout.mode, generation),
        );

        self.layout = layout;
        self.generation = generation;
        self.last_seen = [0; BUFFER_COUNT];
        Ok(())
    }

    fn layout(&self) -> &ExchangeLayout {
        &self.layout
    }

    fn token(&self, kind: BufferKind) -> BufferToken {
        let span = match (kind, self.layout.echo) {
            (BufferKind::Forces, Some(echo)) => echo,
            _ => self.layout.span(kind),
        };
        BufferToken::new(kind, span.offset, span.records, T::PRECISION, self.generation)
    }

    fn close(&mut self) {
        self.header().close();
    }
}

impl<T: Element> Drop for HostChannel<T> {
    fn drop(&mut self) {
        // Wake any peer blocked in a wait before the mapping goes away.
        self.header().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::Precision;

    fn path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("exchange.shm")
    }

    fn quads(values: &[f32]) -> Vec<Quad<f32>> {
        values.iter().map(|&v| Quad::splat(v)).collect()
    }

    #[test]
    fn test_create_and_attach() {
        let dir = tempfile::tempdir().unwrap();
        let host =
            HostChannel::<f32>::create(&path(&dir), 8, 2, ForceMode::Add, None).unwrap();
        assert!(host.is_owner());
        assert_eq!(host.layout().particle_count, 8);

        let peer = HostChannel::<f32>::attach(&path(&dir), None).unwrap();
        assert!(!peer.is_owner());
        assert_eq!(peer.layout(), host.layout());
        assert_eq!(peer.mode(), ForceMode::Add);
    }

    #[test]
    fn test_attach_wrong_precision() {
        let dir = tempfile::tempdir().unwrap();
        let _host =
            HostChannel::<f64>::create(&path(&dir), 4, 0, ForceMode::Overwrite, None).unwrap();

        match HostChannel::<f32>::attach(&path(&dir), None) {
            Err(ChannelError::PrecisionMismatch { expected, found }) => {
                assert_eq!(expected, Precision::Single);
                assert_eq!(found, Precision::Double);
            }
            _ => panic!("expected precision mismatch"),
        }
    }

    #[test]
    fn test_send_shape_checked() {
        let dir = tempfile::tempdir().unwrap();
        let mut host =
            HostChannel::<f32>::create(&path(&dir), 4, 0, ForceMode::Add, None).unwrap();

        let wrong = quads(&[1.0; 3]);
        match host.send(BufferKind::Positions, &wrong) {
            Err(ChannelError::SizeMismatch {
                buffer,
                expected,
                got,
            }) => {
                assert_eq!(buffer, BufferKind::Positions);
                assert_eq!(expected, 4);
                assert_eq!(got, 3);
            }
            _ => panic!("expected size mismatch"),
        }
    }

    #[test]
    fn test_positions_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut host =
            HostChannel::<f32>::create(&path(&dir), 4, 0, ForceMode::Add, None).unwrap();
        let mut peer = HostChannel::<f32>::attach(&path(&dir), None).unwrap();

        let sent: Vec<Quad<f32>> = (0..4)
            .map(|i| Quad::new(i as f32, i as f32 + 0.25, i as f32 + 0.5, 1.0))
            .collect();
        host.send(BufferKind::Positions, &sent).unwrap();

        let mut got = vec![Quad::zero(); 4];
        peer.receive_into(BufferKind::Positions, &mut got).unwrap();
        assert_eq!(got, sent);

        // The host's own view of the region matches too.
        assert_eq!(host.read_back(BufferKind::Positions).unwrap(), sent);
    }

    #[test]
    fn test_receive_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let _host =
            HostChannel::<f32>::create(&path(&dir), 2, 0, ForceMode::Add, None).unwrap();
        let mut peer = HostChannel::<f32>::attach(
            &path(&dir),
            Some(Duration::from_millis(10)),
        )
        .unwrap();

        let mut out = vec![Quad::zero(); 2];
        match peer.receive_into(BufferKind::Positions, &mut out) {
            Err(ChannelError::Timeout { buffer, .. }) => {
                assert_eq!(buffer, BufferKind::Positions)
            }
            _ => panic!("expected timeout"),
        }
    }

    #[test]
    fn test_close_fails_send_and_attach() {
        let dir = tempfile::tempdir().unwrap();
        let mut host =
            HostChannel::<f32>::create(&path(&dir), 2, 0, ForceMode::Add, None).unwrap();
        host.close();

        let data = quads(&[0.0; 2]);
        assert!(matches!(
            host.send(BufferKind::Positions, &data),
            Err(ChannelError::ChannelClosed)
        ));
        assert!(matches!(
            HostChannel::<f32>::attach(&path(&dir), None),
            Err(ChannelError::ChannelClosed)
        ));
    }

    #[test]
    fn test_token_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let host =
            HostChannel::<f32>::create(&path(&dir), 4, 2, ForceMode::Add, None).unwrap();
        let layout = *host.layout();

        let positions = host.token(BufferKind::Positions);
        let virial = host.token(BufferKind::Virial);
        let forces = host.token(BufferKind::Forces);
        let neighbors = host.token(BufferKind::Neighbors);

        // Virial is one particle's worth past the positions base; neighbors
        // analogously past the forces base.
        let stride = 4 * layout.record_size();
        assert_eq!(virial.offset(), positions.offset() + stride);
        assert_eq!(neighbors.offset(), forces.offset() + stride);
        assert_eq!(forces.records(), 4);
        assert_eq!(neighbors.records(), 8);
        assert_eq!(positions.precision(), Precision::Single);
    }

    #[test]
    fn test_forces_token_points_at_echo_in_output_mode() {
        let dir = tempfile::tempdir().unwrap();
        let host =
            HostChannel::<f32>::create(&path(&dir), 4, 2, ForceMode::Output, None).unwrap();

        let forces = host.token(BufferKind::Forces);
        let echo = host.layout().echo.unwrap();
        assert_eq!(forces.offset(), echo.offset);
        assert_eq!(forces.records(), 4);
    }

    #[test]
    fn test_remap_invalidates_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let mut host =
            HostChannel::<f32>::create(&path(&dir), 4, 0, ForceMode::Add, None).unwrap();

        let stale = host.token(BufferKind::Positions);
        assert!(host.resolve_token(&stale).is_ok());

        host.remap(8).unwrap();
        assert!(matches!(
            host.resolve_token(&stale),
            Err(ChannelError::StaleToken { .. })
        ));

        let fresh = host.token(BufferKind::Positions);
        assert_eq!(host.resolve_token(&fresh).unwrap().len(), 8);
    }

    #[test]
    fn test_remap_idempotent_and_zeroing() {
        let dir = tempfile::tempdir().unwrap();
        let mut host =
            HostChannel::<f32>::create(&path(&dir), 4, 0, ForceMode::Add, None).unwrap();

        let data = quads(&[7.0; 4]);
        host.send(BufferKind::Positions, &data).unwrap();

        // Same count: nothing moves, data stays.
        let before = *host.layout();
        host.remap(4).unwrap();
        assert_eq!(*host.layout(), before);
        assert_eq!(host.read_back(BufferKind::Positions).unwrap(), data);

        // Shrink then grow: capacities track exactly and nothing stale
        // bleeds through.
        host.remap(2).unwrap();
        assert_eq!(host.layout().positions.records, 2);
        assert_eq!(
            host.read_back(BufferKind::Positions).unwrap(),
            vec![Quad::zero(); 2]
        );

        host.remap(8).unwrap();
        assert_eq!(host.layout().positions.records, 8);
        assert_eq!(
            host.read_back(BufferKind::Positions).unwrap(),
            vec![Quad::zero(); 8]
        );
    }

    #[test]
    fn test_peer_follows_remap() {
        let dir = tempfile::tempdir().unwrap();
        let mut host =
            HostChannel::<f32>::create(&path(&dir), 4, 0, ForceMode::Add, None).unwrap();
        let mut peer = HostChannel::<f32>::attach(&path(&dir), None).unwrap();

        host.remap(6).unwrap();
        let sent = quads(&[1.0; 6]);
        host.send(BufferKind::Positions, &sent).unwrap();

        let mut out = vec![Quad::zero(); 6];
        peer.receive_into(BufferKind::Positions, &mut out).unwrap();
        assert_eq!(out, sent);
        assert_eq!(peer.layout().particle_count, 6);
    }

    #[test]
    fn test_peer_cannot_remap() {
        let dir = tempfile::tempdir().unwrap();
        let _host =
            HostChannel::<f32>::create(&path(&dir), 4, 0, ForceMode::Add, None).unwrap();
        let mut peer = HostChannel::<f32>::attach(&path(&dir), None).unwrap();

        assert!(matches!(
            peer.remap(8),
            Err(ChannelError::AllocationFailure { .. })
        ));
    }

    #[test]
    fn test_echo_unavailable_outside_output_mode() {
        let dir = tempfile::tempdir().unwrap();
        let host =
            HostChannel::<f32>::create(&path(&dir), 2, 0, ForceMode::Add, None).unwrap();

        let mut out = vec![Quad::zero(); 2];
        assert!(matches!(
            host.read_echo_into(&mut out),
            Err(ChannelError::EchoUnavailable { .. })
        ));
    }
}
