//! Per-timestep exchange orchestrator.
//!
//! [`ForceExchange`] owns one channel and drives the handshake with the
//! external engine each step. It is generic over the channel capability, so
//! the sequence below is written exactly once for the host-memory and
//! device-memory variants.
//!
//! Nothing is committed to the particle store until every receive of the
//! step has succeeded: a failed step leaves forces, virial, and positions
//! untouched.

use std::path::Path;

use tether_core::{Element, NeighborSource, ParticleStore, Quad};
use tether_ipc::{ArrayChannel, BufferKind, BufferToken, ChannelError, ExchangeLayout, HostChannel};

use crate::config::ExchangeConfig;
use crate::error::{StepError, StepPhase};

fn step_err(timestep: u64, phase: StepPhase, source: ChannelError) -> StepError {
    StepError {
        timestep,
        phase,
        source,
    }
}

/// Drives the per-timestep protocol over one exchange channel.
pub struct ForceExchange<T: Element, C: ArrayChannel<T>> {
    channel: C,
    config: ExchangeConfig,
    last_count: usize,
    timestep: u64,
    neighbor_scratch: Vec<Quad<T>>,
    force_scratch: Vec<Quad<T>>,
    echo_scratch: Vec<Quad<T>>,
    virial_scratch: Vec<Quad<T>>,
}

impl<T: Element> ForceExchange<T, HostChannel<T>> {
    /// Create a host-memory exchange, building the channel at `path` for the
    /// given initial particle count.
    pub fn create_host(
        path: &Path,
        config: ExchangeConfig,
        n: usize,
    ) -> Result<Self, ChannelError> {
        let channel = HostChannel::create(
            path,
            n,
            config.nneighs,
            config.mode,
            config.receive_timeout,
        )?;
        Ok(Self::with_channel(channel, config))
    }
}

impl<T: Element, C: ArrayChannel<T>> ForceExchange<T, C> {
    /// Wrap an already-built channel.
    ///
    /// The channel's layout must agree with `config` on `nneighs` and force
    /// mode; [`ForceExchange::create_host`] guarantees this.
    pub fn with_channel(channel: C, config: ExchangeConfig) -> Self {
        debug_assert_eq!(channel.layout().neighbor_capacity, config.nneighs);
        debug_assert_eq!(channel.layout().mode, config.mode);

        let last_count = channel.layout().particle_count;
        let mut exchange = Self {
            channel,
            config,
            last_count,
            timestep: 0,
            neighbor_scratch: Vec::new(),
            force_scratch: Vec::new(),
            echo_scratch: Vec::new(),
            virial_scratch: Vec::new(),
        };
        exchange.resize_scratch();
        exchange
    }

    /// Run one timestep of the exchange protocol.
    ///
    /// Blocks on the engine's force publish (and virial, if enabled); this
    /// is the simulation's suspension point. Pass `None` for `neighbors`
    /// when the force computation is not neighbor-dependent.
    pub fn step<P, S>(&mut self, store: &mut P, neighbors: Option<&S>) -> Result<(), StepError>
    where
        P: ParticleStore<T>,
        S: NeighborSource<T>,
    {
        self.timestep += 1;
        let ts = self.timestep;

        // Particle count is authoritative from the store; remap before any
        // send if it moved.
        let n = store.len();
        if n != self.last_count {
            self.channel
                .remap(n)
                .map_err(|e| step_err(ts, StepPhase::Reallocate, e))?;
            self.last_count = n;
            self.resize_scratch();
        }

        self.channel
            .send(BufferKind::Positions, store.positions())
            .map_err(|e| step_err(ts, StepPhase::SendPositions, e))?;

        if self.config.nneighs > 0 {
            if let Some(source) = neighbors {
                debug_assert_eq!(source.neighbor_capacity(), self.config.nneighs);
                source.gather(&mut self.neighbor_scratch);
                self.channel
                    .send(BufferKind::Neighbors, &self.neighbor_scratch)
                    .map_err(|e| step_err(ts, StepPhase::SendNeighbors, e))?;
            }
        }

        self.channel
            .receive_into(BufferKind::Forces, &mut self.force_scratch)
            .map_err(|e| step_err(ts, StepPhase::ReceiveForces, e))?;
        if self.config.mode.reserves_echo() {
            self.channel
                .read_echo_into(&mut self.echo_scratch)
                .map_err(|e| step_err(ts, StepPhase::ReceiveEcho, e))?;
        }
        // Virial lands in scratch before anything is applied, so a failure
        // here still aborts the step with the store untouched.
        if self.config.receive_virial {
            self.channel
                .receive_into(BufferKind::Virial, &mut self.virial_scratch)
                .map_err(|e| step_err(ts, StepPhase::ReceiveVirial, e))?;
        }

        // Every receive succeeded: commit. The leading n records of the
        // force payload are the per-particle totals.
        self.config
            .mode
            .combine(store.forces_mut(), &self.force_scratch[..n]);
        if self.config.mode.reserves_echo() {
            store.apply_positions(&self.echo_scratch);
        }
        if self.config.receive_virial {
            for (acc, contribution) in store.virial_mut().iter_mut().zip(&self.virial_scratch) {
                *acc += *contribution;
            }
        }

        Ok(())
    }

    /// Opaque token for a named buffer, for the external process.
    #[inline]
    pub fn token(&self, kind: BufferKind) -> BufferToken {
        self.channel.token(kind)
    }

    /// The channel's active layout.
    #[inline]
    pub fn layout(&self) -> &ExchangeLayout {
        self.channel.layout()
    }

    /// The exchange configuration.
    #[inline]
    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    /// Number of completed or attempted steps.
    #[inline]
    pub fn timestep(&self) -> u64 {
        self.timestep
    }

    /// The underlying channel.
    #[inline]
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// The underlying channel, mutably (teardown, diagnostics).
    #[inline]
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    fn resize_scratch(&mut self) {
        let layout = self.channel.layout();
        self.neighbor_scratch = vec![Quad::zero(); layout.neighbors.records];
        self.force_scratch = vec![Quad::zero(); layout.forces.records];
        self.echo_scratch = vec![Quad::zero(); layout.echo.map_or(0, |span| span.records)];
        self.virial_scratch = vec![Quad::zero(); layout.virial.records];
    }
}
