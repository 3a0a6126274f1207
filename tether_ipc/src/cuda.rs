//! Device-memory channel over CUDA IPC handles.
//!
//! Same contract as the host channel, with the regions held in device memory
//! behind exported IPC handles instead of a host mapping. `send` stages host
//! records onto the device, `receive` copies them back, and both rendezvous
//! through the SAME host-side sync block and sequence protocol as the host
//! channel — device IPC handles carry no synchronization of their own, and
//! the cross-process handshake must not drift between the two variants.
//!
//! Handle export/import failure is fatal and never retried: mid-simulation
//! device-context recovery is not supported.

use core::fmt;
use std::path::Path;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cudarc::driver::sys;
use cudarc::driver::{CudaDevice, CudaSlice, DevicePtr, DeviceRepr, DriverError, ValidAsZeroBits};

use tether_core::{Element, ForceMode, Precision, Quad};

use crate::channel::{install_header, ArrayChannel};
use crate::error::{ChannelError, Result};
use crate::layout::{BufferKind, ExchangeLayout, SyncBlock, BUFFER_COUNT, SYNC_BLOCK_SIZE};
use crate::region::SharedRegion;
use crate::sync::WaitOutcome;
use crate::token::BufferToken;

/// `cuIpcOpenMemHandle` flag enabling lazy peer access.
const CU_IPC_MEM_LAZY_ENABLE_PEER_ACCESS: u32 = 1;

fn device_fault(context: &str, err: DriverError) -> ChannelError {
    ChannelError::DeviceFault {
        message: format!("{context}: {err:?}"),
    }
}

/// Fixed-size opaque device-memory IPC handle for one buffer.
///
/// Transported to the peer process through a side channel (file, control
/// socket) outside this crate's responsibility; this crate only produces and
/// consumes the handle.
#[derive(Clone, Copy)]
pub struct DeviceToken {
    kind: BufferKind,
    records: usize,
    precision: Precision,
    generation: u64,
    handle: sys::CUipcMemHandle,
}

impl DeviceToken {
    /// Buffer this handle resolves to.
    #[inline]
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Capacity in 4-wide records.
    #[inline]
    pub fn records(&self) -> usize {
        self.records
    }

    /// Element precision the buffer was allocated under.
    #[inline]
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Reallocation generation the handle was exported under.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Raw 64-byte handle, for transport over the side channel.
    pub fn bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        for (dst, src) in out.iter_mut().zip(self.handle.reserved.iter()) {
            *dst = *src as u8;
        }
        out
    }

    /// Import the handle in the peer process, yielding the raw device
    /// pointer it resolves to.
    ///
    /// # Safety
    ///
    /// The calling process must hold a CUDA context on the same physical
    /// device the handle was exported from, and must not outlive the
    /// exporting channel's allocation.
    pub unsafe fn import(&self) -> Result<sys::CUdeviceptr> {
        let mut ptr: sys::CUdeviceptr = 0;
        let rc = sys::cuIpcOpenMemHandle_v2(
            &mut ptr,
            self.handle,
            CU_IPC_MEM_LAZY_ENABLE_PEER_ACCESS,
        );
        if rc != sys::CUresult::CUDA_SUCCESS {
            return Err(ChannelError::HandleExchange {
                message: format!("cuIpcOpenMemHandle on {}: {rc:?}", self.kind),
            });
        }
        Ok(ptr)
    }
}

impl fmt::Debug for DeviceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceToken")
            .field("kind", &self.kind)
            .field("records", &self.records)
            .field("precision", &self.precision)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Exported IPC handles for every device buffer.
#[derive(Debug, Clone, Copy)]
pub struct DeviceTokenSet {
    /// Positions buffer handle.
    pub positions: DeviceToken,
    /// Neighbor-list buffer handle.
    pub neighbors: DeviceToken,
    /// Forces handle. In output mode this is the echo sub-buffer's handle,
    /// since positions are appended after the force payload there.
    pub forces: DeviceToken,
    /// Virial buffer handle.
    pub virial: DeviceToken,
    /// Full engine-facing force payload handle (differs from `forces` only
    /// in output mode).
    pub force_payload: DeviceToken,
}

struct DeviceBuffers<T> {
    positions: CudaSlice<T>,
    neighbors: CudaSlice<T>,
    forces: CudaSlice<T>,
    echo: Option<CudaSlice<T>>,
    virial: CudaSlice<T>,
}

impl<T: Element + DeviceRepr + ValidAsZeroBits> DeviceBuffers<T> {
    fn allocate(dev: &Arc<CudaDevice>, layout: &ExchangeLayout) -> Result<Self> {
        let alloc = |records: usize| {
            // Zero-capacity buffers still get a real allocation so a handle
            // can be exported for them.
            let elems = (records * 4).max(1);
            dev.alloc_zeros::<T>(elems).map_err(|e| ChannelError::AllocationFailure {
                message: format!("device allocation of {elems} elements: {e:?}"),
            })
        };

        Ok(Self {
            positions: alloc(layout.positions.records)?,
            neighbors: alloc(layout.neighbors.records)?,
            forces: alloc(layout.forces.records)?,
            echo: match layout.echo {
                Some(span) => Some(alloc(span.records)?),
                None => None,
            },
            virial: alloc(layout.virial.records)?,
        })
    }

    fn slot(&self, kind: BufferKind) -> &CudaSlice<T> {
        match kind {
            BufferKind::Positions => &self.positions,
            BufferKind::Neighbors => &self.neighbors,
            BufferKind::Forces => &self.forces,
            BufferKind::Virial => &self.virial,
        }
    }

    fn slot_mut(&mut self, kind: BufferKind) -> &mut CudaSlice<T> {
        match kind {
            BufferKind::Positions => &mut self.positions,
            BufferKind::Neighbors => &mut self.neighbors,
            BufferKind::Forces => &mut self.forces,
            BufferKind::Virial => &mut self.virial,
        }
    }

    fn export(&self, layout: &ExchangeLayout, generation: u64) -> Result<DeviceTokenSet> {
        let force_payload = export_token(
            &self.forces,
            BufferKind::Forces,
            layout.forces.records,
            generation,
        )?;
        let forces = match (&self.echo, layout.echo) {
            (Some(echo), Some(span)) => {
                export_token(echo, BufferKind::Forces, span.records, generation)?
            }
            _ => force_payload,
        };

        Ok(DeviceTokenSet {
            positions: export_token(
                &self.positions,
                BufferKind::Positions,
                layout.positions.records,
                generation,
            )?,
            neighbors: export_token(
                &self.neighbors,
                BufferKind::Neighbors,
                layout.neighbors.records,
                generation,
            )?,
            forces,
            virial: export_token(
                &self.virial,
                BufferKind::Virial,
                layout.virial.records,
                generation,
            )?,
            force_payload,
        })
    }
}

fn export_token<T: Element + DeviceRepr>(
    slice: &CudaSlice<T>,
    kind: BufferKind,
    records: usize,
    generation: u64,
) -> Result<DeviceToken> {
    let mut handle = sys::CUipcMemHandle { reserved: [0; 64] };
    let ptr = *slice.device_ptr();
    // Safety: `ptr` refers to a live device allocation owned by the caller.
    let rc = unsafe { sys::cuIpcGetMemHandle(&mut handle, ptr) };
    if rc != sys::CUresult::CUDA_SUCCESS {
        return Err(ChannelError::HandleExchange {
            message: format!("cuIpcGetMemHandle on {kind}: {rc:?}"),
        });
    }
    Ok(DeviceToken {
        kind,
        records,
        precision: T::PRECISION,
        generation,
        handle,
    })
}

/// Device-memory channel: device-resident staging buffers behind IPC
/// handles, rendezvous through a host-side sync mapping.
pub struct DeviceChannel<T: Element + DeviceRepr + ValidAsZeroBits> {
    dev: Arc<CudaDevice>,
    sync: SharedRegion,
    layout: ExchangeLayout,
    buffers: DeviceBuffers<T>,
    tokens: DeviceTokenSet,
    generation: u64,
    receive_timeout: Option<Duration>,
    last_seen: [u64; BUFFER_COUNT],
}

impl<T: Element + DeviceRepr + ValidAsZeroBits> DeviceChannel<T> {
    /// Allocate the device buffers, export their IPC handles, and create the
    /// host-side sync mapping (host side).
    pub fn create(
        sync_path: &Path,
        ordinal: usize,
        n: usize,
        nneighs: usize,
        mode: ForceMode,
        receive_timeout: Option<Duration>,
    ) -> Result<Self> {
        let dev = CudaDevice::new(ordinal).map_err(|e| ChannelError::AllocationFailure {
            message: format!("cuda device {ordinal}: {e:?}"),
        })?;
        let layout = ExchangeLayout::compute(n, nneighs, T::PRECISION, mode)?;
        let generation = 1;

        let buffers = DeviceBuffers::allocate(&dev, &layout)?;
        let tokens = buffers.export(&layout, generation)?;

        let mut sync = SharedRegion::create(sync_path, SYNC_BLOCK_SIZE)?;
        install_header(
            &mut sync,
            SyncBlock::new(n, nneighs, T::PRECISION, mode, generation),
        );

        Ok(Self {
            dev,
            sync,
            layout,
            buffers,
            tokens,
            generation,
            receive_timeout,
            last_seen: [0; BUFFER_COUNT],
        })
    }

    /// The exported IPC handles under the active generation.
    #[inline]
    pub fn device_tokens(&self) -> &DeviceTokenSet {
        &self.tokens
    }

    /// The channel's force mode.
    #[inline]
    pub fn mode(&self) -> ForceMode {
        self.layout.mode
    }

    fn header(&self) -> &SyncBlock {
        // Safety: the sync mapping is created SYNC_BLOCK_SIZE bytes long at
        // construction; mmap memory is page-aligned.
        unsafe { &*(self.sync.as_ptr() as *const SyncBlock) }
    }

    fn check_shape(&self, kind: BufferKind, got: usize) -> Result<()> {
        let expected = self.layout.span(kind).records;
        if got != expected {
            return Err(ChannelError::SizeMismatch {
                buffer: kind,
                expected,
                got,
            });
        }
        Ok(())
    }
}

impl<T: Element + DeviceRepr + ValidAsZeroBits> ArrayChannel<T> for DeviceChannel<T> {
    fn send(&mut self, kind: BufferKind, records: &[Quad<T>]) -> Result<()> {
        if self.header().is_closed() {
            return Err(ChannelError::ChannelClosed);
        }
        self.check_shape(kind, records.len())?;

        self.header().begin_write(kind);
        if !records.is_empty() {
            let scalars: &[T] = bytemuck::cast_slice(records);
            self.dev
                .htod_sync_copy_into(scalars, self.buffers.slot_mut(kind))
                .map_err(|e| device_fault("host-to-device copy", e))?;
        }
        self.header().publish(kind);
        Ok(())
    }

    fn send_with_echo(&mut self, forces: &[Quad<T>], echo: &[Quad<T>]) -> Result<()> {
        if self.header().is_closed() {
            return Err(ChannelError::ChannelClosed);
        }
        let echo_span = self.layout.echo.ok_or(ChannelError::EchoUnavailable {
            mode: self.layout.mode,
        })?;
        self.check_shape(BufferKind::Forces, forces.len())?;
        if echo.len() != echo_span.records {
            return Err(ChannelError::SizeMismatch {
                buffer: BufferKind::Forces,
                expected: echo_span.records,
                got: echo.len(),
            });
        }

        self.header().begin_write(BufferKind::Forces);
        if !forces.is_empty() {
            let scalars: &[T] = bytemuck::cast_slice(forces);
            self.dev
                .htod_sync_copy_into(scalars, &mut self.buffers.forces)
                .map_err(|e| device_fault("host-to-device copy", e))?;
        }
        if !echo.is_empty() {
            // The echo buffer exists whenever the layout reserves the span.
            if let Some(echo_buf) = self.buffers.echo.as_mut() {
                let scalars: &[T] = bytemuck::cast_slice(echo);
                self.dev
                    .htod_sync_copy_into(scalars, echo_buf)
                    .map_err(|e| device_fault("host-to-device copy", e))?;
            }
        }
        self.header().publish(BufferKind::Forces);
        Ok(())
    }

    fn receive_into(&mut self, kind: BufferKind, out: &mut [Quad<T>]) -> Result<()> {
        self.check_shape(kind, out.len())?;

        loop {
            let outcome = self.header().wait_publish(
                kind,
                self.generation,
                self.last_seen[kind.index()],
                self.receive_timeout,
            )?;
            let seq = match outcome {
                // This side owns the sync block, so its generation only
                // moves through our own remap.
                WaitOutcome::Reallocated => continue,
                WaitOutcome::Published(seq) => seq,
            };
            if !out.is_empty() {
                let scalars: &mut [T] = bytemuck::cast_slice_mut(out);
                self.dev
                    .dtoh_sync_copy_into(self.buffers.slot(kind), scalars)
                    .map_err(|e| device_fault("device-to-host copy", e))?;
            }
            fence(Ordering::Acquire);
            if self.header().sequence(kind) == seq {
                self.last_seen[kind.index()] = seq;
                return Ok(());
            }
            // Torn by a newer write: discard and wait for its publish.
        }
    }

    fn read_echo_into(&self, out: &mut [Quad<T>]) -> Result<()> {
        let (echo, span) = match (&self.buffers.echo, self.layout.echo) {
            (Some(echo), Some(span)) => (echo, span),
            _ => {
                return Err(ChannelError::EchoUnavailable {
                    mode: self.layout.mode,
                })
            }
        };
        if out.len() != span.records {
            return Err(ChannelError::SizeMismatch {
                buffer: BufferKind::Forces,
                expected: span.records,
                got: out.len(),
            });
        }

        loop {
            let seq = self.header().sequence(BufferKind::Forces);
            if seq & 1 == 0 {
                if !out.is_empty() {
                    let scalars: &mut [T] = bytemuck::cast_slice_mut(out);
                    self.dev
                        .dtoh_sync_copy_into(echo, scalars)
                        .map_err(|e| device_fault("device-to-host copy", e))?;
                }
                fence(Ordering::Acquire);
                if self.header().sequence(BufferKind::Forces) == seq {
                    return Ok(());
                }
            }
            if self.header().is_closed() {
                return Err(ChannelError::ChannelClosed);
            }
            core::hint::spin_loop();
        }
    }

    fn read_back(&self, kind: BufferKind) -> Result<Vec<Quad<T>>> {
        let records = self.layout.span(kind).records;
        let mut out = vec![Quad::zero(); records];
        if records > 0 {
            let scalars: &mut [T] = bytemuck::cast_slice_mut(&mut out);
            self.dev
                .dtoh_sync_copy_into(self.buffers.slot(kind), scalars)
                .map_err(|e| device_fault("device-to-host copy", e))?;
        }
        Ok(out)
    }

    fn remap(&mut self, n: usize) -> Result<()> {
        if n == self.layout.particle_count {
            return Ok(());
        }

        let layout = ExchangeLayout::compute(
            n,
            self.layout.neighbor_capacity,
            T::PRECISION,
            self.layout.mode,
        )?;
        // Allocate and re-export everything before swapping, so a failure
        // leaves the prior buffers and handles intact.
        let buffers = DeviceBuffers::allocate(&self.dev, &layout)?;
        let generation = self.generation + 1;
        let tokens = buffers.export(&layout, generation)?;

        install_header(
            &mut self.sync,
            SyncBlock::new(n, layout.neighbor_capacity, T::PRECISION, layout.mode, generation),
        );

        self.buffers = buffers;
        self.tokens = tokens;
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

impl<T: Element + DeviceRepr + ValidAsZeroBits> Drop for DeviceChannel<T> {
    fn drop(&mut self) {
        self.header().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("device-sync.shm")
    }

    // These tests require a CUDA-capable device and driver.

    #[test]
    fn test_device_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel = DeviceChannel::<f32>::create(
            &sync_path(&dir),
            0,
            4,
            0,
            ForceMode::Add,
            Some(Duration::from_secs(1)),
        )
        .unwrap();

        let sent: Vec<Quad<f32>> = (0..4)
            .map(|i| Quad::new(i as f32, 0.0, -(i as f32), 1.0))
            .collect();
        channel.send(BufferKind::Positions, &sent).unwrap();
        assert_eq!(channel.read_back(BufferKind::Positions).unwrap(), sent);

        let mut got = vec![Quad::zero(); 4];
        channel
            .receive_into(BufferKind::Positions, &mut got)
            .unwrap();
        assert_eq!(got, sent);
    }

    #[test]
    fn test_device_tokens_regenerate_on_remap() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel = DeviceChannel::<f32>::create(
            &sync_path(&dir),
            0,
            4,
            2,
            ForceMode::Add,
            None,
        )
        .unwrap();

        let before = channel.device_tokens().positions.generation();
        channel.remap(8).unwrap();
        let after = channel.device_tokens().positions;
        assert_eq!(after.generation(), before + 1);
        assert_eq!(after.records(), 8);
        assert_eq!(channel.device_tokens().neighbors.records(), 16);
    }
}
