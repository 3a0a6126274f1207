//! File-backed shared regions.
//!
//! The host (simulation) side creates, sizes, zeroes, and eventually removes
//! the backing file; the external engine only opens and maps it. Both sides
//! end up with the same bytes mapped, and all cross-process coordination
//! happens through the atomics in the sync block at the head of the mapping.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{ChannelError, Result};

fn alloc_err(context: &str, err: std::io::Error) -> ChannelError {
    ChannelError::AllocationFailure {
        message: format!("{context}: {err}"),
    }
}

/// A file-backed memory region shared between two processes.
///
/// Dropping the owning side removes the backing file; an already-mapped peer
/// keeps its mapping until it unmaps (the inode stays alive), but new
/// attaches fail.
pub struct SharedRegion {
    file: File,
    map: MmapMut,
    path: PathBuf,
    owned: bool,
}

impl SharedRegion {
    /// Create, size, zero, and map the backing file (host side).
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| alloc_err("create backing file", e))?;
        file.set_len(len as u64)
            .map_err(|e| alloc_err("size backing file", e))?;

        // Safety: the file was just sized to `len`; the mapping is dropped
        // before the file handle.
        let mut map =
            unsafe { MmapMut::map_mut(&file) }.map_err(|e| alloc_err("map backing file", e))?;
        map.fill(0);

        Ok(Self {
            file,
            map,
            path: path.to_path_buf(),
            owned: true,
        })
    }

    /// Open and map an existing backing file (peer side).
    ///
    /// A missing file means the host never created the channel or already
    /// tore it down.
    pub fn open(path: &Path) -> Result<Self> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(ChannelError::ChannelClosed),
            Err(e) => return Err(alloc_err("open backing file", e)),
        };

        // Safety: mapping an existing file; the header is validated by the
        // channel before any typed access.
        let map =
            unsafe { MmapMut::map_mut(&file) }.map_err(|e| alloc_err("map backing file", e))?;

        Ok(Self {
            file,
            map,
            path: path.to_path_buf(),
            owned: false,
        })
    }

    /// Resize the backing file and remap it (host side).
    ///
    /// On failure the prior mapping stays valid and untouched.
    pub fn resize(&mut self, len: usize) -> Result<()> {
        self.file
            .set_len(len as u64)
            .map_err(|e| alloc_err("resize backing file", e))?;
        // Safety: the file was just resized to `len`; the old mapping is
        // replaced only after the new one exists.
        let map = unsafe { MmapMut::map_mut(&self.file) }
            .map_err(|e| alloc_err("remap backing file", e))?;
        self.map = map;
        Ok(())
    }

    /// Refresh the mapping to the file's current size (peer side, after the
    /// host reallocated).
    pub fn remap(&mut self) -> Result<()> {
        // Safety: same file handle; the channel re-validates the header after
        // remapping.
        let map = unsafe { MmapMut::map_mut(&self.file) }
            .map_err(|e| alloc_err("remap backing file", e))?;
        self.map = map;
        Ok(())
    }

    /// Mapped length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when nothing is mapped.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Whether this side owns the backing file's lifetime.
    #[inline]
    pub fn is_owner(&self) -> bool {
        self.owned
    }

    /// Path of the backing file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The mapped bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    /// The mapped bytes, mutably.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// Base pointer of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if self.owned {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.shm");

        let mut host = SharedRegion::create(&path, 256).unwrap();
        assert_eq!(host.len(), 256);
        assert!(host.is_owner());
        assert!(host.as_slice().iter().all(|&b| b == 0));

        host.as_mut_slice()[0] = 0xAB;

        let peer = SharedRegion::open(&path).unwrap();
        assert_eq!(peer.len(), 256);
        assert!(!peer.is_owner());
        assert_eq!(peer.as_slice()[0], 0xAB);
    }

    #[test]
    fn test_open_missing_is_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.shm");
        assert!(matches!(
            SharedRegion::open(&path),
            Err(ChannelError::ChannelClosed)
        ));
    }

    #[test]
    fn test_resize_and_peer_remap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.shm");

        let mut host = SharedRegion::create(&path, 128).unwrap();
        let mut peer = SharedRegion::open(&path).unwrap();

        host.resize(512).unwrap();
        assert_eq!(host.len(), 512);

        peer.remap().unwrap();
        assert_eq!(peer.len(), 512);
    }

    #[test]
    fn test_owner_drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.shm");

        {
            let _host = SharedRegion::create(&path, 64).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_peer_drop_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.shm");

        let _host = SharedRegion::create(&path, 64).unwrap();
        {
            let _peer = SharedRegion::open(&path).unwrap();
        }
        assert!(path.exists());
    }
}
