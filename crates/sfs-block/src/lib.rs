#![forbid(unsafe_code)]
//! Block I/O layer for SnapFS.
//!
//! Provides the `BlockDevice` trait, owned `BlockBuf` buffers, a
//! file-backed device using pread/pwrite style I/O, an in-memory device
//! for tests and scenarios, and tracked-read leases used to drain
//! outstanding device reads before a COW copy is published.

use parking_lot::Mutex;
use sfs_error::{Result, SfsError};
use sfs_types::{BlockNr, BlockSize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

// ── Block buffer ────────────────────────────────────────────────────────────

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
/// Cloning is cheap; mutation copies on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Arc<Vec<u8>>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }

    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: Arc::new(vec![0u8; len]),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn make_mut(&mut self) -> &mut Vec<u8> {
        Arc::make_mut(&mut self.bytes)
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        match Arc::try_unwrap(self.bytes) {
            Ok(bytes) => bytes,
            Err(shared) => shared.as_slice().to_vec(),
        }
    }
}

// ── Block device trait ──────────────────────────────────────────────────────

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNr) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNr, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> BlockSize;

    /// Total number of blocks.
    fn block_count(&self) -> u32;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_block_bounds(dev: &dyn BlockDevice, block: BlockNr, len: usize) -> Result<()> {
    if block.0 >= dev.block_count() {
        return Err(SfsError::Format(format!(
            "block {} out of bounds (device has {} blocks)",
            block.0,
            dev.block_count()
        )));
    }
    if len != dev.block_size().as_usize() {
        return Err(SfsError::Format(format!(
            "buffer length {len} != block size {}",
            dev.block_size().get()
        )));
    }
    Ok(())
}

// ── File-backed device ──────────────────────────────────────────────────────

/// File-backed block device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not require a
/// shared seek position.
#[derive(Debug)]
pub struct FileBlockDevice {
    file: File,
    block_size: BlockSize,
    block_count: u32,
    writable: bool,
}

impl FileBlockDevice {
    pub fn open(path: impl AsRef<Path>, block_size: BlockSize) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        let block_count = u32::try_from(len / u64::from(block_size.get()))
            .map_err(|_| SfsError::Format("device too large for 32-bit block numbers".into()))?;
        Ok(Self {
            file,
            block_size,
            block_count,
            writable,
        })
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, block: BlockNr) -> Result<BlockBuf> {
        let mut buf = vec![0u8; self.block_size.as_usize()];
        check_block_bounds(self, block, buf.len())?;
        let offset = u64::from(block.0) * u64::from(self.block_size.get());
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNr, data: &[u8]) -> Result<()> {
        check_block_bounds(self, block, data.len())?;
        if !self.writable {
            return Err(SfsError::ReadOnly);
        }
        let offset = u64::from(block.0) * u64::from(self.block_size.get());
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

// ── In-memory device ────────────────────────────────────────────────────────

/// In-memory block device used by tests and the scenario suites.
///
/// Unwritten blocks read back as zeroes.
#[derive(Debug)]
pub struct MemBlockDevice {
    block_size: BlockSize,
    block_count: u32,
    blocks: Mutex<HashMap<u32, Vec<u8>>>,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_count: u32) -> Self {
        Self {
            block_size: BlockSize::PAGE,
            block_count,
            blocks: Mutex::new(HashMap::new()),
        }
    }

    /// Number of blocks that have ever been written.
    #[must_use]
    pub fn written_blocks(&self) -> usize {
        self.blocks.lock().len()
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockNr) -> Result<BlockBuf> {
        check_block_bounds(self, block, self.block_size.as_usize())?;
        let blocks = self.blocks.lock();
        match blocks.get(&block.0) {
            Some(data) => Ok(BlockBuf::new(data.clone())),
            None => Ok(BlockBuf::zeroed(self.block_size.as_usize())),
        }
    }

    fn write_block(&self, block: BlockNr, data: &[u8]) -> Result<()> {
        check_block_bounds(self, block, data.len())?;
        self.blocks.lock().insert(block.0, data.to_vec());
        Ok(())
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Tracked reads ───────────────────────────────────────────────────────────

/// Accounting for in-flight device reads of live blocks.
///
/// A snapshot-image read through to the block device takes a lease on
/// the source block; a COW of the same block must not publish its copy
/// while a lease is outstanding, or the reader could observe the block
/// mid-overwrite.
#[derive(Debug, Default)]
pub struct ReadTracker {
    counts: Mutex<HashMap<u32, u32>>,
}

impl ReadTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a lease on `block`. Released when the guard drops.
    #[must_use]
    pub fn track(self: &Arc<Self>, block: BlockNr) -> TrackedRead {
        *self.counts.lock().entry(block.0).or_insert(0) += 1;
        trace!(target: "sfs::block", block = block.0, "tracked read start");
        TrackedRead {
            tracker: Arc::clone(self),
            block,
        }
    }

    /// Number of outstanding leases on `block`.
    #[must_use]
    pub fn readers(&self, block: BlockNr) -> u32 {
        self.counts.lock().get(&block.0).copied().unwrap_or(0)
    }

    fn release(&self, block: BlockNr) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(&block.0) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&block.0);
            }
        }
        trace!(target: "sfs::block", block = block.0, "tracked read end");
    }
}

/// Lease handle returned by [`ReadTracker::track`].
#[derive(Debug)]
pub struct TrackedRead {
    tracker: Arc<ReadTracker>,
    block: BlockNr,
}

impl Drop for TrackedRead {
    fn drop(&mut self) {
        self.tracker.release(self.block);
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn mem_device_round_trip() {
        let dev = MemBlockDevice::new(16);
        let data = vec![0xABu8; 4096];
        dev.write_block(BlockNr(3), &data).unwrap();
        assert_eq!(dev.read_block(BlockNr(3)).unwrap().as_slice(), &data[..]);
        // Unwritten blocks read back zeroed.
        assert!(dev.read_block(BlockNr(4)).unwrap().as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn mem_device_rejects_out_of_bounds() {
        let dev = MemBlockDevice::new(4);
        assert!(dev.read_block(BlockNr(4)).is_err());
        assert!(dev.write_block(BlockNr(9), &[0u8; 4096]).is_err());
    }

    #[test]
    fn mem_device_rejects_short_write() {
        let dev = MemBlockDevice::new(4);
        assert!(dev.write_block(BlockNr(0), &[0u8; 512]).is_err());
    }

    #[test]
    fn file_device_round_trip() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; 8 * 4096]).unwrap();
        tmp.flush().unwrap();

        let dev = FileBlockDevice::open(tmp.path(), BlockSize::PAGE).unwrap();
        assert_eq!(dev.block_count(), 8);

        let data = vec![0x5Au8; 4096];
        dev.write_block(BlockNr(5), &data).unwrap();
        assert_eq!(dev.read_block(BlockNr(5)).unwrap().as_slice(), &data[..]);
    }

    #[test]
    fn block_buf_copy_on_write() {
        let a = BlockBuf::new(vec![1u8; 4096]);
        let mut b = a.clone();
        b.make_mut()[0] = 9;
        assert_eq!(a.as_slice()[0], 1);
        assert_eq!(b.as_slice()[0], 9);
    }

    #[test]
    fn tracked_reads_release_on_drop() {
        let tracker = Arc::new(ReadTracker::new());
        let block = BlockNr(7);
        assert_eq!(tracker.readers(block), 0);
        {
            let _a = tracker.track(block);
            let _b = tracker.track(block);
            assert_eq!(tracker.readers(block), 2);
        }
        assert_eq!(tracker.readers(block), 0);
    }
}
