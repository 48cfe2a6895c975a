//! Block storage backends for the MSCP controller emulation.
//!
//! The controller speaks in 512-byte logical blocks (LBNs). This crate provides:
//!
//! - [`BlockDevice`]: the sector-oriented disk interface consumed by the controller
//! - [`MemDisk`]: an in-memory implementation used by tests and volatile drives
//!
//! Backends report whether the underlying media is write-locked; the controller
//! surfaces that as the hardware write-protect unit flag.

use thiserror::Error;

/// Logical block size in bytes. MSCP disks are always 512-byte formatted here.
pub const BLOCK_SIZE: usize = 512;

pub type Result<T> = std::result::Result<T, DiskError>;

/// Unified error type for backing-store operations.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("unaligned buffer length {len} (expected multiple of {alignment})")]
    UnalignedLength { len: usize, alignment: usize },

    #[error("out of bounds: lbn={lbn} blocks={blocks} capacity={capacity}")]
    OutOfBounds { lbn: u64, blocks: u64, capacity: u64 },

    #[error("integer overflow while computing block offsets")]
    OffsetOverflow,

    #[error("write to write-locked device")]
    WriteLocked,

    #[error("backend I/O error: {0}")]
    Io(String),
}

/// Sector-addressed block device.
///
/// `read_blocks`/`write_blocks` transfer whole 512-byte blocks; buffer lengths
/// must be block multiples. Implementations validate bounds before touching
/// any data so a failed call leaves the device unchanged.
pub trait BlockDevice: Send {
    /// Total capacity in 512-byte blocks.
    fn capacity_blocks(&self) -> u64;

    /// True if the media or backend refuses writes.
    fn write_locked(&self) -> bool;

    fn read_blocks(&mut self, lbn: u64, buf: &mut [u8]) -> Result<()>;
    fn write_blocks(&mut self, lbn: u64, buf: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

fn check_span(lbn: u64, len: usize, capacity: u64) -> Result<u64> {
    if !len.is_multiple_of(BLOCK_SIZE) {
        return Err(DiskError::UnalignedLength {
            len,
            alignment: BLOCK_SIZE,
        });
    }
    let blocks = (len / BLOCK_SIZE) as u64;
    let end = lbn.checked_add(blocks).ok_or(DiskError::OffsetOverflow)?;
    if end > capacity {
        return Err(DiskError::OutOfBounds {
            lbn,
            blocks,
            capacity,
        });
    }
    Ok(blocks)
}

/// Volatile in-memory disk.
pub struct MemDisk {
    data: Vec<u8>,
    write_locked: bool,
}

impl MemDisk {
    /// Create a zero-filled disk of `capacity_blocks` 512-byte blocks.
    pub fn new(capacity_blocks: u64) -> Self {
        Self {
            data: vec![0u8; capacity_blocks as usize * BLOCK_SIZE],
            write_locked: false,
        }
    }

    pub fn set_write_locked(&mut self, locked: bool) {
        self.write_locked = locked;
    }
}

impl BlockDevice for MemDisk {
    fn capacity_blocks(&self) -> u64 {
        (self.data.len() / BLOCK_SIZE) as u64
    }

    fn write_locked(&self) -> bool {
        self.write_locked
    }

    fn read_blocks(&mut self, lbn: u64, buf: &mut [u8]) -> Result<()> {
        check_span(lbn, buf.len(), self.capacity_blocks())?;
        let off = lbn as usize * BLOCK_SIZE;
        buf.copy_from_slice(&self.data[off..off + buf.len()]);
        Ok(())
    }

    fn write_blocks(&mut self, lbn: u64, buf: &[u8]) -> Result<()> {
        check_span(lbn, buf.len(), self.capacity_blocks())?;
        if self.write_locked {
            return Err(DiskError::WriteLocked);
        }
        let off = lbn as usize * BLOCK_SIZE;
        self.data[off..off + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

/// Wrapper that fails every I/O with [`DiskError::Io`]. Used by tests to
/// exercise the controller's drive-error reporting path.
pub struct FailingDisk {
    capacity_blocks: u64,
}

impl FailingDisk {
    pub fn new(capacity_blocks: u64) -> Self {
        Self { capacity_blocks }
    }
}

impl BlockDevice for FailingDisk {
    fn capacity_blocks(&self) -> u64 {
        self.capacity_blocks
    }

    fn write_locked(&self) -> bool {
        false
    }

    fn read_blocks(&mut self, _lbn: u64, _buf: &mut [u8]) -> Result<()> {
        Err(DiskError::Io("simulated media failure".into()))
    }

    fn write_blocks(&mut self, _lbn: u64, _buf: &[u8]) -> Result<()> {
        Err(DiskError::Io("simulated media failure".into()))
    }
}
