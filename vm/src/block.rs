//! Sector-granular block devices, as consumed by the swap area.

use crate::sync::Mutex;
use alloc::{string::String, vec, vec::Vec};
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use kidneyos_shared::sizes::SECTOR_SIZE;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = SECTOR_SIZE as usize;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// Error type for block operations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockError {
    /// The sector is out of bounds (greater than the block size)
    SectorOutOfBounds,
    /// The buffer has an invalid size (not `BLOCK_SECTOR_SIZE`)
    BufferInvalid,
    /// Error reading from the disk
    ReadError,
    /// Error writing to the disk
    WriteError,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SectorOutOfBounds => write!(f, "sector out of bounds"),
            Self::BufferInvalid => write!(f, "invalid buffer size (not `BLOCK_SECTOR_SIZE`)"),
            Self::ReadError => write!(f, "error reading from the block device"),
            Self::WriteError => write!(f, "error writing to the block device"),
        }
    }
}

impl core::error::Error for BlockError {}

/// Interface to a block device driver.
///
/// Buffers are exactly [`BLOCK_SECTOR_SIZE`] bytes.
pub trait BlockDevice: Send + Sync {
    /// Name of the device, for diagnostics.
    fn name(&self) -> &str;
    /// The size of the block device in sectors.
    fn size(&self) -> BlockSector;
    /// Reads sector `sector` into `buf`.
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;
    /// Writes `buf` to sector `sector`. Returns after the device has acknowledged the data.
    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
}

/// A block device backed by kernel memory.
pub struct RamDisk {
    name: String,
    size: BlockSector,
    data: Mutex<Vec<u8>>,
    read_count: AtomicU32,
    write_count: AtomicU32,
}

impl RamDisk {
    pub fn new(name: &str, size: BlockSector) -> Self {
        Self {
            name: String::from(name),
            size,
            data: Mutex::new(vec![0; size as usize * BLOCK_SECTOR_SIZE]),
            read_count: AtomicU32::new(0),
            write_count: AtomicU32::new(0),
        }
    }

    /// Verifies that `sector` and `buf` describe a valid transfer.
    fn check(&self, sector: BlockSector, buf: &[u8]) -> Result<usize, BlockError> {
        if buf.len() != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        if sector >= self.size {
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(sector as usize * BLOCK_SECTOR_SIZE)
    }

    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u32 {
        self.write_count.load(Ordering::Relaxed)
    }
}

impl BlockDevice for RamDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> BlockSector {
        self.size
    }

    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let start = self.check(sector, buf)?;
        buf.copy_from_slice(&self.data.lock()[start..start + BLOCK_SECTOR_SIZE]);
        self.read_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let start = self.check(sector, buf)?;
        self.data.lock()[start..start + BLOCK_SECTOR_SIZE].copy_from_slice(buf);
        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl fmt::Display for RamDisk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "\"{}\": {:04} sectors, {:04} read, {:04} write",
            self.name,
            self.size,
            self.read_count(),
            self.write_count()
        )
    }
}
