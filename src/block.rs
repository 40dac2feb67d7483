use alloc::vec;
use alloc::vec::Vec;

/// Every block device we talk to uses 512 byte sectors.
pub const SECTOR_SIZE: usize = 512;

/// A single sector worth of bytes.
pub type SectorBuffer = [u8; SECTOR_SIZE];

/// Something that knows how to read and write sectors of the disk (or
/// partition) backing the filesystem. LBAs are relative to the start of the
/// device.
///
/// The engine never retries a failed call; a `false` return is surfaced to the
/// caller as a read or write error.
pub trait BlockDevice {
    /// Reads `count` sectors starting at `lba` into `out`, which must be at
    /// least `count * SECTOR_SIZE` bytes long.
    fn read_sectors(&mut self, lba: u32, count: u8, out: &mut [u8]) -> bool;

    /// Writes `count` sectors from `data` starting at `lba`.
    fn write_sectors(&mut self, lba: u32, count: u8, data: &[u8]) -> bool;
}

impl<D: BlockDevice + ?Sized> BlockDevice for &mut D {
    fn read_sectors(&mut self, lba: u32, count: u8, out: &mut [u8]) -> bool {
        (**self).read_sectors(lba, count, out)
    }

    fn write_sectors(&mut self, lba: u32, count: u8, data: &[u8]) -> bool {
        (**self).write_sectors(lba, count, data)
    }
}

/// A disk that lives entirely in memory. Handy for tests and for building
/// images on the host.
#[derive(Debug, Clone)]
pub struct MemoryDisk {
    data: Vec<u8>,
}

impl MemoryDisk {
    /// Creates a zero-filled disk with the given number of sectors.
    pub fn new(num_sectors: usize) -> Self {
        Self {
            data: vec![0; num_sectors * SECTOR_SIZE],
        }
    }

    /// Wraps an existing image. Trailing bytes that don't make up a whole
    /// sector are unreachable.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn num_sectors(&self) -> usize {
        self.data.len() / SECTOR_SIZE
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn byte_range(&self, lba: u32, count: u8) -> Option<core::ops::Range<usize>> {
        let start = (lba as usize).checked_mul(SECTOR_SIZE)?;
        let end = start.checked_add(usize::from(count) * SECTOR_SIZE)?;
        (end <= self.data.len()).then_some(start..end)
    }
}

impl BlockDevice for MemoryDisk {
    fn read_sectors(&mut self, lba: u32, count: u8, out: &mut [u8]) -> bool {
        let Some(range) = self.byte_range(lba, count) else {
            return false;
        };
        let Some(out) = out.get_mut(..range.len()) else {
            return false;
        };
        out.copy_from_slice(&self.data[range]);
        true
    }

    fn write_sectors(&mut self, lba: u32, count: u8, data: &[u8]) -> bool {
        let Some(range) = self.byte_range(lba, count) else {
            return false;
        };
        let Some(data) = data.get(..range.len()) else {
            return false;
        };
        self.data[range].copy_from_slice(data);
        true
    }
}
