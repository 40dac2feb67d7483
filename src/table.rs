use alloc::vec;
use alloc::vec::Vec;

use crate::block::{BlockDevice, SECTOR_SIZE};
use crate::boot::VolumeGeometry;
use crate::dialect::FatDialect;
use crate::error::{FatError, Result};

/// Decoded value of a single FAT entry. The short dialects' end-of-chain
/// range is folded into one variant, so callers never compare against
/// dialect-specific markers themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatEntry {
    Free,
    /// Cluster 1's value. Never part of a chain.
    Reserved,
    Next(u32),
    Bad,
    EndOfChain,
}

impl FatEntry {
    pub fn from_raw(dialect: FatDialect, raw: u32) -> Self {
        let params = dialect.params();
        match raw & params.entry_mask {
            0 => Self::Free,
            1 => Self::Reserved,
            value if value >= params.end_of_chain_threshold => Self::EndOfChain,
            value if value == params.bad_cluster => Self::Bad,
            value => Self::Next(value),
        }
    }

    pub fn to_raw(self, dialect: FatDialect) -> u32 {
        let params = dialect.params();
        match self {
            Self::Free => 0,
            Self::Reserved => 1,
            Self::Next(cluster) => cluster & params.entry_mask,
            Self::Bad => params.bad_cluster,
            Self::EndOfChain => params.end_of_chain_marker,
        }
    }
}

/// A small window of consecutive FAT sectors.
///
/// Writes go straight through to every FAT copy on disk, so the window never
/// holds anything the disk doesn't.
#[derive(Debug)]
pub(crate) struct FatCache {
    /// Index (relative to the start of the FAT) of the first cached sector.
    /// `None` until the first load.
    first_sector: Option<u32>,
    loaded_sectors: u32,
    capacity: u32,
    data: Vec<u8>,
}

impl FatCache {
    pub(crate) fn new(capacity: u8) -> Self {
        // A FAT12 entry can straddle two sectors, so the window needs to be
        // able to hold both.
        let capacity = u32::from(capacity.max(2));
        Self {
            first_sector: None,
            loaded_sectors: 0,
            capacity,
            data: vec![0; capacity as usize * SECTOR_SIZE],
        }
    }

    #[cfg(test)]
    pub(crate) fn first_sector(&self) -> Option<u32> {
        self.first_sector
    }

    pub(crate) fn entry<D: BlockDevice>(
        &mut self,
        device: &mut D,
        geometry: &VolumeGeometry,
        cluster: u32,
    ) -> Result<FatEntry> {
        let dialect = geometry.dialect;
        let index = self.load_entry(device, geometry, cluster)?;
        let bytes = &self.data[index..];

        let raw = match dialect {
            FatDialect::Fat12 => {
                let pair = u32::from(u16::from_le_bytes([bytes[0], bytes[1]]));
                if cluster % 2 == 0 {
                    pair & 0x0FFF
                } else {
                    pair >> 4
                }
            }
            FatDialect::Fat16 => u32::from(u16::from_le_bytes([bytes[0], bytes[1]])),
            FatDialect::Fat32 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        };
        Ok(FatEntry::from_raw(dialect, raw))
    }

    pub(crate) fn set_entry<D: BlockDevice>(
        &mut self,
        device: &mut D,
        geometry: &VolumeGeometry,
        cluster: u32,
        entry: FatEntry,
    ) -> Result<()> {
        let dialect = geometry.dialect;
        let value = entry.to_raw(dialect);
        let index = self.load_entry(device, geometry, cluster)?;
        let bytes = &mut self.data[index..];

        match dialect {
            FatDialect::Fat12 => {
                let old = u16::from_le_bytes([bytes[0], bytes[1]]);
                let value = value as u16 & 0x0FFF;
                let new = if cluster % 2 == 0 {
                    (old & 0xF000) | value
                } else {
                    (old & 0x000F) | (value << 4)
                };
                bytes[..2].copy_from_slice(&new.to_le_bytes());
            }
            FatDialect::Fat16 => {
                bytes[..2].copy_from_slice(&(value as u16).to_le_bytes());
            }
            FatDialect::Fat32 => {
                // The top four bits are reserved and must be preserved.
                let old = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                let new = (old & 0xF000_0000) | (value & 0x0FFF_FFFF);
                bytes[..4].copy_from_slice(&new.to_le_bytes());
            }
        }

        let (first, last) = Self::entry_sectors(dialect, cluster);
        for sector in first..=last {
            if let Err(err) = self.flush_sector(device, geometry, sector) {
                // The window now holds a value the disk doesn't.
                self.first_sector = None;
                return Err(err);
            }
        }
        Ok(())
    }

    /// FAT sectors (relative to the FAT start) holding the first and last
    /// byte of a cluster's entry.
    fn entry_sectors(dialect: FatDialect, cluster: u32) -> (u32, u32) {
        let offset = dialect.entry_offset(cluster);
        let end = offset + dialect.entry_span() - 1;
        (offset / SECTOR_SIZE as u32, end / SECTOR_SIZE as u32)
    }

    /// Makes sure the cluster's entry is in the window, and returns the index
    /// of its first byte within `data`.
    fn load_entry<D: BlockDevice>(
        &mut self,
        device: &mut D,
        geometry: &VolumeGeometry,
        cluster: u32,
    ) -> Result<usize> {
        let dialect = geometry.dialect;
        let (first, last) = Self::entry_sectors(dialect, cluster);
        if last >= geometry.sectors_per_fat {
            log::error!(
                "cluster {cluster} has no entry in a FAT of {} sectors",
                geometry.sectors_per_fat
            );
            return Err(FatError::ReadError { lba: geometry.fat_lba + first });
        }

        let cached = self
            .first_sector
            .is_some_and(|start| first >= start && last < start + self.loaded_sectors);
        if !cached {
            self.reload(device, geometry, first, last - first + 1)?;
        }

        let start = self.first_sector.unwrap_or(first);
        Ok((dialect.entry_offset(cluster) - start * SECTOR_SIZE as u32) as usize)
    }

    fn reload<D: BlockDevice>(
        &mut self,
        device: &mut D,
        geometry: &VolumeGeometry,
        first: u32,
        needed: u32,
    ) -> Result<()> {
        let available = geometry.sectors_per_fat - first;
        let count = self.capacity.min(available).max(needed);
        let lba = geometry.fat_lba + first;

        // Invalidate first, in case the read leaves the buffer half filled.
        self.first_sector = None;
        let buffer = &mut self.data[..count as usize * SECTOR_SIZE];
        if !device.read_sectors(lba, count as u8, buffer) {
            log::error!("failed to load FAT sectors {first}..{}", first + count);
            return Err(FatError::ReadError { lba });
        }
        self.first_sector = Some(first);
        self.loaded_sectors = count;
        Ok(())
    }

    /// Writes one cached sector back to every copy of the FAT.
    fn flush_sector<D: BlockDevice>(
        &self,
        device: &mut D,
        geometry: &VolumeGeometry,
        sector: u32,
    ) -> Result<()> {
        let Some(start) = self.first_sector else {
            return Ok(());
        };
        let index = (sector - start) as usize * SECTOR_SIZE;
        let data = &self.data[index..index + SECTOR_SIZE];
        for copy in 0..u32::from(geometry.fat_count) {
            let lba = geometry.fat_lba + copy * geometry.sectors_per_fat + sector;
            if !device.write_sectors(lba, 1, data) {
                log::error!("failed to write FAT sector {sector} of copy {copy}");
                return Err(FatError::WriteError { lba });
            }
        }
        Ok(())
    }
}
