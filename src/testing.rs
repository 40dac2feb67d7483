//! Helpers for building small FAT images in memory, independently of the
//! engine's own write path.

use std::collections::HashMap;

use crate::block::{BlockDevice, MemoryDisk, SECTOR_SIZE};
use crate::boot::{BootSector, VolumeGeometry};
use crate::dialect::FatDialect;
use crate::directory::{Attributes, DirectoryEntry, ShortName, DIRECTORY_ENTRY_SIZE};
use crate::table::FatEntry;
use crate::volume::FatVolume;

use zerocopy::AsBytes;

/// Shape of a freshly formatted volume.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Preset {
    /// What the image should be detected as.
    pub(crate) dialect: FatDialect,
    pub(crate) total_sectors: u32,
    pub(crate) sectors_per_cluster: u8,
    pub(crate) reserved_sectors: u16,
    pub(crate) fat_count: u8,
    pub(crate) sectors_per_fat: u32,
    /// 0 on FAT32.
    pub(crate) root_entries: u16,
    pub(crate) media: u8,
}

/// 1.44 MB floppy.
pub(crate) const FAT12_FLOPPY: Preset = Preset {
    dialect: FatDialect::Fat12,
    total_sectors: 2880,
    sectors_per_cluster: 1,
    reserved_sectors: 1,
    fat_count: 2,
    sectors_per_fat: 9,
    root_entries: 224,
    media: 0xF0,
};

/// 4 MiB, just over the FAT16 cluster threshold.
pub(crate) const FAT16_SMALL: Preset = Preset {
    dialect: FatDialect::Fat16,
    total_sectors: 8192,
    sectors_per_cluster: 1,
    reserved_sectors: 1,
    fat_count: 2,
    sectors_per_fat: 32,
    root_entries: 512,
    media: 0xF8,
};

/// 8 MiB with two-sector clusters. Real FAT32 volumes are far bigger, but
/// nothing in the format requires it.
pub(crate) const FAT32_SMALL: Preset = Preset {
    dialect: FatDialect::Fat32,
    total_sectors: 16384,
    sectors_per_cluster: 2,
    reserved_sectors: 32,
    fat_count: 2,
    sectors_per_fat: 128,
    root_entries: 0,
    media: 0xF8,
};

const FAT32_ROOT_CLUSTER: u32 = 2;

#[derive(Debug, Clone, Copy)]
struct DirectorySlots {
    /// `None` for a fixed root directory.
    cluster: Option<u32>,
    used: usize,
}

/// Builds a formatted image, then lays out files and directories in order.
/// Paths are case-insensitive and parents must be added before children.
#[derive(Debug)]
pub(crate) struct ImageBuilder {
    preset: Preset,
    disk: MemoryDisk,
    next_cluster: u32,
    directories: HashMap<String, DirectorySlots>,
}

impl ImageBuilder {
    pub(crate) fn new(preset: Preset) -> Self {
        let mut builder = Self {
            preset,
            disk: MemoryDisk::new(preset.total_sectors as usize),
            next_cluster: 2,
            directories: HashMap::new(),
        };
        builder.write_boot_sector();

        let eoc = preset.dialect.params().end_of_chain_marker;
        builder.set_fat(0, 0x0FFF_FF00 | u32::from(preset.media));
        builder.set_fat(1, eoc);

        let root = if preset.dialect == FatDialect::Fat32 {
            builder.set_fat(FAT32_ROOT_CLUSTER, eoc);
            builder.next_cluster = FAT32_ROOT_CLUSTER + 1;
            Some(FAT32_ROOT_CLUSTER)
        } else {
            None
        };
        builder.directories.insert(
            String::new(),
            DirectorySlots {
                cluster: root,
                used: 0,
            },
        );
        builder
    }

    pub(crate) fn build(self) -> MemoryDisk {
        self.disk
    }

    pub(crate) fn file(mut self, path: &str, data: &[u8]) -> Self {
        let (parent, name) = split(path);
        let first = self.store(data);
        let size = data.len() as u32;
        let entry = DirectoryEntry::new(encode(name), Attributes::ARCHIVE, first, size);
        self.add_entry(&parent, &entry);
        self
    }

    /// A zero-length file with no clusters.
    pub(crate) fn empty_file(self, path: &str) -> Self {
        self.file(path, &[])
    }

    pub(crate) fn directory(mut self, path: &str) -> Self {
        let (parent, name) = split(path);
        let cluster = self.allocate(1);
        let parent_cluster = self.directories[&parent].cluster.filter(|_| !parent.is_empty());

        let dot = DirectoryEntry::new(ShortName::DOT, Attributes::DIRECTORY, cluster, 0);
        let dot_dot = DirectoryEntry::new(
            ShortName::DOT_DOT,
            Attributes::DIRECTORY,
            parent_cluster.unwrap_or(0),
            0,
        );
        let start = self.cluster_offset(cluster);
        self.disk.as_bytes_mut()[start..start + 32].copy_from_slice(dot.as_bytes());
        self.disk.as_bytes_mut()[start + 32..start + 64].copy_from_slice(dot_dot.as_bytes());

        let entry = DirectoryEntry::new(encode(name), Attributes::DIRECTORY, cluster, 0);
        self.add_entry(&parent, &entry);
        self.directories.insert(
            normalize(path),
            DirectorySlots {
                cluster: Some(cluster),
                used: 2,
            },
        );
        self
    }

    pub(crate) fn volume_label(mut self, label: &str) -> Self {
        let mut name = [b' '; 11];
        name[..label.len()].copy_from_slice(label.as_bytes());
        self.add_raw_entry("", name, Attributes::VOLUME_ID);
        self
    }

    /// A VFAT long name entry in the root. Only the attribute matters, the
    /// name bytes are taken as is.
    pub(crate) fn long_name_fragment(mut self, raw: &str) -> Self {
        let mut name = [0; 11];
        name.copy_from_slice(raw.as_bytes());
        self.add_raw_entry("", name, Attributes::LONG_NAME);
        self
    }

    /// An entry in the root that has been deleted.
    pub(crate) fn deleted_file(mut self, name: &str) -> Self {
        let mut raw = *encode(name).as_bytes();
        raw[0] = 0xE5;
        self.add_raw_entry("", raw, Attributes::ARCHIVE);
        self
    }

    fn write_boot_sector(&mut self) {
        let preset = self.preset;
        let fat32 = preset.dialect == FatDialect::Fat32;
        let sector = &mut self.disk.as_bytes_mut()[..SECTOR_SIZE];

        sector[..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
        sector[3..11].copy_from_slice(b"MSWIN4.1");
        sector[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
        sector[13] = preset.sectors_per_cluster;
        sector[14..16].copy_from_slice(&preset.reserved_sectors.to_le_bytes());
        sector[16] = preset.fat_count;
        sector[17..19].copy_from_slice(&preset.root_entries.to_le_bytes());
        if let Ok(total) = u16::try_from(preset.total_sectors) {
            sector[19..21].copy_from_slice(&total.to_le_bytes());
        } else {
            sector[32..36].copy_from_slice(&preset.total_sectors.to_le_bytes());
        }
        sector[21] = preset.media;
        sector[24..26].copy_from_slice(&63u16.to_le_bytes());
        sector[26..28].copy_from_slice(&16u16.to_le_bytes());

        let ebr = if fat32 {
            sector[36..40].copy_from_slice(&preset.sectors_per_fat.to_le_bytes());
            sector[44..48].copy_from_slice(&FAT32_ROOT_CLUSTER.to_le_bytes());
            sector[48..50].copy_from_slice(&1u16.to_le_bytes());
            sector[50..52].copy_from_slice(&6u16.to_le_bytes());
            64
        } else {
            sector[22..24].copy_from_slice(&(preset.sectors_per_fat as u16).to_le_bytes());
            36
        };
        sector[ebr] = 0x80;
        sector[ebr + 2] = 0x29;
        sector[ebr + 3..ebr + 7].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        sector[ebr + 7..ebr + 18].copy_from_slice(b"NO NAME    ");
        let system_id: &[u8; 8] = match preset.dialect {
            FatDialect::Fat12 => b"FAT12   ",
            FatDialect::Fat16 => b"FAT16   ",
            FatDialect::Fat32 => b"FAT32   ",
        };
        sector[ebr + 18..ebr + 26].copy_from_slice(system_id);

        sector[510] = 0x55;
        sector[511] = 0xAA;
    }

    fn fat_lba(&self) -> usize {
        usize::from(self.preset.reserved_sectors)
    }

    fn data_lba(&self) -> usize {
        let root_bytes = usize::from(self.preset.root_entries) * DIRECTORY_ENTRY_SIZE;
        let root_sectors = root_bytes / SECTOR_SIZE;
        self.fat_lba()
            + usize::from(self.preset.fat_count) * self.preset.sectors_per_fat as usize
            + root_sectors
    }

    fn cluster_bytes(&self) -> usize {
        usize::from(self.preset.sectors_per_cluster) * SECTOR_SIZE
    }

    fn cluster_offset(&self, cluster: u32) -> usize {
        (self.data_lba() + (cluster as usize - 2) * usize::from(self.preset.sectors_per_cluster))
            * SECTOR_SIZE
    }

    /// Writes a raw value into every FAT copy.
    fn set_fat(&mut self, cluster: u32, value: u32) {
        let preset = self.preset;
        let fat_bytes = preset.sectors_per_fat as usize * SECTOR_SIZE;
        let offset = preset.dialect.entry_offset(cluster) as usize;
        for copy in 0..usize::from(preset.fat_count) {
            let start = self.fat_lba() * SECTOR_SIZE + copy * fat_bytes + offset;
            let bytes = &mut self.disk.as_bytes_mut()[start..];
            match preset.dialect {
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
                FatDialect::Fat16 => bytes[..2].copy_from_slice(&(value as u16).to_le_bytes()),
                FatDialect::Fat32 => bytes[..4].copy_from_slice(&value.to_le_bytes()),
            }
        }
    }

    /// Hands out `count` consecutive clusters, chained together.
    fn allocate(&mut self, count: u32) -> u32 {
        let first = self.next_cluster;
        self.next_cluster += count;
        for cluster in first..first + count {
            let next = if cluster + 1 == first + count {
                self.preset.dialect.params().end_of_chain_marker
            } else {
                cluster + 1
            };
            self.set_fat(cluster, next);
        }
        first
    }

    fn store(&mut self, data: &[u8]) -> u32 {
        if data.is_empty() {
            return 0;
        }
        let count = data.len().div_ceil(self.cluster_bytes());
        let first = self.allocate(count as u32);
        let start = self.cluster_offset(first);
        self.disk.as_bytes_mut()[start..start + data.len()].copy_from_slice(data);
        first
    }

    fn add_entry(&mut self, parent: &str, entry: &DirectoryEntry) {
        let slots = self
            .directories
            .get_mut(parent)
            .unwrap_or_else(|| panic!("parent directory {parent:?} not added yet"));
        let index = slots.used;
        slots.used += 1;
        let cluster = slots.cluster;

        let start = match cluster {
            Some(cluster) => {
                assert!(index * DIRECTORY_ENTRY_SIZE < self.cluster_bytes(), "directory full");
                self.cluster_offset(cluster)
            }
            None => {
                assert!(index < usize::from(self.preset.root_entries), "root full");
                self.data_lba() * SECTOR_SIZE
                    - usize::from(self.preset.root_entries) * DIRECTORY_ENTRY_SIZE
            }
        };
        let offset = start + index * DIRECTORY_ENTRY_SIZE;
        self.disk.as_bytes_mut()[offset..offset + DIRECTORY_ENTRY_SIZE]
            .copy_from_slice(entry.as_bytes());
    }

    fn add_raw_entry(&mut self, parent: &str, name: [u8; 11], attributes: Attributes) {
        let mut raw = [0; DIRECTORY_ENTRY_SIZE];
        raw[..11].copy_from_slice(&name);
        raw[11] = attributes.bits();
        self.add_entry(parent, &DirectoryEntry::from_raw(&raw));
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_ascii_uppercase()
}

fn split(path: &str) -> (String, &str) {
    let path = path.trim_matches('/');
    match path.rsplit_once('/') {
        Some((parent, name)) => (normalize(parent), name),
        None => (String::new(), path),
    }
}

fn encode(name: &str) -> ShortName {
    ShortName::encode(name).unwrap()
}

/// Recognizable bytes that don't repeat on sector boundaries.
pub(crate) fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn geometry_of(disk: &MemoryDisk) -> VolumeGeometry {
    let mut sector = [0; SECTOR_SIZE];
    sector.copy_from_slice(&disk.as_bytes()[..SECTOR_SIZE]);
    VolumeGeometry::from_boot_sector(0, &BootSector::decode(&sector)).unwrap()
}

/// Reads a FAT entry straight out of the image's first FAT.
fn raw_fat_entry(disk: &MemoryDisk, geometry: &VolumeGeometry, cluster: u32) -> FatEntry {
    let offset = geometry.fat_lba as usize * SECTOR_SIZE
        + geometry.dialect.entry_offset(cluster) as usize;
    let bytes = &disk.as_bytes()[offset..];
    let raw = match geometry.dialect {
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
    FatEntry::from_raw(geometry.dialect, raw)
}

/// Clusters of the chain starting at `first`. Empty if `first` is free.
pub(crate) fn chain_of(disk: &MemoryDisk, first: u32) -> Vec<u32> {
    let geometry = geometry_of(disk);
    let mut chain = Vec::new();
    let mut cluster = first;
    while chain.len() <= geometry.data_clusters as usize {
        match raw_fat_entry(disk, &geometry, cluster) {
            FatEntry::Next(next) => {
                chain.push(cluster);
                cluster = next;
            }
            FatEntry::EndOfChain => {
                chain.push(cluster);
                break;
            }
            FatEntry::Free | FatEntry::Reserved | FatEntry::Bad => break,
        }
    }
    chain
}

/// Every entry of a fixed root directory, up to the end marker.
pub(crate) fn root_entries(disk: &MemoryDisk) -> Vec<DirectoryEntry> {
    let geometry = geometry_of(disk);
    let start = geometry.root_dir_lba as usize * SECTOR_SIZE;
    disk.as_bytes()[start..start + geometry.root_dir_sectors as usize * SECTOR_SIZE]
        .chunks_exact(DIRECTORY_ENTRY_SIZE)
        .map(|raw| DirectoryEntry::from_raw(raw.try_into().unwrap()))
        .take_while(|entry| !entry.is_end_marker())
        .collect()
}

/// Number of clusters the volume's FAT marks as in use.
pub(crate) fn used_clusters<D: BlockDevice>(volume: &mut FatVolume<D>) -> u32 {
    let max = volume.geometry().max_cluster();
    (2..=max)
        .filter(|&cluster| volume.storage.next_cluster(cluster).unwrap() != FatEntry::Free)
        .count() as u32
}

/// Wraps a disk and fails every transfer touching one sector.
#[derive(Debug)]
pub(crate) struct FlakyDisk {
    inner: MemoryDisk,
    bad_lba: u32,
    fail_reads: bool,
    fail_writes: bool,
}

impl FlakyDisk {
    /// Fails reads of `bad_lba`.
    pub(crate) fn new(inner: MemoryDisk, bad_lba: u32) -> Self {
        Self {
            inner,
            bad_lba,
            fail_reads: true,
            fail_writes: false,
        }
    }

    /// Fails writes of the bad sector instead of reads.
    pub(crate) fn failing_writes(mut self) -> Self {
        self.fail_reads = false;
        self.fail_writes = true;
        self
    }

    fn touches_bad_sector(&self, lba: u32, count: u8) -> bool {
        (lba..lba + u32::from(count)).contains(&self.bad_lba)
    }
}

impl BlockDevice for FlakyDisk {
    fn read_sectors(&mut self, lba: u32, count: u8, out: &mut [u8]) -> bool {
        if self.fail_reads && self.touches_bad_sector(lba, count) {
            return false;
        }
        self.inner.read_sectors(lba, count, out)
    }

    fn write_sectors(&mut self, lba: u32, count: u8, data: &[u8]) -> bool {
        if self.fail_writes && self.touches_bad_sector(lba, count) {
            return false;
        }
        self.inner.write_sectors(lba, count, data)
    }
}
