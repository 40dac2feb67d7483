use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::block::{BlockDevice, SectorBuffer, SECTOR_SIZE};
use crate::dialect::FatDialect;
use crate::directory::DIRECTORY_ENTRY_SIZE;
use crate::error::{FatError, Result};

pub(crate) type Le16 = U16<LittleEndian>;
pub(crate) type Le32 = U32<LittleEndian>;

/// The BIOS parameter block is the first part of the boot sector. It is
/// identical for every FAT dialect.
#[derive(Debug, Clone, FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub(crate) struct BiosParameterBlock {
    pub(crate) jmp_boot: [u8; 3],
    pub(crate) oem_name: [u8; 8],
    pub(crate) bytes_per_sector: Le16,
    pub(crate) sectors_per_cluster: u8,
    pub(crate) reserved_sectors: Le16,
    pub(crate) fat_count: u8,
    pub(crate) root_dir_entries: Le16,
    pub(crate) total_sectors_16: Le16,
    pub(crate) media_descriptor: u8,
    pub(crate) sectors_per_fat_16: Le16,
    pub(crate) sectors_per_track: Le16,
    pub(crate) head_count: Le16,
    pub(crate) hidden_sectors: Le32,
    pub(crate) total_sectors_32: Le32,
}

impl BiosParameterBlock {
    pub(crate) const SIZE: usize = core::mem::size_of::<Self>();
}

/// Extended boot record that follows the BPB on FAT12 and FAT16 volumes. On
/// FAT32 the same fields come after [`Fat32ExtendedBootRecord`].
#[derive(Debug, Clone, FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub(crate) struct ExtendedBootRecord {
    pub(crate) drive_number: u8,
    pub(crate) _reserved: u8,
    pub(crate) signature: u8,
    /// Serial number, value doesn't matter.
    pub(crate) volume_id: Le32,
    /// Padded with spaces.
    pub(crate) volume_label: [u8; 11],
    pub(crate) system_id: [u8; 8],
}

#[derive(Debug, Clone, FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub(crate) struct Fat32ExtendedBootRecord {
    pub(crate) sectors_per_fat_32: Le32,
    pub(crate) flags: Le16,
    pub(crate) version: Le16,
    pub(crate) root_cluster: Le32,
    pub(crate) fs_info_sector: Le16,
    pub(crate) backup_boot_sector: Le16,
    pub(crate) _reserved: [u8; 12],
    pub(crate) ebr: ExtendedBootRecord,
}

/// Decoded sector 0 of a FAT volume. Both extended record layouts are decoded;
/// which one is meaningful depends on the legacy sectors-per-FAT field.
#[derive(Debug, Clone)]
pub struct BootSector {
    pub(crate) bpb: BiosParameterBlock,
    pub(crate) ebr: ExtendedBootRecord,
    pub(crate) ebr32: Fat32ExtendedBootRecord,
    pub(crate) signature: u16,
}

impl BootSector {
    pub(crate) const SIGNATURE: u16 = 0xAA55;

    /// Sectors we look at for a boot sector. Some media put the volume a
    /// little after where the partition table claims it starts.
    const PROBE_OFFSETS: [u32; 3] = [0, 16, 32];

    pub(crate) fn decode(sector: &SectorBuffer) -> Self {
        // None of these can fail: the structs are unaligned and much smaller
        // than a sector.
        let bpb = BiosParameterBlock::read_from_prefix(sector.as_slice())
            .unwrap_or_else(BiosParameterBlock::new_zeroed);
        let tail = &sector[BiosParameterBlock::SIZE..];
        let ebr = ExtendedBootRecord::read_from_prefix(tail)
            .unwrap_or_else(ExtendedBootRecord::new_zeroed);
        let ebr32 = Fat32ExtendedBootRecord::read_from_prefix(tail)
            .unwrap_or_else(Fat32ExtendedBootRecord::new_zeroed);
        let signature = u16::from_le_bytes([sector[SECTOR_SIZE - 2], sector[SECTOR_SIZE - 1]]);
        Self {
            bpb,
            ebr,
            ebr32,
            signature,
        }
    }

    /// Either the 0xAA55 trailer is there, or the sector starts with a short
    /// or near jump like every boot sector does.
    pub(crate) fn looks_valid(&self) -> bool {
        self.signature == Self::SIGNATURE || matches!(self.bpb.jmp_boot[0], 0xEB | 0xE9)
    }

    /// Finds the boot sector on the device, returning the LBA the volume
    /// starts at along with the decoded sector. Falls back to sector 0 when
    /// nothing looks like a boot sector, and lets geometry validation decide.
    pub(crate) fn probe<D: BlockDevice>(device: &mut D) -> Result<(u32, Self)> {
        let mut sector = [0; SECTOR_SIZE];
        for offset in Self::PROBE_OFFSETS {
            if !device.read_sectors(offset, 1, &mut sector) {
                continue;
            }
            let boot = Self::decode(&sector);
            if boot.looks_valid() {
                if offset != 0 {
                    log::warn!("found FAT boot sector at offset {offset}, not at sector 0");
                }
                return Ok((offset, boot));
            }
        }

        log::warn!("no boot sector signature found, falling back to sector 0");
        if !device.read_sectors(0, 1, &mut sector) {
            return Err(FatError::ReadError { lba: 0 });
        }
        Ok((0, Self::decode(&sector)))
    }

    /// Finds and decodes the boot sector of a device, without validating it.
    pub fn read<D: BlockDevice>(device: &mut D) -> Result<Self> {
        Self::probe(device).map(|(_, boot)| boot)
    }

    /// Volume label from the extended boot record, for display.
    pub fn volume_label(&self) -> &[u8; 11] {
        if self.bpb.sectors_per_fat_16.get() == 0 {
            &self.ebr32.ebr.volume_label
        } else {
            &self.ebr.volume_label
        }
    }

    pub fn oem_name(&self) -> &[u8; 8] {
        &self.bpb.oem_name
    }
}

/// Everything we need to know about the layout of a volume. Immutable after
/// mounting. All `*_lba` fields are absolute LBAs on the block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeGeometry {
    /// Where the boot sector was found.
    pub volume_start: u32,
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    /// 0 on FAT32.
    pub root_entry_count: u16,
    pub total_sectors: u32,
    /// The sectors-per-FAT field of the BPB itself. 0 means the real count
    /// is in the FAT32 extended record.
    pub legacy_sectors_per_fat: u16,
    pub sectors_per_fat: u32,
    /// Only meaningful on FAT32.
    pub root_cluster: u32,

    pub fat_lba: u32,
    /// Fixed root directory region. Both are 0 on FAT32.
    pub root_dir_lba: u32,
    pub root_dir_sectors: u32,
    pub data_lba: u32,
    pub data_clusters: u32,
    pub dialect: FatDialect,
}

impl VolumeGeometry {
    /// Reads and validates the boot sector of a volume.
    pub fn parse<D: BlockDevice>(device: &mut D) -> Result<Self> {
        let (volume_start, boot) = BootSector::probe(device)?;
        Self::from_boot_sector(volume_start, &boot)
    }

    pub(crate) fn from_boot_sector(volume_start: u32, boot: &BootSector) -> Result<Self> {
        let bpb = &boot.bpb;
        let bytes_per_sector = bpb.bytes_per_sector.get();
        let sectors_per_cluster = bpb.sectors_per_cluster;

        // Validate these up front so nothing later can divide by zero.
        if bytes_per_sector == 0 || sectors_per_cluster == 0 {
            log::error!(
                "invalid BPB: bytes_per_sector={}, sectors_per_cluster={}",
                bytes_per_sector,
                sectors_per_cluster
            );
            return Err(FatError::InvalidGeometry);
        }
        if usize::from(bytes_per_sector) != SECTOR_SIZE {
            log::error!("unsupported sector size {bytes_per_sector}");
            return Err(FatError::InvalidGeometry);
        }

        let reserved_sectors = bpb.reserved_sectors.get();
        let fat_count = bpb.fat_count;
        let root_entry_count = bpb.root_dir_entries.get();

        let total_sectors = match bpb.total_sectors_16.get() {
            0 => bpb.total_sectors_32.get(),
            n => u32::from(n),
        };

        let legacy_sectors_per_fat = bpb.sectors_per_fat_16.get();
        let (sectors_per_fat, root_cluster) = if legacy_sectors_per_fat == 0 {
            (
                boot.ebr32.sectors_per_fat_32.get(),
                boot.ebr32.root_cluster.get(),
            )
        } else {
            (u32::from(legacy_sectors_per_fat), 0)
        };

        if fat_count == 0 || sectors_per_fat == 0 {
            log::error!("invalid BPB: fat_count={fat_count}, sectors_per_fat={sectors_per_fat}");
            return Err(FatError::InvalidGeometry);
        }

        // Every region has to fit in a 32-bit LBA.
        let fat_lba = volume_start
            .checked_add(u32::from(reserved_sectors))
            .ok_or_else(|| region_overflow("reserved sectors"))?;
        let fats_end = sectors_per_fat
            .checked_mul(u32::from(fat_count))
            .and_then(|fat_sectors| fat_lba.checked_add(fat_sectors))
            .ok_or_else(|| region_overflow("FATs"))?;
        let (root_dir_lba, root_dir_sectors, data_lba) = if legacy_sectors_per_fat == 0 {
            (0, 0, fats_end)
        } else {
            let root_bytes = u32::from(root_entry_count) * DIRECTORY_ENTRY_SIZE as u32;
            let root_sectors = root_bytes.div_ceil(u32::from(bytes_per_sector));
            let data_lba = fats_end
                .checked_add(root_sectors)
                .ok_or_else(|| region_overflow("root directory"))?;
            (fats_end, root_sectors, data_lba)
        };

        let volume_end = volume_start
            .checked_add(total_sectors)
            .ok_or_else(|| region_overflow("volume"))?;
        if data_lba >= volume_end {
            log::error!("data section starts at {data_lba}, past end of volume {volume_end}");
            return Err(FatError::InvalidGeometry);
        }
        let mut data_clusters = (volume_end - data_lba) / u32::from(sectors_per_cluster);
        let dialect = FatDialect::detect(legacy_sectors_per_fat, data_clusters);

        // Clusters whose entries don't fit in the FAT can never be used.
        let fat_bits = u64::from(sectors_per_fat) * u64::from(bytes_per_sector) * 8;
        let fat_entries = fat_bits / u64::from(dialect.params().entry_bits);
        if fat_entries < u64::from(data_clusters) + 2 {
            let usable = fat_entries.saturating_sub(2) as u32;
            log::warn!("FAT only has room for {usable} of {data_clusters} data clusters");
            data_clusters = usable;
        }

        // A FAT32 record on a volume small enough to count as FAT12 would
        // need 12-bit entries with a clustered root. Nobody formats that.
        if legacy_sectors_per_fat == 0 && dialect != FatDialect::Fat32 {
            log::error!("FAT32 boot record but only {data_clusters} data clusters");
            return Err(FatError::InvalidGeometry);
        }
        if dialect == FatDialect::Fat32 && root_cluster < 2 {
            log::error!("invalid FAT32 root cluster {root_cluster}");
            return Err(FatError::InvalidGeometry);
        }

        let geometry = Self {
            volume_start,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            fat_count,
            root_entry_count,
            total_sectors,
            legacy_sectors_per_fat,
            sectors_per_fat,
            root_cluster,
            fat_lba,
            root_dir_lba,
            root_dir_sectors,
            data_lba,
            data_clusters,
            dialect,
        };
        log::debug!("mounted FAT volume: {geometry:?}");
        Ok(geometry)
    }

    pub fn cluster_bytes(&self) -> u32 {
        u32::from(self.sectors_per_cluster) * u32::from(self.bytes_per_sector)
    }

    /// Highest cluster number that maps into the data section.
    pub fn max_cluster(&self) -> u32 {
        self.data_clusters + 1
    }

    /// Clusters 0 and 1 are reserved, so the first data cluster is 2.
    pub fn cluster_to_lba(&self, cluster: u32) -> u32 {
        self.data_lba + (cluster - 2) * u32::from(self.sectors_per_cluster)
    }
}

fn region_overflow(region: &str) -> FatError {
    log::error!("invalid BPB: {region} region runs past the last addressable sector");
    FatError::InvalidGeometry
}
