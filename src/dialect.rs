/// Which of the three FAT variants a volume uses. Derived once from the
/// geometry at mount time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatDialect {
    Fat12,
    Fat16,
    Fat32,
}

/// Where the root directory of a volume lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootLayout {
    /// A fixed run of sectors between the FATs and the data section.
    FixedRegion,
    /// An ordinary cluster chain, like any other directory.
    ClusterChain,
}

/// Per-dialect constants, so callers can look them up once instead of
/// matching on the dialect at every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialectParams {
    pub entry_bits: u32,
    /// Any entry value at or above this marks the end of a chain.
    pub end_of_chain_threshold: u32,
    /// The value we write when terminating a chain.
    pub end_of_chain_marker: u32,
    pub bad_cluster: u32,
    /// Bits of an entry that carry the cluster number.
    pub entry_mask: u32,
    pub root_layout: RootLayout,
}

impl FatDialect {
    /// Volumes with fewer data clusters than this are FAT12.
    pub const FAT12_MAX_CLUSTERS: u32 = 0xFF5;

    /// Classifies a volume. The cluster count depends on where the data
    /// section starts, so this can only run once that is known.
    ///
    /// FAT32 boot records always leave the legacy sectors-per-FAT field at 0,
    /// which is what tells FAT16 and FAT32 apart above the FAT12 threshold.
    pub fn detect(legacy_sectors_per_fat: u16, data_clusters: u32) -> Self {
        if data_clusters < Self::FAT12_MAX_CLUSTERS {
            Self::Fat12
        } else if legacy_sectors_per_fat != 0 {
            Self::Fat16
        } else {
            Self::Fat32
        }
    }

    pub const fn params(self) -> DialectParams {
        match self {
            Self::Fat12 => DialectParams {
                entry_bits: 12,
                end_of_chain_threshold: 0xFF8,
                end_of_chain_marker: 0xFFF,
                bad_cluster: 0xFF7,
                entry_mask: 0xFFF,
                root_layout: RootLayout::FixedRegion,
            },
            Self::Fat16 => DialectParams {
                entry_bits: 16,
                end_of_chain_threshold: 0xFFF8,
                end_of_chain_marker: 0xFFFF,
                bad_cluster: 0xFFF7,
                entry_mask: 0xFFFF,
                root_layout: RootLayout::FixedRegion,
            },
            Self::Fat32 => DialectParams {
                entry_bits: 32,
                end_of_chain_threshold: 0x0FFF_FFF8,
                end_of_chain_marker: 0x0FFF_FFFF,
                bad_cluster: 0x0FFF_FFF7,
                entry_mask: 0x0FFF_FFFF,
                root_layout: RootLayout::ClusterChain,
            },
        }
    }

    /// Byte offset of a cluster's entry from the start of the FAT.
    pub const fn entry_offset(self, cluster: u32) -> u32 {
        match self {
            Self::Fat12 => cluster + cluster / 2,
            Self::Fat16 => cluster * 2,
            Self::Fat32 => cluster * 4,
        }
    }

    /// Number of bytes an entry touches in the table. FAT12 entries are a
    /// byte and a half, so we always read and write two bytes.
    pub const fn entry_span(self) -> u32 {
        match self {
            Self::Fat12 | Self::Fat16 => 2,
            Self::Fat32 => 4,
        }
    }
}
