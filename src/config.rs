/// Tunables for a mounted volume.
///
/// The limits bound how far the engine will follow a cluster chain or scan a
/// directory before giving up. A corrupt FAT can contain cycles, so none of
/// the chain walks are allowed to be unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeConfig {
    /// Number of regular open-file slots. The root directory handle is extra.
    pub max_open_files: usize,

    /// Number of FAT sectors held in the cache window.
    pub fat_cache_sectors: u8,

    /// Highest number of clusters probed when looking for a free one.
    pub free_cluster_search_limit: u32,

    /// Maximum number of sector advances in a single `read` call.
    pub read_sector_limit: u32,

    /// Maximum number of clusters released when deleting a file.
    pub delete_chain_limit: u32,

    /// Maximum number of clusters released when truncating a file.
    pub truncate_chain_limit: u32,

    /// Maximum number of entries scanned in a cluster-chained directory while
    /// looking for a free slot, or for an entry to update.
    pub directory_scan_limit: u32,
}

impl VolumeConfig {
    pub const DEFAULT: Self = Self {
        max_open_files: 10,
        fat_cache_sectors: 5,
        free_cluster_search_limit: 0x1_0000,
        read_sector_limit: 1000,
        delete_chain_limit: 1000,
        truncate_chain_limit: 5000,
        directory_scan_limit: 0x1_0000,
    };
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
