use crate::block::{BlockDevice, SectorBuffer};
use crate::boot::VolumeGeometry;
use crate::config::VolumeConfig;
use crate::error::{FatError, Result};
use crate::table::{FatCache, FatEntry};

/// The parts of a mounted volume that talk to the disk: the device itself,
/// the immutable geometry, and the FAT window. Split out from the open-file
/// table so both can be borrowed mutably at the same time.
#[derive(Debug)]
pub(crate) struct Storage<D> {
    pub(crate) device: D,
    pub(crate) geometry: VolumeGeometry,
    pub(crate) config: VolumeConfig,
    fat: FatCache,
}

impl<D: BlockDevice> Storage<D> {
    pub(crate) fn new(device: D, geometry: VolumeGeometry, config: VolumeConfig) -> Self {
        let fat = FatCache::new(config.fat_cache_sectors);
        Self {
            device,
            geometry,
            config,
            fat,
        }
    }

    pub(crate) fn read_sector(&mut self, lba: u32, buffer: &mut SectorBuffer) -> Result<()> {
        if self.device.read_sectors(lba, 1, buffer) {
            Ok(())
        } else {
            log::error!("failed to read sector {lba}");
            Err(FatError::ReadError { lba })
        }
    }

    pub(crate) fn write_sector(&mut self, lba: u32, buffer: &SectorBuffer) -> Result<()> {
        if self.device.write_sectors(lba, 1, buffer) {
            Ok(())
        } else {
            log::error!("failed to write sector {lba}");
            Err(FatError::WriteError { lba })
        }
    }

    /// Whether a cluster number maps into the data section. Anything else
    /// read out of a FAT or directory entry is corruption.
    pub(crate) fn is_data_cluster(&self, cluster: u32) -> bool {
        (2..=self.geometry.max_cluster()).contains(&cluster)
    }

    pub(crate) fn next_cluster(&mut self, cluster: u32) -> Result<FatEntry> {
        self.fat.entry(&mut self.device, &self.geometry, cluster)
    }

    fn set_entry(&mut self, cluster: u32, entry: FatEntry) -> Result<()> {
        self.fat
            .set_entry(&mut self.device, &self.geometry, cluster, entry)
    }

    /// Finds the lowest free cluster and marks it as the end of a (new)
    /// chain.
    pub(crate) fn allocate_free_cluster(&mut self) -> Result<u32> {
        let end = (self.geometry.max_cluster() + 1)
            .min(self.config.free_cluster_search_limit.saturating_add(2));
        for cluster in 2..end {
            if self.next_cluster(cluster)? == FatEntry::Free {
                self.set_entry(cluster, FatEntry::EndOfChain)?;
                log::debug!("allocated cluster {cluster}");
                return Ok(cluster);
            }
        }
        log::warn!("no free cluster among the first {} clusters", end - 2);
        Err(FatError::NoFreeCluster)
    }

    /// Allocates a cluster and links it after `tail`, which should be the
    /// last cluster of its chain.
    pub(crate) fn extend_chain(&mut self, tail: u32) -> Result<u32> {
        let cluster = self.allocate_free_cluster()?;
        if let Err(err) = self.set_entry(tail, FatEntry::Next(cluster)) {
            if let Err(free_err) = self.set_entry(cluster, FatEntry::Free) {
                log::error!("couldn't release cluster {cluster} after failed link: {free_err}");
            }
            return Err(err);
        }
        Ok(cluster)
    }

    /// Marks every cluster in the chain starting at `first` free, stopping
    /// after `cap` clusters. Returns how many were freed.
    pub(crate) fn free_chain(&mut self, first: u32, cap: u32) -> Result<u32> {
        let mut cluster = first;
        let mut freed = 0;
        while freed < cap {
            if !self.is_data_cluster(cluster) {
                log::warn!("chain from {first} points outside the data section: {cluster:#x}");
                break;
            }
            let next = self.next_cluster(cluster)?;
            if next == FatEntry::Free {
                log::warn!("chain from {first} runs into free cluster {cluster}");
                break;
            }
            self.set_entry(cluster, FatEntry::Free)?;
            freed += 1;
            match next {
                FatEntry::Next(next) => cluster = next,
                FatEntry::EndOfChain => return Ok(freed),
                other => {
                    log::warn!("chain from {first} ends in {other:?} after {freed} clusters");
                    return Ok(freed);
                }
            }
        }
        if freed == cap {
            log::warn!("stopped freeing chain from {first} after {cap} clusters");
        }
        Ok(freed)
    }

    /// Follows the chain one step, treating anything but a link to a valid
    /// data cluster as the end.
    pub(crate) fn follow(&mut self, cluster: u32) -> Result<Option<u32>> {
        match self.next_cluster(cluster)? {
            FatEntry::Next(next) if self.is_data_cluster(next) => Ok(Some(next)),
            FatEntry::EndOfChain => Ok(None),
            other => {
                log::warn!("cluster {cluster} has corrupt FAT entry {other:?}");
                Ok(None)
            }
        }
    }
}
