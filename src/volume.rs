use crate::block::BlockDevice;
use crate::boot::VolumeGeometry;
use crate::chain::Storage;
use crate::config::VolumeConfig;
use crate::dialect::FatDialect;
use crate::error::{FatError, Result};
use crate::file::{FileHandle, FileTable, OpenFile, OpenStatus};
use crate::path::FilePath;

/// A mounted FAT volume, and the main point of interaction with the file
/// system.
#[derive(Debug)]
pub struct FatVolume<D> {
    pub(crate) storage: Storage<D>,
    pub(crate) files: FileTable,
}

impl<D: BlockDevice> FatVolume<D> {
    pub fn initialize(device: D) -> Result<Self> {
        Self::initialize_with(device, VolumeConfig::default())
    }

    pub fn initialize_with(mut device: D, config: VolumeConfig) -> Result<Self> {
        let geometry = VolumeGeometry::parse(&mut device)?;
        log::info!(
            "{:?} volume: {} data clusters of {} bytes",
            geometry.dialect,
            geometry.data_clusters,
            geometry.cluster_bytes()
        );

        let files = FileTable::new(OpenFile::root(&geometry), config.max_open_files);
        Ok(Self {
            storage: Storage::new(device, geometry, config),
            files,
        })
    }

    /// Opens a file or directory by path. Every component but the last must
    /// be a directory. An empty path, or `/`, is the root directory.
    pub fn open(&mut self, path: &str) -> Result<FileHandle> {
        self.open_path(&FilePath::parse(path))
    }

    pub(crate) fn open_path(&mut self, path: &FilePath) -> Result<FileHandle> {
        let mut current = FileHandle::ROOT;
        self.close(current);

        let last = path.components.len().saturating_sub(1);
        for (i, component) in path.components.iter().enumerate() {
            let child = self.open_child(current, component.as_str(), i < last);
            // Only the handle we hand back stays open, even on failure.
            if !current.is_root() {
                self.close(current);
            }
            current = child.map_err(|err| {
                log::debug!("open {path}: {component}: {err}");
                err
            })?;
        }
        Ok(current)
    }

    fn open_child(
        &mut self,
        dir: FileHandle,
        name: &str,
        must_be_directory: bool,
    ) -> Result<FileHandle> {
        let (entry, _) = self.find_entry(dir, name)?;
        if must_be_directory && !entry.is_directory() {
            return Err(FatError::NotADirectory);
        }
        self.open_entry(dir, &entry)
    }

    /// The first sector of this file couldn't be read when it was opened.
    pub fn is_degraded(&self, handle: FileHandle) -> Result<bool> {
        Ok(self.files.get(handle)?.status == OpenStatus::Degraded)
    }

    pub fn size(&self, handle: FileHandle) -> Result<u32> {
        Ok(self.files.get(handle)?.size)
    }

    pub fn position(&self, handle: FileHandle) -> Result<u32> {
        Ok(self.files.get(handle)?.position)
    }

    pub fn is_directory(&self, handle: FileHandle) -> Result<bool> {
        Ok(self.files.get(handle)?.is_directory)
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.storage.geometry
    }

    pub fn dialect(&self) -> FatDialect {
        self.storage.geometry.dialect
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.storage.config
    }

    /// Number of open handles, not counting the root.
    pub fn open_handles(&self) -> usize {
        self.files.open_count()
    }

    pub fn device(&self) -> &D {
        &self.storage.device
    }

    /// Unmounts the volume. Everything is written through, so there is
    /// nothing left to flush.
    pub fn into_device(self) -> D {
        self.storage.device
    }
}
