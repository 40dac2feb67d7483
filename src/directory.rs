use core::fmt;

use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::block::BlockDevice;
use crate::boot::{Le16, Le32};
use crate::chain::Storage;
use crate::error::{FatError, Result};
use crate::file::{DirectoryRef, FileHandle, Layout, OpenFile};
use crate::path::FilePath;
use crate::volume::FatVolume;

pub(crate) const DIRECTORY_ENTRY_SIZE: usize = core::mem::size_of::<DirectoryEntry>();

/// On-disk directory entry. Timestamps are carried along untouched.
///
/// See <https://wiki.osdev.org/FAT#Standard_8.3_format>
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct DirectoryEntry {
    name: [u8; 11],
    attributes: u8,
    _reserved: u8,
    creation_time_tenths: u8,
    creation_time: Le16,
    creation_date: Le16,
    access_date: Le16,
    first_cluster_high: Le16,
    modified_time: Le16,
    modified_date: Le16,
    first_cluster_low: Le16,
    size: Le32,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;

        /// Marks a VFAT long file name fragment. We skip these.
        const LONG_NAME = Self::READ_ONLY.bits()
            | Self::HIDDEN.bits()
            | Self::SYSTEM.bits()
            | Self::VOLUME_ID.bits();
    }
}

impl DirectoryEntry {
    /// First name byte of the entry after the last one in use.
    const END_MARKER: u8 = 0x00;

    /// First name byte of a deleted entry.
    const TOMBSTONE: u8 = 0xE5;

    pub fn new(name: ShortName, attributes: Attributes, first_cluster: u32, size: u32) -> Self {
        let mut entry = Self::new_zeroed();
        entry.name = name.0;
        entry.attributes = attributes.bits();
        entry.set_first_cluster(first_cluster);
        entry.set_size(size);
        entry
    }

    pub(crate) fn from_raw(bytes: &[u8; DIRECTORY_ENTRY_SIZE]) -> Self {
        Self::read_from(bytes.as_slice()).unwrap_or_else(Self::new_zeroed)
    }

    pub fn name(&self) -> ShortName {
        ShortName(self.name)
    }

    pub fn attributes(&self) -> Attributes {
        Attributes::from_bits_retain(self.attributes)
    }

    pub fn first_cluster(&self) -> u32 {
        (u32::from(self.first_cluster_high.get()) << 16) | u32::from(self.first_cluster_low.get())
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.first_cluster_high.set((cluster >> 16) as u16);
        self.first_cluster_low.set(cluster as u16);
    }

    pub fn size(&self) -> u32 {
        self.size.get()
    }

    pub fn set_size(&mut self, size: u32) {
        self.size.set(size);
    }

    pub fn is_directory(&self) -> bool {
        self.attributes().contains(Attributes::DIRECTORY)
    }

    pub fn is_long_name(&self) -> bool {
        self.attributes().contains(Attributes::LONG_NAME)
    }

    pub fn is_volume_label(&self) -> bool {
        !self.is_long_name() && self.attributes().contains(Attributes::VOLUME_ID)
    }

    /// This entry and every one after it is unused.
    pub fn is_end_marker(&self) -> bool {
        self.name[0] == Self::END_MARKER
    }

    pub fn is_deleted(&self) -> bool {
        self.name[0] == Self::TOMBSTONE
    }

    /// Whether the entry names a file or directory, as opposed to a free
    /// slot, a long name fragment, or the volume label.
    pub fn is_visible(&self) -> bool {
        !self.is_end_marker()
            && !self.is_deleted()
            && !self.is_long_name()
            && !self.is_volume_label()
    }

    pub(crate) fn tombstone(&mut self) {
        self.name[0] = Self::TOMBSTONE;
    }
}

/// An 8.3 name as stored on disk: an 8 byte base and a 3 byte extension,
/// upper case and padded with spaces.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortName([u8; 11]);

impl ShortName {
    pub const DOT: Self = Self(*b".          ");
    pub const DOT_DOT: Self = Self(*b"..         ");

    /// Encodes a single path component. Anything past 8 characters of the
    /// base or 3 of the extension is dropped.
    pub fn encode(name: &str) -> Result<Self> {
        match name {
            "." => return Ok(Self::DOT),
            ".." => return Ok(Self::DOT_DOT),
            _ => {}
        }
        if !name.is_ascii() {
            return Err(FatError::InvalidName);
        }

        let (base, extension) = name.split_once('.').unwrap_or((name, ""));
        if base.is_empty() {
            return Err(FatError::InvalidName);
        }

        let mut bytes = [b' '; 11];
        for (dst, src) in bytes[..8].iter_mut().zip(base.bytes()) {
            *dst = src.to_ascii_uppercase();
        }
        for (dst, src) in bytes[8..].iter_mut().zip(extension.bytes()) {
            *dst = src.to_ascii_uppercase();
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 11] {
        &self.0
    }

    pub fn is_dot_entry(&self) -> bool {
        *self == Self::DOT || *self == Self::DOT_DOT
    }

    fn base(&self) -> &[u8] {
        trim_padding(&self.0[..8])
    }

    fn extension(&self) -> &[u8] {
        trim_padding(&self.0[8..])
    }
}

fn trim_padding(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
    &bytes[..end]
}

impl fmt::Display for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.base() {
            write!(f, "{}", b as char)?;
        }
        let extension = self.extension();
        if !extension.is_empty() {
            write!(f, ".")?;
            for &b in extension {
                write!(f, "{}", b as char)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortName({self})")
    }
}

impl<D: BlockDevice> Storage<D> {
    /// Rewrites the size and first cluster of the entry called `name`,
    /// scanning `dir` from the start. A `size` of `None` leaves it alone.
    fn patch_entry(
        &mut self,
        dir: &mut OpenFile,
        name: &ShortName,
        size: Option<u32>,
        first_cluster: u32,
    ) -> Result<()> {
        let limit = match dir.layout {
            Layout::Fixed { .. } => u32::from(self.geometry.root_entry_count),
            Layout::Chain => self.config.directory_scan_limit,
        };
        dir.rewind();
        let mut raw = [0; DIRECTORY_ENTRY_SIZE];
        for _ in 0..limit {
            if dir.position >= dir.size || !self.prepare_sector(dir)? {
                break;
            }
            let offset = dir.sector_offset();
            raw.copy_from_slice(&dir.buffer[offset..offset + DIRECTORY_ENTRY_SIZE]);
            let mut entry = DirectoryEntry::from_raw(&raw);
            if entry.is_end_marker() {
                break;
            }
            if entry.is_visible() && entry.name == name.0 {
                entry.set_first_cluster(first_cluster);
                if let Some(size) = size {
                    entry.set_size(size);
                }
                dir.buffer[offset..offset + DIRECTORY_ENTRY_SIZE]
                    .copy_from_slice(entry.as_bytes());
                return self.flush(dir);
            }
            dir.consume(DIRECTORY_ENTRY_SIZE);
        }
        log::warn!("no entry for {name} left to update");
        Err(FatError::NotFound)
    }
}

impl<D: BlockDevice> FatVolume<D> {
    /// Reads the next 32 byte entry of a directory. Returns `None` once the
    /// directory (or its cluster chain) runs out.
    ///
    /// Every slot is returned, including free ones and long name fragments;
    /// see [`DirectoryEntry::is_visible`].
    pub fn read_entry(&mut self, dir: FileHandle) -> Result<Option<DirectoryEntry>> {
        let mut raw = [0; DIRECTORY_ENTRY_SIZE];
        let read = self.read(dir, &mut raw)?;
        if read < DIRECTORY_ENTRY_SIZE {
            return Ok(None);
        }
        Ok(Some(DirectoryEntry::from_raw(&raw)))
    }

    /// Looks up a name in a directory, returning the entry along with its
    /// byte offset in the directory.
    pub fn find_entry(&mut self, dir: FileHandle, name: &str) -> Result<(DirectoryEntry, u32)> {
        let name = ShortName::encode(name)?;
        self.find_short_name(dir, &name)
    }

    pub(crate) fn find_short_name(
        &mut self,
        dir: FileHandle,
        name: &ShortName,
    ) -> Result<(DirectoryEntry, u32)> {
        self.seek(dir, 0)?;
        while let Some(entry) = self.read_entry(dir)? {
            if entry.is_end_marker() {
                break;
            }
            if entry.is_visible() && entry.name == name.0 {
                let offset = self.position(dir)? - DIRECTORY_ENTRY_SIZE as u32;
                return Ok((entry, offset));
            }
        }
        Err(FatError::NotFound)
    }

    /// Writes an entry at the directory's current position, and moves the
    /// position past it.
    pub(crate) fn write_entry(&mut self, dir: FileHandle, entry: &DirectoryEntry) -> Result<()> {
        let file = self.files.get_mut(dir)?;
        if !self.storage.prepare_sector(file)? {
            return Err(FatError::NoDirectorySpace);
        }

        let offset = file.sector_offset();
        file.buffer[offset..offset + DIRECTORY_ENTRY_SIZE].copy_from_slice(entry.as_bytes());
        self.storage.flush(file)?;
        file.consume(DIRECTORY_ENTRY_SIZE);
        Ok(())
    }

    /// Opens the file or directory an entry of `dir` describes.
    ///
    /// If the first sector can't be read, the handle is still handed out but
    /// is degraded: it reports a size of 0. See [`FatVolume::is_degraded`].
    pub fn open_entry(&mut self, dir: FileHandle, entry: &DirectoryEntry) -> Result<FileHandle> {
        // A `..` pointing at the root stores cluster 0.
        if entry.is_directory() && entry.first_cluster() == 0 {
            self.close(FileHandle::ROOT);
            return Ok(FileHandle::ROOT);
        }

        let parent = self.directory_ref(dir)?;
        let handle = self.files.insert(OpenFile::from_entry(entry, parent))?;
        self.load_first_sector(handle)?;
        Ok(handle)
    }

    pub(crate) fn directory_ref(&self, dir: FileHandle) -> Result<DirectoryRef> {
        if dir.is_root() {
            return Ok(DirectoryRef::Root);
        }
        Ok(self
            .files
            .get(dir)?
            .first_cluster
            .map_or(DirectoryRef::Root, DirectoryRef::Cluster))
    }

    fn load_first_sector(&mut self, handle: FileHandle) -> Result<()> {
        let file = self.files.get_mut(handle)?;
        let result = match file.first_cluster {
            Some(cluster) if !self.storage.is_data_cluster(cluster) => {
                log::warn!("{} starts at invalid cluster {cluster:#x}", file.name);
                Err(FatError::ReadError { lba: 0 })
            }
            Some(_) => self.storage.load(file).map(|_| ()),
            None => Ok(()),
        };
        if let Err(err) = result {
            log::warn!("opening {} degraded: {err}", file.name);
            file.degrade();
        }
        Ok(())
    }

    /// Creates an empty file. The path may name a file in a subdirectory,
    /// which must already exist.
    pub fn create(&mut self, path: &str) -> Result<FileHandle> {
        let (dir, name) = self.open_parent(path)?;
        let result = self.create_in(dir, name);
        self.close(dir);
        result
    }

    fn create_in(&mut self, dir: FileHandle, name: ShortName) -> Result<FileHandle> {
        if name.is_dot_entry() {
            return Err(FatError::InvalidName);
        }
        match self.find_short_name(dir, &name) {
            Ok(_) => return Err(FatError::AlreadyExists),
            Err(FatError::NotFound) => {}
            Err(err) => return Err(err),
        }
        if !self.files.has_free_slot() {
            return Err(FatError::OutOfHandles);
        }

        let cluster = self.storage.allocate_free_cluster()?;
        let entry = DirectoryEntry::new(name, Attributes::ARCHIVE, cluster, 0);
        if let Err(err) = self.place_entry(dir, &entry) {
            if let Err(free_err) = self.storage.free_chain(cluster, 1) {
                log::error!("couldn't release cluster {cluster} after failed create: {free_err}");
            }
            return Err(err);
        }
        log::debug!("created {name} at cluster {cluster}");
        self.open_entry(dir, &entry)
    }

    /// Writes a new entry into the first free slot of a directory.
    fn place_entry(&mut self, dir: FileHandle, entry: &DirectoryEntry) -> Result<()> {
        let offset = self.find_free_slot(dir)?;
        self.seek(dir, offset)?;
        self.write_entry(dir, entry)
    }

    fn find_free_slot(&mut self, dir: FileHandle) -> Result<u32> {
        let limit = match self.files.get(dir)?.layout {
            Layout::Fixed { .. } => u32::from(self.storage.geometry.root_entry_count),
            Layout::Chain => self.storage.config.directory_scan_limit,
        };

        self.seek(dir, 0)?;
        for _ in 0..limit {
            let Some(entry) = self.read_entry(dir)? else {
                break;
            };
            if entry.is_end_marker() || entry.is_deleted() {
                return Ok(self.position(dir)? - DIRECTORY_ENTRY_SIZE as u32);
            }
        }
        Err(FatError::NoDirectorySpace)
    }

    /// Deletes a file, or a directory along with everything in it.
    pub fn delete(&mut self, path: &str) -> Result<()> {
        let (dir, name) = self.open_parent(path)?;
        let result = self.delete_in(dir, &name);
        self.close(dir);
        result
    }

    fn delete_in(&mut self, dir: FileHandle, name: &ShortName) -> Result<()> {
        if name.is_dot_entry() {
            return Err(FatError::InvalidName);
        }
        let (mut entry, offset) = self.find_short_name(dir, name)?;
        let first = entry.first_cluster();

        if entry.is_directory() {
            if first == 0 {
                log::warn!("directory {name} has no clusters, not descending");
            } else {
                let child = self.open_entry(dir, &entry)?;
                let result = self.delete_children(child);
                self.close(child);
                result?;
            }
        }

        if first != 0 {
            let cap = self.storage.config.delete_chain_limit;
            self.storage.free_chain(first, cap)?;
        }
        entry.tombstone();
        self.seek(dir, offset)?;
        self.write_entry(dir, &entry)?;
        log::debug!("deleted {name}");
        Ok(())
    }

    /// Deletes everything in a directory but `.` and `..`. Each level of
    /// nesting holds one handle, so the depth is bounded by the table size.
    fn delete_children(&mut self, dir: FileHandle) -> Result<()> {
        if self.is_degraded(dir)? {
            let lba = self.files.get(dir)?.first_cluster.map_or(0, |cluster| {
                self.storage.geometry.cluster_to_lba(cluster)
            });
            return Err(FatError::ReadError { lba });
        }
        while let Some(name) = self.next_child(dir)? {
            self.delete_in(dir, &name)?;
        }
        Ok(())
    }

    fn next_child(&mut self, dir: FileHandle) -> Result<Option<ShortName>> {
        self.seek(dir, 0)?;
        while let Some(entry) = self.read_entry(dir)? {
            if entry.is_end_marker() {
                break;
            }
            if entry.is_visible() && !entry.name().is_dot_entry() {
                return Ok(Some(entry.name()));
            }
        }
        Ok(None)
    }

    /// Writes a file's size and first cluster back to its directory entry.
    /// Needed after writing or truncating.
    pub fn update_entry(&mut self, handle: FileHandle) -> Result<()> {
        if handle.is_root() {
            return Err(FatError::NotFound);
        }
        let file = self.files.get(handle)?;
        let name = file.name;
        let size = (!file.is_directory).then_some(file.size);
        let first_cluster = file.first_cluster.unwrap_or(0);
        let parent = file.parent.unwrap_or(DirectoryRef::Root);

        // The parent is scanned through a scratch cursor rather than a table
        // slot, so this works even with every handle in use.
        match parent {
            DirectoryRef::Root => {
                let root = &mut self.files.root;
                let result = self.storage.patch_entry(root, &name, size, first_cluster);
                root.rewind();
                result
            }
            DirectoryRef::Cluster(cluster) => {
                if !self.storage.is_data_cluster(cluster) {
                    log::warn!("{name}: parent directory at invalid cluster {cluster:#x}");
                    return Err(FatError::NotFound);
                }
                let mut dir = OpenFile::directory(cluster);
                self.storage.patch_entry(&mut dir, &name, size, first_cluster)
            }
        }
    }

    /// Opens the directory holding the last component of `path`, and encodes
    /// that component.
    fn open_parent(&mut self, path: &str) -> Result<(FileHandle, ShortName)> {
        let path = FilePath::parse(path);
        let (parent, name) = path.split_dirname_filename().ok_or(FatError::InvalidName)?;
        let name = ShortName::encode(name.as_str())?;

        let dir = self.open_path(&parent)?;
        if !self.is_directory(dir)? {
            self.close(dir);
            return Err(FatError::NotADirectory);
        }
        Ok((dir, name))
    }
}
