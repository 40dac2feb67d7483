use alloc::vec::Vec;

use crate::block::{BlockDevice, SectorBuffer, SECTOR_SIZE};
use crate::boot::VolumeGeometry;
use crate::chain::Storage;
use crate::dialect::RootLayout;
use crate::directory::{DirectoryEntry, ShortName};
use crate::error::{FatError, Result};
use crate::table::FatEntry;
use crate::volume::FatVolume;

/// Size given to directories stored as cluster chains. Their entries carry no
/// size, so the real end is only found by running into the end of the chain.
pub(crate) const PROVISIONAL_DIRECTORY_SIZE: u32 = 0x100_0000;

/// Index into the open file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(usize);

impl FileHandle {
    /// The root directory is always open, and doesn't take up a slot.
    pub const ROOT: Self = Self(usize::MAX);

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

/// Where a file's sectors come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Layout {
    /// Follow the cluster chain from the first cluster.
    Chain,
    /// A fixed run of sectors, used for the FAT12/16 root directory.
    Fixed { start: u32, sectors: u32 },
}

/// The sector backing the file buffer. For [`Layout::Fixed`] only `sector`
/// matters, and counts from the start of the region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SectorCursor {
    pub(crate) cluster: u32,
    /// Sector within the cluster.
    pub(crate) sector: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferState {
    /// The cursor is right, but the buffer hasn't been read from disk.
    Unloaded,
    Loaded,
    /// Every byte of the cursor's sector has been consumed, and the position
    /// sits on the following sector boundary. The cursor only moves on when
    /// more bytes are needed, so a position at the very end of a chain never
    /// has to look past it.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenStatus {
    Ok,
    /// The first sector couldn't be read. The handle reads as empty.
    Degraded,
}

/// Identifies a directory by where its entries live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DirectoryRef {
    Root,
    Cluster(u32),
}

#[derive(Debug, Clone)]
pub(crate) struct OpenFile {
    pub(crate) name: ShortName,
    pub(crate) is_directory: bool,
    pub(crate) position: u32,
    pub(crate) size: u32,
    pub(crate) first_cluster: Option<u32>,
    pub(crate) layout: Layout,
    pub(crate) cursor: SectorCursor,
    pub(crate) buffer: SectorBuffer,
    pub(crate) state: BufferState,
    pub(crate) status: OpenStatus,
    /// Directory holding this file's entry. `None` for the root itself, and
    /// for directories opened only to rescan them.
    pub(crate) parent: Option<DirectoryRef>,
}

impl OpenFile {
    pub(crate) fn root(geometry: &VolumeGeometry) -> Self {
        let (layout, first_cluster, size) = match geometry.dialect.params().root_layout {
            RootLayout::FixedRegion => (
                Layout::Fixed {
                    start: geometry.root_dir_lba,
                    sectors: geometry.root_dir_sectors,
                },
                None,
                u32::from(geometry.root_entry_count) * 32,
            ),
            RootLayout::ClusterChain => (
                Layout::Chain,
                Some(geometry.root_cluster),
                PROVISIONAL_DIRECTORY_SIZE,
            ),
        };
        Self::new(ShortName::DOT, true, first_cluster, size, layout, None)
    }

    pub(crate) fn from_entry(entry: &DirectoryEntry, parent: DirectoryRef) -> Self {
        let cluster = entry.first_cluster();
        let first_cluster = (cluster != 0).then_some(cluster);
        let size = match (entry.is_directory(), first_cluster) {
            (true, _) => PROVISIONAL_DIRECTORY_SIZE,
            // Nothing to read a non-zero size from.
            (false, None) => 0,
            (false, Some(_)) => entry.size(),
        };
        Self::new(
            entry.name(),
            entry.is_directory(),
            first_cluster,
            size,
            Layout::Chain,
            Some(parent),
        )
    }

    /// A directory known only by its first cluster.
    pub(crate) fn directory(cluster: u32) -> Self {
        Self::new(
            ShortName::DOT,
            true,
            Some(cluster),
            PROVISIONAL_DIRECTORY_SIZE,
            Layout::Chain,
            None,
        )
    }

    fn new(
        name: ShortName,
        is_directory: bool,
        first_cluster: Option<u32>,
        size: u32,
        layout: Layout,
        parent: Option<DirectoryRef>,
    ) -> Self {
        Self {
            name,
            is_directory,
            position: 0,
            size,
            first_cluster,
            layout,
            cursor: SectorCursor {
                cluster: first_cluster.unwrap_or(0),
                sector: 0,
            },
            buffer: [0; SECTOR_SIZE],
            state: BufferState::Unloaded,
            status: OpenStatus::Ok,
            parent,
        }
    }

    pub(crate) fn rewind(&mut self) {
        self.position = 0;
        self.cursor = SectorCursor {
            cluster: self.first_cluster.unwrap_or(0),
            sector: 0,
        };
        self.state = BufferState::Unloaded;
    }

    pub(crate) fn degrade(&mut self) {
        self.status = OpenStatus::Degraded;
        self.size = 0;
        self.rewind();
    }

    /// Offset of the position within the buffered sector.
    pub(crate) fn sector_offset(&self) -> usize {
        self.position as usize % SECTOR_SIZE
    }

    /// Moves the position forward within the loaded sector.
    pub(crate) fn consume(&mut self, bytes: usize) {
        let end = self.sector_offset() + bytes;
        self.position += bytes as u32;
        if end == SECTOR_SIZE {
            self.state = BufferState::Exhausted;
        }
    }
}

/// Fixed-size table of open files, plus the root directory which is always
/// open.
#[derive(Debug)]
pub(crate) struct FileTable {
    pub(crate) root: OpenFile,
    slots: Vec<Option<OpenFile>>,
}

impl FileTable {
    pub(crate) fn new(root: OpenFile, capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { root, slots }
    }

    pub(crate) fn insert(&mut self, file: OpenFile) -> Result<FileHandle> {
        let Some(index) = self.slots.iter().position(Option::is_none) else {
            log::warn!("no free slot to open {}", file.name);
            return Err(FatError::OutOfHandles);
        };
        self.slots[index] = Some(file);
        Ok(FileHandle(index))
    }

    pub(crate) fn has_free_slot(&self) -> bool {
        self.slots.iter().any(Option::is_none)
    }

    pub(crate) fn get(&self, handle: FileHandle) -> Result<&OpenFile> {
        if handle.is_root() {
            return Ok(&self.root);
        }
        self.slots
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or(FatError::InvalidHandle)
    }

    pub(crate) fn get_mut(&mut self, handle: FileHandle) -> Result<&mut OpenFile> {
        if handle.is_root() {
            return Ok(&mut self.root);
        }
        self.slots
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(FatError::InvalidHandle)
    }

    /// Frees a slot. Stale handles are ignored.
    pub(crate) fn remove(&mut self, handle: FileHandle) {
        if let Some(slot) = self.slots.get_mut(handle.0) {
            *slot = None;
        }
    }

    pub(crate) fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

/// Sector-level plumbing shared by reads, writes, and directory updates.
impl<D: BlockDevice> Storage<D> {
    fn cursor_lba(&self, file: &OpenFile) -> Option<u32> {
        match file.layout {
            Layout::Fixed { start, sectors } => {
                (file.cursor.sector < sectors).then_some(start + file.cursor.sector)
            }
            Layout::Chain => file.first_cluster.map(|_| {
                self.geometry.cluster_to_lba(file.cursor.cluster) + file.cursor.sector
            }),
        }
    }

    /// Reads the cursor's sector into the buffer. Returns `false` if the file
    /// has no sectors at all.
    pub(crate) fn load(&mut self, file: &mut OpenFile) -> Result<bool> {
        let Some(lba) = self.cursor_lba(file) else {
            return Ok(false);
        };
        self.read_sector(lba, &mut file.buffer)?;
        file.state = BufferState::Loaded;
        Ok(true)
    }

    /// Writes the buffer back to the cursor's sector.
    pub(crate) fn flush(&mut self, file: &OpenFile) -> Result<()> {
        match self.cursor_lba(file) {
            Some(lba) => self.write_sector(lba, &file.buffer),
            None => Ok(()),
        }
    }

    /// Moves the cursor to the next sector. With `extend`, a cluster is
    /// appended when the chain ends. Returns `false` at the end of the file's
    /// storage.
    pub(crate) fn advance(&mut self, file: &mut OpenFile, extend: bool) -> Result<bool> {
        match file.layout {
            Layout::Fixed { sectors, .. } => {
                if file.cursor.sector + 1 >= sectors {
                    return Ok(false);
                }
                file.cursor.sector += 1;
            }
            Layout::Chain => {
                if file.first_cluster.is_none() {
                    return Ok(false);
                }
                if file.cursor.sector + 1 < u32::from(self.geometry.sectors_per_cluster) {
                    file.cursor.sector += 1;
                } else {
                    let cluster = file.cursor.cluster;
                    let next = match self.next_cluster(cluster)? {
                        FatEntry::Next(next) if self.is_data_cluster(next) => next,
                        FatEntry::EndOfChain if extend => self.extend_chain(cluster)?,
                        FatEntry::EndOfChain => return Ok(false),
                        other => {
                            log::warn!(
                                "{}: cluster {cluster} has corrupt FAT entry {other:?}",
                                file.name
                            );
                            return Ok(false);
                        }
                    };
                    file.cursor = SectorCursor {
                        cluster: next,
                        sector: 0,
                    };
                }
            }
        }
        file.state = BufferState::Unloaded;
        Ok(true)
    }

    /// Points the cursor at the `index`th sector of the file. If the chain is
    /// shorter than that, clamps the size to what the chain can hold and
    /// returns `false`.
    fn locate(&mut self, file: &mut OpenFile, index: u32) -> Result<bool> {
        match file.layout {
            Layout::Fixed { sectors, .. } => {
                if index >= sectors {
                    return Ok(false);
                }
                file.cursor = SectorCursor {
                    cluster: 0,
                    sector: index,
                };
            }
            Layout::Chain => {
                let Some(first) = file.first_cluster else {
                    return Ok(false);
                };
                let sectors_per_cluster = u32::from(self.geometry.sectors_per_cluster);
                let mut cluster = first;
                for hop in 0..index / sectors_per_cluster {
                    match self.follow(cluster)? {
                        Some(next) => cluster = next,
                        None => {
                            let capacity = (hop + 1).saturating_mul(self.geometry.cluster_bytes());
                            file.size = file.size.min(capacity);
                            return Ok(false);
                        }
                    }
                }
                file.cursor = SectorCursor {
                    cluster,
                    sector: index % sectors_per_cluster,
                };
            }
        }
        Ok(true)
    }

    /// Makes sure the buffer holds the sector the position points into,
    /// moving on from an exhausted sector if needed. Returns `false` if the
    /// file's storage ends first.
    pub(crate) fn prepare_sector(&mut self, file: &mut OpenFile) -> Result<bool> {
        loop {
            match file.state {
                BufferState::Loaded => return Ok(true),
                BufferState::Unloaded => {
                    if !self.load(file)? {
                        return Ok(false);
                    }
                }
                BufferState::Exhausted => {
                    if !self.advance(file, false)? {
                        return Ok(false);
                    }
                }
            }
        }
    }

    fn read_into(&mut self, file: &mut OpenFile, buf: &mut [u8], done: &mut usize) -> Result<()> {
        let available = file.size.saturating_sub(file.position) as usize;
        let wanted = buf.len().min(available);
        let mut advances = 0;

        while *done < wanted {
            match file.state {
                BufferState::Exhausted => {
                    if advances == self.config.read_sector_limit {
                        log::warn!("{}: stopping read after {advances} sectors", file.name);
                        break;
                    }
                    advances += 1;
                    if !self.advance(file, false)? {
                        file.size = file.position;
                        break;
                    }
                }
                BufferState::Unloaded => {
                    if !self.load(file)? {
                        file.size = file.position;
                        break;
                    }
                }
                BufferState::Loaded => {
                    let offset = file.sector_offset();
                    let count = (wanted - *done).min(SECTOR_SIZE - offset);
                    buf[*done..*done + count].copy_from_slice(&file.buffer[offset..offset + count]);
                    *done += count;
                    file.consume(count);
                }
            }
        }
        Ok(())
    }

    fn write_from(&mut self, file: &mut OpenFile, data: &[u8], done: &mut usize) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if file.first_cluster.is_none() {
            let cluster = self.allocate_free_cluster()?;
            file.first_cluster = Some(cluster);
            file.rewind();
        }

        while *done < data.len() {
            match file.state {
                BufferState::Exhausted => {
                    if !self.advance(file, true)? {
                        log::warn!(
                            "{}: chain ended, write stopped at {}",
                            file.name,
                            file.position
                        );
                        break;
                    }
                }
                BufferState::Unloaded => {
                    // Past the end of the data there's nothing to preserve.
                    if file.sector_offset() == 0 && file.position >= file.size {
                        file.buffer.fill(0);
                        file.state = BufferState::Loaded;
                    } else if !self.load(file)? {
                        break;
                    }
                }
                BufferState::Loaded => {
                    let offset = file.sector_offset();
                    let count = (data.len() - *done).min(SECTOR_SIZE - offset);
                    file.buffer[offset..offset + count]
                        .copy_from_slice(&data[*done..*done + count]);
                    self.flush(file)?;
                    *done += count;
                    file.consume(count);
                    file.size = file.size.max(file.position);
                }
            }
        }
        Ok(())
    }
}

impl<D: BlockDevice> FatVolume<D> {
    /// Reads from the current position. Returns 0 at the end of the file.
    ///
    /// Reads may come up short when the cluster chain turns out to be shorter
    /// than the file's size (the size shrinks to match), after a read error
    /// once some bytes were copied, or when a single call has walked too many
    /// sectors. Calling again resumes where it left off.
    pub fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> Result<usize> {
        let file = self.files.get_mut(handle)?;
        let mut done = 0;
        match self.storage.read_into(file, buf, &mut done) {
            Ok(()) => Ok(done),
            Err(err) if done > 0 => {
                log::warn!("{}: short read of {done} bytes: {err}", file.name);
                Ok(done)
            }
            Err(err) => Err(err),
        }
    }

    /// Writes at the current position, growing the file and its cluster
    /// chain as needed. The directory entry isn't touched; call
    /// [`FatVolume::update_entry`] to persist the new size.
    pub fn write(&mut self, handle: FileHandle, data: &[u8]) -> Result<usize> {
        if handle.is_root() {
            return Err(FatError::IsADirectory);
        }
        let file = self.files.get_mut(handle)?;
        if file.is_directory {
            return Err(FatError::IsADirectory);
        }

        let mut done = 0;
        match self.storage.write_from(file, data, &mut done) {
            Ok(()) => Ok(done),
            Err(err) if done > 0 => {
                log::warn!("{}: short write of {done} bytes: {err}", file.name);
                Ok(done)
            }
            Err(err) => Err(err),
        }
    }

    /// Moves the position of a file. Seeking to exactly the size is allowed.
    pub fn seek(&mut self, handle: FileHandle, position: u32) -> Result<()> {
        let file = self.files.get_mut(handle)?;
        if position > file.size {
            return Err(FatError::PastEnd);
        }
        if file.layout == Layout::Chain && file.first_cluster.is_none() {
            // Empty file, and the only valid position is 0.
            file.rewind();
            return Ok(());
        }

        let sector = position / SECTOR_SIZE as u32;
        let on_boundary = position > 0 && position % SECTOR_SIZE as u32 == 0;
        // On a boundary, stop at the end of the previous sector instead, so
        // that seeking to the end of a full chain doesn't need another
        // cluster.
        let index = if on_boundary { sector - 1 } else { sector };
        if !self.storage.locate(file, index)? {
            log::warn!("{}: chain ends before position {position}", file.name);
            return Err(FatError::PastEnd);
        }

        file.position = position;
        if on_boundary {
            file.state = BufferState::Exhausted;
        } else {
            file.state = BufferState::Unloaded;
            self.storage.load(file)?;
        }
        Ok(())
    }

    /// Releases a file's clusters and empties it. The directory entry isn't
    /// touched; call [`FatVolume::update_entry`] afterwards.
    pub fn truncate(&mut self, handle: FileHandle) -> Result<()> {
        if handle.is_root() {
            return Err(FatError::IsADirectory);
        }
        let file = self.files.get_mut(handle)?;
        if file.is_directory {
            return Err(FatError::IsADirectory);
        }

        if let Some(first) = file.first_cluster {
            let cap = self.storage.config.truncate_chain_limit;
            let freed = self.storage.free_chain(first, cap)?;
            log::debug!("{}: truncated, freed {freed} clusters", file.name);
        }
        file.first_cluster = None;
        file.size = 0;
        file.buffer.fill(0);
        file.rewind();
        Ok(())
    }

    /// Closes a file. Closing the root only rewinds it, and closing a handle
    /// twice does nothing.
    pub fn close(&mut self, handle: FileHandle) {
        if handle.is_root() {
            self.files.root.rewind();
        } else {
            self.files.remove(handle);
        }
    }
}
