use core::fmt;

/// Everything that can go wrong while talking to a FAT volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatError {
    /// The boot sector describes a volume we can't (or shouldn't) mount.
    InvalidGeometry,
    NotFound,
    /// A non-final path component is a regular file.
    NotADirectory,
    /// Tried to write to or truncate a directory.
    IsADirectory,
    AlreadyExists,
    NoFreeCluster,
    NoDirectorySpace,
    ReadError { lba: u32 },
    WriteError { lba: u32 },
    OutOfHandles,
    /// The handle is closed or was never handed out.
    InvalidHandle,
    /// Seek target lies beyond the end of the file.
    PastEnd,
    InvalidName,
}

impl fmt::Display for FatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidGeometry => write!(f, "invalid volume geometry"),
            Self::NotFound => write!(f, "no such file or directory"),
            Self::NotADirectory => write!(f, "not a directory"),
            Self::IsADirectory => write!(f, "is a directory"),
            Self::AlreadyExists => write!(f, "file already exists"),
            Self::NoFreeCluster => write!(f, "no free cluster left on volume"),
            Self::NoDirectorySpace => write!(f, "no free slot left in directory"),
            Self::ReadError { lba } => write!(f, "failed to read sector {lba}"),
            Self::WriteError { lba } => write!(f, "failed to write sector {lba}"),
            Self::OutOfHandles => write!(f, "open file table is full"),
            Self::InvalidHandle => write!(f, "invalid file handle"),
            Self::PastEnd => write!(f, "position is past the end of the file"),
            Self::InvalidName => write!(f, "invalid file name"),
        }
    }
}

pub type Result<T, E = FatError> = core::result::Result<T, E>;
