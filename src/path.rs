use alloc::fmt;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

/// A path on the volume. There is no working directory, so every path is
/// walked from the root whether or not it starts with `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FilePath {
    /// Components of a path not including separators (the `/` character).
    pub(crate) components: Vec<FilePathComponent>,
}

impl FilePath {
    /// Never fails: empty components are dropped, so `""`, `"/"`, and `"//"`
    /// all name the root directory.
    pub(crate) fn parse(s: &str) -> Self {
        let components = s.split('/').filter_map(FilePathComponent::new).collect();
        Self { components }
    }

    pub(crate) fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Splits off the last component. Returns `None` for the root, which has
    /// no parent.
    pub(crate) fn split_dirname_filename(&self) -> Option<(Self, FilePathComponent)> {
        let (filename, parent) = self.components.split_last()?;
        let parent_path = Self {
            components: parent.to_vec(),
        };
        Some((parent_path, filename.clone()))
    }
}

/// A component of a file path. Notably, this cannot include the `/` character,
/// and is non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FilePathComponent(String);

impl FilePathComponent {
    fn new(s: &str) -> Option<Self> {
        if s.is_empty() || s.contains('/') {
            None
        } else {
            Some(Self(s.to_string()))
        }
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FilePathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/")?;
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{component}")?;
        }
        Ok(())
    }
}
