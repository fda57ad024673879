//! File sources the sender reads from.
//!
//! The sender does not interpret file names; a [`FileSource`] maps a
//! requested name to a bounded, seekable reader. The production source
//! publishes a directory tree under path-relative names; tests use the
//! in-memory source.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncSeek};

/// Why a file could not be opened
#[derive(Debug, Error)]
pub enum FileAccessError {
    /// No file is published under the requested name
    #[error("file not found")]
    NotFound,

    /// The file exists but may not be read
    #[error("permission denied")]
    PermissionDenied,

    /// Any other I/O failure while opening
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Bounded, seekable async reader
pub trait SliceReader: AsyncRead + AsyncSeek + Send + Unpin {}
impl<T: AsyncRead + AsyncSeek + Send + Unpin> SliceReader for T {}

/// An opened file: its reader and total size in bytes
pub struct FileSlice {
    /// Reader positioned at the start of the file
    pub reader: Box<dyn SliceReader>,
    /// Total file size in bytes
    pub size: u64,
}

/// Maps requested names to readable file slices
pub trait FileSource: Send + Sync {
    /// Open the file published under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`FileAccessError::NotFound`] for unknown names,
    /// [`FileAccessError::PermissionDenied`] for unreadable files, and
    /// [`FileAccessError::Io`] for other failures.
    fn open(&self, name: &str) -> Result<FileSlice, FileAccessError>;
}

/// Publishes every regular file under a directory, keyed by its
/// path relative to the root.
pub struct DirectorySource {
    files: HashMap<String, PathBuf>,
}

impl DirectorySource {
    /// Walk `root` recursively and publish everything found. The walk
    /// happens once; files appearing later are not picked up.
    ///
    /// # Errors
    ///
    /// Returns the underlying error when `root` is not a readable
    /// directory.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("{} is not a directory", root.display()),
            ));
        }
        let mut files = HashMap::new();
        collect_files(root, root, &mut files)?;
        Ok(Self { files })
    }

    /// Number of published files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether no files are published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn collect_files(
    root: &Path,
    dir: &Path,
    files: &mut HashMap<String, PathBuf>,
) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, files)?;
        } else if path.is_file() {
            let name = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            files.insert(name, path);
        }
    }
    Ok(())
}

impl FileSource for DirectorySource {
    fn open(&self, name: &str) -> Result<FileSlice, FileAccessError> {
        let path = self.files.get(name).ok_or(FileAccessError::NotFound)?;
        let file = std::fs::File::open(path).map_err(|error| {
            if error.kind() == io::ErrorKind::PermissionDenied {
                FileAccessError::PermissionDenied
            } else {
                FileAccessError::Io(error)
            }
        })?;
        let size = file.metadata()?.len();
        Ok(FileSlice {
            reader: Box::new(tokio::fs::File::from_std(file)),
            size,
        })
    }
}

/// In-memory source for tests and loopback runs
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    files: HashMap<String, Vec<u8>>,
}

impl MemorySource {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `content` under `name`, replacing any previous entry.
    pub fn insert(&mut self, name: impl Into<String>, content: Vec<u8>) {
        self.files.insert(name.into(), content);
    }
}

impl FileSource for MemorySource {
    fn open(&self, name: &str) -> Result<FileSlice, FileAccessError> {
        let content = self.files.get(name).ok_or(FileAccessError::NotFound)?;
        Ok(FileSlice {
            size: content.len() as u64,
            reader: Box::new(io::Cursor::new(content.clone())),
        })
    }
}
