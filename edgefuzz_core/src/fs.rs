//! File-system access.
//!
//! Every artifact the engine creates (queue entries, crash and hang samples,
//! sidecar markers, statistics) goes through a [`FileSystem`]. The engine only
//! holds a `Box<dyn FileSystem>`, so tests and embedders can substitute their own.

use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// How an existing file is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// What happens when the file does (not) exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Fail if the file does not exist.
    Open,
    /// Create the file if missing, truncate it otherwise.
    Create,
    /// Create the file, failing if it already exists.
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    pub access: AccessMode,
    pub create: CreateMode,
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self {
            access: AccessMode::ReadOnly,
            create: CreateMode::Open,
        }
    }

    pub fn write_only(create: CreateMode) -> Self {
        Self {
            access: AccessMode::WriteOnly,
            create,
        }
    }

    pub fn read_write(create: CreateMode) -> Self {
        Self {
            access: AccessMode::ReadWrite,
            create,
        }
    }
}

/// Metadata returned by [`FileSystem::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub len: u64,
    pub modified: SystemTime,
    pub is_dir: bool,
}

/// An open file handle.
pub trait FileStream: Read + Write + Seek {
    fn set_len(&mut self, len: u64) -> io::Result<()>;
}

impl FileStream for std::fs::File {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        std::fs::File::set_len(self, len)
    }
}

/// The file-system collaborator used by the engine.
///
/// Implementations must be usable from the single engine thread; they are not
/// required to be `Sync`.
pub trait FileSystem {
    /// Opens `path` according to `options`.
    ///
    /// # Arguments
    /// * `path`: The file to open.
    /// * `options`: Access and creation flags.
    ///
    /// # Returns
    /// A boxed stream, or the underlying I/O error. `CreateMode::Exclusive` on an
    /// existing file fails with `io::ErrorKind::AlreadyExists`.
    fn open(&self, path: &Path, options: OpenOptions) -> io::Result<Box<dyn FileStream>>;

    fn delete_file(&self, path: &Path) -> io::Result<()>;

    /// Deletes a directory. Without `recursive`, the directory must be empty.
    fn delete_dir(&self, path: &Path, recursive: bool) -> io::Result<()>;

    /// Lists the entries of a directory, sorted by file name.
    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Creates a directory and any missing parents. Succeeds if it already exists.
    fn ensure_dir(&self, path: &Path) -> io::Result<()>;

    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn hard_link(&self, original: &Path, link: &Path) -> io::Result<()>;

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64>;

    fn stat(&self, path: &Path) -> io::Result<FileInfo>;

    /// Reads a whole file.
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        let mut stream = self.open(path, OpenOptions::read_only())?;
        let mut data = Vec::new();
        stream.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Reads at most `limit` bytes from the start of a file.
    fn read_prefix(&self, path: &Path, limit: usize) -> io::Result<Vec<u8>> {
        let stream = self.open(path, OpenOptions::read_only())?;
        let mut data = Vec::new();
        stream.take(limit as u64).read_to_end(&mut data)?;
        Ok(data)
    }

    /// Writes `data` to a file that must not exist yet.
    fn create_new(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut stream = self.open(path, OpenOptions::write_only(CreateMode::Exclusive))?;
        stream.write_all(data)
    }

    /// Writes `data` to `path`, creating or truncating it.
    fn replace_file(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut stream = self.open(path, OpenOptions::write_only(CreateMode::Create))?;
        stream.write_all(data)
    }

    /// Hard-links `original` to `link`, copying if linking is not possible.
    fn link_or_copy(&self, original: &Path, link: &Path) -> io::Result<()> {
        if self.hard_link(original, link).is_ok() {
            return Ok(());
        }
        self.copy(original, link).map(|_| ())
    }
}

/// [`FileSystem`] backed by `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFileSystem;

impl FileSystem for StdFileSystem {
    fn open(&self, path: &Path, options: OpenOptions) -> io::Result<Box<dyn FileStream>> {
        let mut std_opts = std::fs::OpenOptions::new();
        match options.access {
            AccessMode::ReadOnly => std_opts.read(true),
            AccessMode::WriteOnly => std_opts.write(true),
            AccessMode::ReadWrite => std_opts.read(true).write(true),
        };
        match options.create {
            CreateMode::Open => {}
            CreateMode::Create => {
                std_opts.create(true).truncate(true);
            }
            CreateMode::Exclusive => {
                std_opts.create_new(true);
            }
        }
        let file = std_opts.open(path)?;
        Ok(Box::new(file))
    }

    fn delete_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn delete_dir(&self, path: &Path, recursive: bool) -> io::Result<()> {
        if recursive {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_dir(path)
        }
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = std::fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<Vec<_>>>()?;
        entries.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(entries)
    }

    fn ensure_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn hard_link(&self, original: &Path, link: &Path) -> io::Result<()> {
        std::fs::hard_link(original, link)
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        std::fs::copy(from, to)
    }

    fn stat(&self, path: &Path) -> io::Result<FileInfo> {
        let meta = std::fs::metadata(path)?;
        Ok(FileInfo {
            len: meta.len(),
            modified: meta.modified()?,
            is_dir: meta.is_dir(),
        })
    }
}
