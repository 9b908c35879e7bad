//! Where archive bytes live.
//!
//! The reader and writer don't care whether they're talking to a file,
//! a buffer in memory, or a stack of split volumes;
//! they talk to a [`Storage`], which is [`Read`] + [`Write`] + [`Seek`]
//! plus the handful of extra operations ZIP needs.
//!
//! [`Storage`]: trait.Storage.html

use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::*;

/// How a storage is opened
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpenMode {
    /// Read an existing archive. Writes fail.
    Read,
    /// Create a new archive, clobbering whatever was there.
    Create,
    /// Open an existing archive for both reading and writing,
    /// so entries can be added to it.
    Append,
}

impl OpenMode {
    pub fn is_writable(self) -> bool {
        self != OpenMode::Read
    }
}

/// The I/O contract archives are read from and written to.
///
/// `tell` is [`Seek::stream_position`].
/// Positions are logical: for split archives,
/// they run across every volume as if they were one big file.
pub trait Storage: Read + Write + Seek {
    /// Total logical length in bytes
    fn size(&mut self) -> io::Result<u64>;

    /// Cuts the storage off at the given logical length.
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    /// Flushes and releases the underlying resource.
    /// Any later I/O fails; closing again does nothing.
    fn close(&mut self) -> io::Result<()>;

    /// True once any operation on the storage has failed.
    fn has_error(&self) -> bool;

    /// The volume (disk) the current position is on
    fn current_disk(&self) -> u32 {
        0
    }

    /// How many volumes (disks) the storage spans
    fn disk_count(&self) -> u32 {
        1
    }

    /// The logical position where the given disk begins
    fn disk_start(&self, disk: u32) -> io::Result<u64> {
        if disk == 0 {
            Ok(0)
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("No disk {} in a single-volume storage", disk),
            ))
        }
    }

    /// Bytes that can still be written before the current volume fills up,
    /// or `None` if the storage isn't split into volumes for writing.
    fn volume_space_left(&self) -> Option<u64> {
        None
    }

    /// Ends the current volume and starts writing to the next one.
    fn start_next_volume(&mut self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Storage isn't split into volumes",
        ))
    }
}

impl<S: Storage + ?Sized> Storage for &mut S {
    fn size(&mut self) -> io::Result<u64> {
        (**self).size()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        (**self).truncate(len)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn has_error(&self) -> bool {
        (**self).has_error()
    }

    fn current_disk(&self) -> u32 {
        (**self).current_disk()
    }

    fn disk_count(&self) -> u32 {
        (**self).disk_count()
    }

    fn disk_start(&self, disk: u32) -> io::Result<u64> {
        (**self).disk_start(disk)
    }

    fn volume_space_left(&self) -> Option<u64> {
        (**self).volume_space_left()
    }

    fn start_next_volume(&mut self) -> io::Result<()> {
        (**self).start_next_volume()
    }
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    fn size(&mut self) -> io::Result<u64> {
        (**self).size()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        (**self).truncate(len)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn has_error(&self) -> bool {
        (**self).has_error()
    }

    fn current_disk(&self) -> u32 {
        (**self).current_disk()
    }

    fn disk_count(&self) -> u32 {
        (**self).disk_count()
    }

    fn disk_start(&self, disk: u32) -> io::Result<u64> {
        (**self).disk_start(disk)
    }

    fn volume_space_left(&self) -> Option<u64> {
        (**self).volume_space_left()
    }

    fn start_next_volume(&mut self) -> io::Result<()> {
        (**self).start_next_volume()
    }
}

pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "Storage is closed")
}

pub(crate) fn read_only_error() -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        "Storage was opened read-only",
    )
}

/// Latches `failed` if the result is an error.
pub(crate) fn note<T>(failed: &mut bool, result: io::Result<T>) -> io::Result<T> {
    if result.is_err() {
        *failed = true;
    }
    result
}

/// An archive in a plain file on disk
#[derive(Debug)]
pub struct LocalFile {
    file: Option<File>,
    path: PathBuf,
    mode: OpenMode,
    failed: bool,
}

impl LocalFile {
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        let file = match mode {
            OpenMode::Read => File::open(&path)?,
            OpenMode::Create => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?,
            OpenMode::Append => OpenOptions::new().read(true).write(true).open(&path)?,
        };
        debug!("Opened {:?} ({:?})", path, mode);
        Ok(Self {
            file: Some(file),
            path,
            mode,
            failed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file.as_mut().ok_or_else(closed_error)
    }
}

impl Read for LocalFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self.file().and_then(|f| f.read(buf));
        note(&mut self.failed, result)
    }
}

impl Write for LocalFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = if self.mode.is_writable() {
            self.file().and_then(|f| f.write(buf))
        } else {
            Err(read_only_error())
        };
        note(&mut self.failed, result)
    }

    fn flush(&mut self) -> io::Result<()> {
        let result = self.file().and_then(|f| f.flush());
        note(&mut self.failed, result)
    }
}

impl Seek for LocalFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let result = self.file().and_then(|f| f.seek(pos));
        note(&mut self.failed, result)
    }
}

impl Storage for LocalFile {
    fn size(&mut self) -> io::Result<u64> {
        let result = self.file().and_then(|f| f.metadata()).map(|m| m.len());
        note(&mut self.failed, result)
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        let result = if self.mode.is_writable() {
            self.file().and_then(|f| f.set_len(len))
        } else {
            Err(read_only_error())
        };
        note(&mut self.failed, result)
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            if self.mode.is_writable() {
                let result = file.flush();
                note(&mut self.failed, result)?;
            }
            debug!("Closed {:?}", self.path);
        }
        Ok(())
    }

    fn has_error(&self) -> bool {
        self.failed
    }
}

/// An archive held entirely in memory
#[derive(Debug)]
pub struct MemoryBuffer {
    cursor: Cursor<Vec<u8>>,
    mode: OpenMode,
    closed: bool,
    failed: bool,
}

impl MemoryBuffer {
    /// Wraps the given bytes. `Create` discards them.
    pub fn new(mut bytes: Vec<u8>, mode: OpenMode) -> Self {
        if mode == OpenMode::Create {
            bytes.clear();
        }
        Self {
            cursor: Cursor::new(bytes),
            mode,
            closed: false,
            failed: false,
        }
    }

    /// An empty buffer for writing a new archive
    pub fn create() -> Self {
        Self::new(Vec::new(), OpenMode::Create)
    }

    /// A read-only view of an existing archive
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::new(bytes, OpenMode::Read)
    }

    pub fn get_ref(&self) -> &[u8] {
        self.cursor.get_ref()
    }

    /// Hands back the bytes, closed or not.
    pub fn into_inner(self) -> Vec<u8> {
        self.cursor.into_inner()
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed {
            Err(closed_error())
        } else {
            Ok(())
        }
    }

    fn check_writable(&self) -> io::Result<()> {
        self.check_open()?;
        if self.mode.is_writable() {
            Ok(())
        } else {
            Err(read_only_error())
        }
    }
}

impl Read for MemoryBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self.check_open().and_then(|()| self.cursor.read(buf));
        note(&mut self.failed, result)
    }
}

impl Write for MemoryBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = self.check_writable().and_then(|()| self.cursor.write(buf));
        note(&mut self.failed, result)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check_open()
    }
}

impl Seek for MemoryBuffer {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let result = self.check_open().and_then(|()| self.cursor.seek(pos));
        note(&mut self.failed, result)
    }
}

impl Storage for MemoryBuffer {
    fn size(&mut self) -> io::Result<u64> {
        self.check_open()?;
        Ok(self.cursor.get_ref().len() as u64)
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        let result = self.check_writable().and_then(|()| {
            let len = usize::try_from(len).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "Length exceeds address space")
            })?;
            self.cursor.get_mut().resize(len, 0);
            Ok(())
        });
        note(&mut self.failed, result)
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }

    fn has_error(&self) -> bool {
        self.failed
    }
}
