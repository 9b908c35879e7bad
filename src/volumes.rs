//! Split (multi-volume) archives
//!
//! PKZIP splits an archive across fixed-size files named
//! `foo.z01`, `foo.z02`, ..., with the last one being `foo.zip`.
//! [`MultiVolumeFile`] stitches those back into one logical byte range,
//! so the reader and writer can mostly pretend they're dealing with one file.
//!
//! [`MultiVolumeFile`]: struct.MultiVolumeFile.html

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::*;

use crate::storage::*;

/// Volumes smaller than this are refused.
/// Every header has to fit in one volume, and the largest are around 64K.
pub const MIN_VOLUME_SIZE: u64 = 64 * 1024;

#[derive(Debug)]
struct Volume {
    path: PathBuf,
    /// Logical offset of the volume's first byte
    start: u64,
    len: u64,
}

impl Volume {
    fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// A split archive, as one logical storage
#[derive(Debug)]
pub struct MultiVolumeFile {
    /// The final `.zip` volume, which names the whole set
    path: PathBuf,
    mode: OpenMode,
    /// Maximum size of each volume when writing
    volume_size: u64,
    volumes: Vec<Volume>,
    /// The one volume we keep open at a time, by index
    open_volume: Option<(usize, File)>,
    position: u64,
    closed: bool,
    failed: bool,
}

/// The name of the `number`th volume (counting from 1) of a set named by `path`.
pub fn volume_path(path: &Path, number: usize) -> PathBuf {
    path.with_extension(format!("z{:02}", number))
}

impl MultiVolumeFile {
    /// Opens a split archive.
    ///
    /// `path` is the final `.zip` volume.
    /// When creating, `volume_size` caps each volume's size.
    /// It's ignored when reading, since the volumes are whatever size they are.
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode, volume_size: u64) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        match mode {
            OpenMode::Read => Self::open_for_reading(path),
            OpenMode::Create => Self::create(path, volume_size),
            OpenMode::Append => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "Can't append to split archives",
            )),
        }
    }

    fn open_for_reading(path: PathBuf) -> io::Result<Self> {
        let mut volumes = Vec::new();
        let mut start = 0;
        for number in 1.. {
            let volume = volume_path(&path, number);
            let len = match fs::metadata(&volume) {
                Ok(m) => m.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) => return Err(e),
            };
            trace!("Found volume {:?} ({} bytes)", volume, len);
            volumes.push(Volume {
                path: volume,
                start,
                len,
            });
            start += len;
        }
        let len = fs::metadata(&path)?.len();
        volumes.push(Volume {
            path: path.clone(),
            start,
            len,
        });
        debug!(
            "Opened split archive {:?}: {} volumes, {} bytes",
            path,
            volumes.len(),
            start + len
        );

        Ok(Self {
            path,
            mode: OpenMode::Read,
            volume_size: 0,
            volumes,
            open_volume: None,
            position: 0,
            closed: false,
            failed: false,
        })
    }

    fn create(path: PathBuf, volume_size: u64) -> io::Result<Self> {
        if volume_size < MIN_VOLUME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Volume size {} is below the minimum of {}",
                    volume_size, MIN_VOLUME_SIZE
                ),
            ));
        }
        // Leftover volumes from an earlier set would get stitched onto ours
        // when reading it back.
        for number in 1.. {
            let stale = volume_path(&path, number);
            match fs::remove_file(&stale) {
                Ok(()) => warn!("Removed stale volume {:?}", stale),
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) => return Err(e),
            }
        }
        let file = Self::create_volume(&path)?;
        debug!(
            "Creating split archive {:?} with {}-byte volumes",
            path, volume_size
        );

        Ok(Self {
            volumes: vec![Volume {
                path: path.clone(),
                start: 0,
                len: 0,
            }],
            path,
            mode: OpenMode::Create,
            volume_size,
            open_volume: Some((0, file)),
            position: 0,
            closed: false,
            failed: false,
        })
    }

    fn create_volume(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
    }

    /// Paths of every volume so far, in order
    pub fn volume_paths(&self) -> impl Iterator<Item = &Path> {
        self.volumes.iter().map(|v| v.path.as_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed {
            Err(closed_error())
        } else {
            Ok(())
        }
    }

    /// The volume holding the byte at `position`.
    /// Empty volumes are skipped, and the position after the last byte
    /// belongs to the last volume.
    fn volume_at(&self, position: u64) -> usize {
        let idx = self.volumes.partition_point(|v| v.end() <= position);
        idx.min(self.volumes.len() - 1)
    }

    /// Makes the `idx`th volume the open one, closing whatever else was.
    fn switch_to(&mut self, idx: usize) -> io::Result<&mut File> {
        let is_open = matches!(&self.open_volume, Some((open, _)) if *open == idx);
        if !is_open {
            if self.mode.is_writable() {
                // Finished volumes are renamed and closed;
                // we only ever have the last one.
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "Can't go back to a finished volume while writing",
                ));
            }
            let volume = &self.volumes[idx];
            trace!("Switching to volume {:?}", volume.path);
            // Dropping the old file closes it.
            self.open_volume = None;
            self.open_volume = Some((idx, File::open(&volume.path)?));
        }
        match &mut self.open_volume {
            Some((_, file)) => Ok(file),
            None => Err(closed_error()),
        }
    }

    fn read_impl(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        let idx = self.volume_at(self.position);
        let (start, end) = {
            let v = &self.volumes[idx];
            (v.start, v.end())
        };
        if self.position >= end || buf.is_empty() {
            return Ok(0);
        }
        let within = self.position - start;
        let available = (end - self.position).min(buf.len() as u64) as usize;
        let file = self.switch_to(idx)?;
        file.seek(SeekFrom::Start(within))?;
        let n = file.read(&mut buf[..available])?;
        self.position += n as u64;
        Ok(n)
    }

    fn write_impl(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        if !self.mode.is_writable() {
            return Err(read_only_error());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let last = self.volumes.len() - 1;
        let start = self.volumes[last].start;
        if self.position < start {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "Can't write to a finished volume",
            ));
        }
        if self.position - start >= self.volume_size {
            self.next_volume()?;
        }
        let start = self.volumes[self.volumes.len() - 1].start;
        let within = self.position - start;
        let room = (self.volume_size - within).min(buf.len() as u64) as usize;
        let file = self.switch_to(self.volumes.len() - 1)?;
        file.seek(SeekFrom::Start(within))?;
        let n = file.write(&buf[..room])?;
        self.position += n as u64;
        let volume = self.volumes.last_mut().ok_or_else(closed_error)?;
        volume.len = volume.len.max(self.position - volume.start);
        Ok(n)
    }

    fn next_volume(&mut self) -> io::Result<()> {
        self.check_open()?;
        if !self.mode.is_writable() {
            return Err(read_only_error());
        }
        if let Some((_, mut file)) = self.open_volume.take() {
            file.flush()?;
        }
        let number = self.volumes.len();
        let finished = volume_path(&self.path, number);
        fs::rename(&self.path, &finished)?;
        let next_start = {
            let volume = self.volumes.last_mut().ok_or_else(closed_error)?;
            volume.path = finished;
            debug!(
                "Finished volume {:?} at {} bytes",
                volume.path, volume.len
            );
            volume.end()
        };
        let file = Self::create_volume(&self.path)?;
        self.volumes.push(Volume {
            path: self.path.clone(),
            start: next_start,
            len: 0,
        });
        self.open_volume = Some((self.volumes.len() - 1, file));
        self.position = next_start;
        Ok(())
    }
}

impl Read for MultiVolumeFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self.read_impl(buf);
        note(&mut self.failed, result)
    }
}

impl Write for MultiVolumeFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = self.write_impl(buf);
        note(&mut self.failed, result)
    }

    fn flush(&mut self) -> io::Result<()> {
        let result = self.check_open().and_then(|()| match &mut self.open_volume {
            Some((_, file)) if self.mode.is_writable() => file.flush(),
            _ => Ok(()),
        });
        note(&mut self.failed, result)
    }
}

impl Seek for MultiVolumeFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let result = self.check_open().and_then(|()| {
            let total = self.volumes.last().map_or(0, Volume::end);
            let target = match pos {
                SeekFrom::Start(p) => Some(p),
                SeekFrom::End(delta) => total.checked_add_signed(delta),
                SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            }
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "Seek to a negative position")
            })?;
            if self.mode.is_writable() && target < self.volumes[self.volumes.len() - 1].start {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "Can't seek back into a finished volume while writing",
                ));
            }
            self.position = target;
            Ok(target)
        });
        note(&mut self.failed, result)
    }
}

impl Storage for MultiVolumeFile {
    fn size(&mut self) -> io::Result<u64> {
        self.check_open()?;
        Ok(self.volumes.last().map_or(0, Volume::end))
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        let result = self.check_open().and_then(|()| {
            if !self.mode.is_writable() {
                return Err(read_only_error());
            }
            let last = self.volumes.len() - 1;
            let start = self.volumes[last].start;
            if len < start {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "Can't truncate into a finished volume",
                ));
            }
            self.switch_to(last)?.set_len(len - start)?;
            self.volumes[last].len = len - start;
            Ok(())
        });
        note(&mut self.failed, result)
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some((_, mut file)) = self.open_volume.take() {
            if self.mode.is_writable() {
                let result = file.flush();
                note(&mut self.failed, result)?;
            }
        }
        debug!("Closed split archive {:?}", self.path);
        Ok(())
    }

    fn has_error(&self) -> bool {
        self.failed
    }

    fn current_disk(&self) -> u32 {
        self.volume_at(self.position) as u32
    }

    fn disk_count(&self) -> u32 {
        self.volumes.len() as u32
    }

    fn disk_start(&self, disk: u32) -> io::Result<u64> {
        self.volumes
            .get(disk as usize)
            .map(|v| v.start)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("No disk {} (of {})", disk, self.volumes.len()),
                )
            })
    }

    fn volume_space_left(&self) -> Option<u64> {
        if !self.mode.is_writable() {
            return None;
        }
        let start = self.volumes.last().map_or(0, |v| v.start);
        Some(
            self.volume_size
                .saturating_sub(self.position.saturating_sub(start)),
        )
    }

    fn start_next_volume(&mut self) -> io::Result<()> {
        let result = self.next_volume();
        note(&mut self.failed, result)
    }
}
