//! Tools for writing a ZIP archive.
//!
//! A [`ZipWriter`] writes entries one at a time:
//! [`start_entry`] writes its local header, [`write`] streams its data
//! through the compressor (and cipher), and [`close_entry`] wraps it up.
//! The central directory is held in memory until [`close`] writes it out.
//!
//! [`ZipWriter`]: struct.ZipWriter.html
//! [`start_entry`]: struct.ZipWriter.html#method.start_entry
//! [`write`]: struct.ZipWriter.html#method.write
//! [`close_entry`]: struct.ZipWriter.html#method.close_entry
//! [`close`]: struct.ZipWriter.html#method.close

use std::io::{self, Read, Seek, SeekFrom, Write};

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use log::*;

use crate::arch::{u16_or_sentinel, u32_or_sentinel};
use crate::codec::{CompressionMethod, Encoder, DEFAULT_LEVEL};
use crate::crypto::*;
use crate::read::read_central_directory;
use crate::result::*;
use crate::spec::{self, System};
use crate::storage::Storage;

#[cfg(feature = "aes-crypto")]
use crate::aes::AesCipher;

/// Uncompressed bytes fed to the encoder at a time
const CHUNK: usize = 64 * 1024;

/// The APPNOTE version we claim to implement in "version made by"
const VERSION_MADE_BY: u16 = 63;

/// Default Unix permissions for files and directories
const DEFAULT_FILE_MODE: u32 = 0o100644;
const DEFAULT_DIR_MODE: u32 = 0o040755;

/// MS-DOS directory attribute
const DOS_DIRECTORY: u32 = 0x10;

/// How to store a new entry
///
/// ```
/// # use ziprw::*;
/// let options = EntryOptions::default()
///     .compression(CompressionMethod::Deflate)
///     .level(9)
///     .unix_mode(0o100755)
///     .comment("The good stuff");
/// ```
#[derive(Debug, Clone)]
pub struct EntryOptions {
    compression: CompressionMethod,
    level: u32,
    modified: NaiveDateTime,
    unix_modified: Option<i64>,
    unix_mode: Option<u32>,
    external_attributes: Option<u32>,
    internal_attributes: u16,
    comment: String,
    encryption: Option<(EncryptionMethod, Password)>,
    size: Option<u64>,
    large_file: bool,
}

impl Default for EntryOptions {
    fn default() -> Self {
        Self {
            compression: CompressionMethod::Deflate,
            level: DEFAULT_LEVEL,
            modified: Local::now().naive_local(),
            unix_modified: None,
            unix_mode: None,
            external_attributes: None,
            internal_attributes: 0,
            comment: String::new(),
            encryption: None,
            size: None,
            large_file: false,
        }
    }
}

impl EntryOptions {
    pub fn compression(mut self, method: CompressionMethod) -> Self {
        self.compression = method;
        self
    }

    /// Compression level, from 0 (fastest) to 9 (smallest)
    pub fn level(mut self, level: u32) -> Self {
        self.level = level.min(9);
        self
    }

    /// Modification time stored in the MS-DOS fields
    pub fn modified(mut self, when: NaiveDateTime) -> Self {
        self.modified = when;
        self
    }

    /// Also store a Unix modification time in an extended timestamp field
    pub fn unix_modified(mut self, when: DateTime<Utc>) -> Self {
        self.unix_modified = Some(when.timestamp());
        self
    }

    /// Unix mode bits, including the file type bits
    pub fn unix_mode(mut self, mode: u32) -> Self {
        self.unix_mode = Some(mode);
        self
    }

    /// Raw external attributes. Overrides `unix_mode`.
    pub fn external_attributes(mut self, attributes: u32) -> Self {
        self.external_attributes = Some(attributes);
        self
    }

    pub fn internal_attributes(mut self, attributes: u16) -> Self {
        self.internal_attributes = attributes;
        self
    }

    pub fn comment(mut self, comment: &str) -> Self {
        self.comment = comment.to_owned();
        self
    }

    /// Encrypts the entry with the given scheme and password.
    pub fn encrypt(mut self, method: EncryptionMethod, password: &[u8]) -> Self {
        self.encryption = Some((method, Password::new(password)));
        self
    }

    /// Declares the entry's uncompressed size up front.
    ///
    /// Lets the writer patch the local header after the data
    /// instead of appending a data descriptor.
    /// Writing a different number of bytes is an error.
    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Reserves room for Zip64 sizes in the local header.
    /// Needed to stream an entry of 4 GiB or more without declaring its size.
    pub fn large_file(mut self, large: bool) -> Self {
        self.large_file = large;
        self
    }

    /// General purpose flag bits 1 and 2, which note the DEFLATE level
    fn level_flags(&self) -> u16 {
        if self.compression != CompressionMethod::Deflate {
            return 0;
        }
        match self.level {
            8 | 9 => 0x2,
            2 => 0x4,
            1 => 0x6,
            _ => 0,
        }
    }
}

/// What the writer remembers about each entry for the central directory
#[derive(Debug, Clone)]
pub(crate) struct CentralRecord {
    pub name: Vec<u8>,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    /// As stored: 99 for AES
    pub method: u16,
    pub dos_time: u16,
    pub dos_date: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub size: u64,
    pub disk: u32,
    pub header_offset: u64,
    pub internal_attributes: u16,
    pub external_attributes: u32,
    /// Extra fields besides Zip64, which is worked out when writing
    pub extra: Vec<u8>,
    pub comment: Vec<u8>,
}

impl CentralRecord {
    pub fn write(&self, out: &mut Vec<u8>) {
        let mut zip64 = Vec::new();
        if self.size >= u32::MAX as u64 {
            zip64.push(self.size);
        }
        if self.compressed_size >= u32::MAX as u64 {
            zip64.push(self.compressed_size);
        }
        if self.header_offset >= u32::MAX as u64 {
            zip64.push(self.header_offset);
        }
        let big_disk = self.disk >= u16::MAX as u32;

        let mut extra = Vec::new();
        let mut version_needed = self.version_needed;
        if !zip64.is_empty() || big_disk {
            spec::write_zip64_extra(&mut extra, &zip64, big_disk.then_some(self.disk));
            version_needed = version_needed.max(spec::VERSION_ZIP64);
        }
        extra.extend_from_slice(&self.extra);

        spec::CentralDirectoryEntry {
            source_version: self.version_made_by,
            minimum_extract_version: version_needed,
            flags: self.flags,
            compression_method: self.method,
            last_modified_time: self.dos_time,
            last_modified_date: self.dos_date,
            crc32: self.crc32,
            compressed_size: u32_or_sentinel(self.compressed_size),
            uncompressed_size: u32_or_sentinel(self.size),
            disk_number: u16_or_sentinel(self.disk as u64),
            internal_file_attributes: self.internal_attributes,
            external_file_attributes: self.external_attributes,
            header_offset: u32_or_sentinel(self.header_offset),
            path: &self.name,
            extra_field: &extra,
            file_comment: &self.comment,
        }
        .write(out);
    }
}

/// Builds a local file header for the given record.
/// With `zip64`, the sizes go in a Zip64 extra field placed first,
/// so it can be found again for patching.
fn local_header(record: &CentralRecord, zip64: bool) -> Vec<u8> {
    let mut extra = Vec::new();
    if zip64 {
        spec::write_zip64_extra(&mut extra, &[record.size, record.compressed_size], None);
    }
    extra.extend_from_slice(&record.extra);
    let (compressed_size, uncompressed_size) = if zip64 {
        (u32::MAX, u32::MAX)
    } else {
        (record.compressed_size as u32, record.size as u32)
    };

    let mut out = Vec::new();
    spec::LocalFileHeader {
        minimum_extract_version: record.version_needed,
        flags: record.flags,
        compression_method: record.method,
        last_modified_time: record.dos_time,
        last_modified_date: record.dos_date,
        crc32: record.crc32,
        compressed_size,
        uncompressed_size,
        path: &record.name,
        extra_field: &extra,
    }
    .write(&mut out);
    out
}

/// An already-compressed entry to copy into the archive verbatim
pub(crate) struct RawEntry<'a> {
    pub name: &'a [u8],
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub dos_time: u16,
    pub dos_date: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub size: u64,
    /// Extra fields, minus any Zip64 field
    pub extra: &'a [u8],
}

/// An entry being written
struct PendingEntry {
    record: CentralRecord,
    /// Logical position of the local header, for patching
    header_position: u64,
    local_zip64: bool,
    streaming: bool,
    declared_size: Option<u64>,
    encoder: Encoder,
    cipher: Option<Cipher>,
    /// Bytes written after the local header so far
    raw_written: u64,
    buffer: Vec<u8>,
}

enum State {
    Open,
    EntryOpen(Box<PendingEntry>),
    Finalized,
}

/// A ZIP archive being written
///
/// ```no_run
/// # use std::io::Write;
/// # use ziprw::*;
/// let file = LocalFile::open("foo.zip", OpenMode::Create)?;
/// let mut archive = ZipWriter::new(file);
/// archive.start_entry("hello.txt", &EntryOptions::default())?;
/// archive.write(b"Hello, world!")?;
/// archive.close_entry()?;
/// archive.close()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
///
/// Dropping a writer without closing it leaves an archive with no central directory,
/// which only [`repair`](../repair/fn.repair.html) can make sense of.
pub struct ZipWriter<S: Storage> {
    storage: S,
    /// Central directory records for entries we've written, in order
    records: Vec<CentralRecord>,
    /// When appending, the central directory we found, verbatim
    existing_directory: Vec<u8>,
    existing_entries: u64,
    /// Bytes in front of the archive that its offsets don't count
    archive_offset: u64,
    comment: Vec<u8>,
    /// Where a failed `close` started writing the central directory,
    /// so another try can start over from there
    close_position: Option<u64>,
    state: State,
}

impl<S: Storage> ZipWriter<S> {
    /// Starts a new archive in the given storage.
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            records: Vec::new(),
            existing_directory: Vec::new(),
            existing_entries: 0,
            archive_offset: 0,
            comment: Vec::new(),
            close_position: None,
            state: State::Open,
        }
    }

    /// Opens an existing archive to add entries to it.
    ///
    /// New entries are written where the old central directory was;
    /// its records are kept, and written back out (with the new ones) on close.
    pub fn append(mut storage: S) -> ZipResult<Self> {
        if storage.disk_count() > 1 {
            return Err(ZipError::UnsupportedFeature(
                "Can't append to split archives".to_owned(),
            ));
        }
        let directory = read_central_directory(&mut storage)?;
        storage.seek(SeekFrom::Start(directory.start))?;
        debug!(
            "Appending to an archive of {} entries",
            directory.entries.len()
        );
        Ok(Self {
            storage,
            records: Vec::new(),
            existing_entries: directory.entries.len() as u64,
            existing_directory: directory.raw,
            archive_offset: directory.archive_offset,
            comment: directory.comment,
            close_position: None,
            state: State::Open,
        })
    }

    /// Sets the archive comment written on close.
    pub fn set_comment(&mut self, comment: &str) -> ZipResult<()> {
        if comment.len() > u16::MAX as usize {
            return Err(ZipError::UnsupportedFeature(format!(
                "Archive comment of {} bytes",
                comment.len()
            )));
        }
        self.comment = comment.as_bytes().to_vec();
        Ok(())
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn check_open(&self) -> ZipResult<()> {
        match self.state {
            State::Open => Ok(()),
            State::EntryOpen(_) => Err(ZipError::InvalidState("An entry is already open")),
            State::Finalized => Err(ZipError::InvalidState("Archive is finalized")),
        }
    }

    /// Backs up over a partial central directory left by a failed `close`.
    fn discard_failed_close(&mut self) -> ZipResult<()> {
        if let Some(position) = self.close_position.take() {
            self.storage.seek(SeekFrom::Start(position))?;
        }
        Ok(())
    }

    /// Starts a new volume if `len` bytes won't fit in the current one.
    fn ensure_room(&mut self, len: usize) -> ZipResult<()> {
        if let Some(left) = self.storage.volume_space_left() {
            if left < len as u64 {
                self.storage.start_next_volume()?;
                debug!("Started volume {}", self.storage.current_disk());
            }
        }
        Ok(())
    }

    /// Where we are, as a (disk, offset on that disk) pair.
    fn here(&mut self) -> ZipResult<(u32, u64)> {
        let position = self.storage.stream_position()?;
        let disk = self.storage.current_disk();
        let disk_start = self.storage.disk_start(disk)?;
        Ok((disk, position - disk_start - self.archive_offset))
    }

    /// Starts a new entry, writing its local header.
    pub fn start_entry(&mut self, name: &str, options: &EntryOptions) -> ZipResult<()> {
        self.check_open()?;
        if name.len() > u16::MAX as usize || options.comment.len() > u16::MAX as usize {
            return Err(ZipError::UnsupportedFeature(format!(
                "Name or comment of {} is too long",
                name
            )));
        }
        let encoder = Encoder::new(options.compression, options.level)?;
        self.discard_failed_close()?;

        let split = self.storage.volume_space_left().is_some();
        let streaming = options.size.is_none() || options.encryption.is_some() || split;
        let local_zip64 =
            options.large_file || options.size.map_or(false, |s| s >= u32::MAX as u64);

        let mut flags = options.level_flags();
        if !name.is_ascii() || !options.comment.is_ascii() {
            flags |= spec::FLAG_UTF8;
        }
        if streaming {
            flags |= spec::FLAG_DATA_DESCRIPTOR;
        }
        if options.encryption.is_some() {
            flags |= spec::FLAG_ENCRYPTED;
        }

        let mut version_needed = spec::VERSION_DEFAULT;
        if local_zip64 {
            version_needed = spec::VERSION_ZIP64;
        }
        let mut method = options.compression.to_u16();
        let mut extra = Vec::new();
        if let Some(modified) = options.unix_modified {
            spec::write_timestamp_extra(&mut extra, modified);
        }
        if let Some((EncryptionMethod::Aes(strength), _)) = &options.encryption {
            spec::write_aes_extra(
                &mut extra,
                &spec::AesExtraField {
                    vendor_version: 2,
                    strength: *strength,
                    compression_method: method,
                },
            );
            method = spec::AES_METHOD;
            version_needed = spec::VERSION_AES;
        }

        let is_dir = name.ends_with('/');
        let external_attributes = options.external_attributes.unwrap_or_else(|| {
            let mode = options.unix_mode.unwrap_or(if is_dir {
                DEFAULT_DIR_MODE
            } else {
                DEFAULT_FILE_MODE
            });
            (mode << 16) | if is_dir { DOS_DIRECTORY } else { 0 }
        });
        let (dos_time, dos_date) = spec::to_msdos(&options.modified);

        let mut record = CentralRecord {
            name: name.as_bytes().to_vec(),
            version_made_by: System::unix_source_version(VERSION_MADE_BY),
            version_needed,
            flags,
            method,
            dos_time,
            dos_date,
            crc32: 0,
            compressed_size: 0,
            size: 0,
            disk: 0,
            header_offset: 0,
            internal_attributes: options.internal_attributes,
            external_attributes,
            extra,
            comment: options.comment.as_bytes().to_vec(),
        };

        let header = local_header(&record, local_zip64);
        self.ensure_room(header.len())?;
        let header_position = self.storage.stream_position()?;
        let (disk, header_offset) = self.here()?;
        record.disk = disk;
        record.header_offset = header_offset;
        self.storage.write_all(&header)?;

        let mut raw_written = 0;
        let cipher = match &options.encryption {
            None => None,
            Some((EncryptionMethod::ZipCrypto, password)) => {
                // Streamed, so the CRC isn't known: check against the time instead.
                let (keys, encryption_header) =
                    ZipCryptoKeys::start(password.as_bytes(), (dos_time >> 8) as u8);
                self.storage.write_all(&encryption_header)?;
                raw_written += encryption_header.len() as u64;
                Some(Cipher::ZipCrypto(keys))
            }
            #[cfg(feature = "aes-crypto")]
            Some((EncryptionMethod::Aes(strength), password)) => {
                let (cipher, salt_and_verifier) = AesCipher::start(*strength, password.as_bytes());
                self.storage.write_all(&salt_and_verifier)?;
                raw_written += salt_and_verifier.len() as u64;
                Some(Cipher::Aes(Box::new(cipher)))
            }
            #[cfg(not(feature = "aes-crypto"))]
            Some((EncryptionMethod::Aes(_), _)) => {
                return Err(ZipError::UnsupportedFeature(
                    "AES encryption support wasn't built".to_owned(),
                ));
            }
        };

        debug!(
            "Started {} at disk {} offset {}{}",
            name,
            disk,
            header_offset,
            if streaming { " (streaming)" } else { "" }
        );
        self.state = State::EntryOpen(Box::new(PendingEntry {
            record,
            header_position,
            local_zip64,
            streaming,
            declared_size: options.size,
            encoder,
            cipher,
            raw_written,
            buffer: Vec::new(),
        }));
        Ok(())
    }

    /// Compresses and writes data to the open entry.
    pub fn write(&mut self, data: &[u8]) -> ZipResult<()> {
        let pending = match &mut self.state {
            State::EntryOpen(pending) => pending,
            State::Open => return Err(ZipError::InvalidState("No entry is open")),
            State::Finalized => return Err(ZipError::InvalidState("Archive is finalized")),
        };
        for chunk in data.chunks(CHUNK) {
            pending.buffer.clear();
            pending.encoder.feed(chunk, &mut pending.buffer)?;
            if let Some(cipher) = &mut pending.cipher {
                cipher.encrypt(&mut pending.buffer);
            }
            self.storage.write_all(&pending.buffer)?;
            pending.raw_written += pending.buffer.len() as u64;
        }
        Ok(())
    }

    /// An `io::Write` into the open entry
    pub fn entry_writer(&mut self) -> ZipResult<EntryWriter<'_, S>> {
        match self.state {
            State::EntryOpen(_) => Ok(EntryWriter { archive: self }),
            _ => Err(ZipError::InvalidState("No entry is open")),
        }
    }

    /// Finishes the open entry: flushes the compressor,
    /// writes the data descriptor or patches the local header,
    /// and adds the entry to the central directory.
    ///
    /// If this fails, the entry is left out of the central directory,
    /// and the archive is otherwise unharmed.
    pub fn close_entry(&mut self) -> ZipResult<()> {
        let pending = match std::mem::replace(&mut self.state, State::Open) {
            State::EntryOpen(pending) => pending,
            other => {
                self.state = other;
                return Err(ZipError::InvalidState("No entry is open"));
            }
        };
        self.finish_entry(*pending)
    }

    fn finish_entry(&mut self, mut pending: PendingEntry) -> ZipResult<()> {
        pending.buffer.clear();
        pending.encoder.finish(&mut pending.buffer)?;
        if let Some(cipher) = &mut pending.cipher {
            cipher.encrypt(&mut pending.buffer);
        }
        self.storage.write_all(&pending.buffer)?;
        pending.raw_written += pending.buffer.len() as u64;

        let mut crc32 = pending.encoder.crc32();
        #[cfg(feature = "aes-crypto")]
        if let Some(Cipher::Aes(aes)) = &pending.cipher {
            let auth_code = aes.auth_code();
            self.storage.write_all(&auth_code)?;
            pending.raw_written += auth_code.len() as u64;
            // AE-2
            crc32 = 0;
        }

        let size = pending.encoder.total_in();
        let compressed_size = pending.raw_written;
        let mut record = pending.record;

        if let Some(declared) = pending.declared_size {
            if declared != size {
                warn!(
                    "{} was declared as {} bytes but {} were written; leaving it out",
                    String::from_utf8_lossy(&record.name),
                    declared,
                    size
                );
                return Err(ZipError::InvalidState(
                    "Entry size doesn't match the size declared for it",
                ));
            }
        }
        if !pending.local_zip64 && (size >= u32::MAX as u64 || compressed_size >= u32::MAX as u64)
        {
            return Err(ZipError::UnsupportedFeature(format!(
                "{} is over 4 GiB; it needs the large_file option or a declared size",
                String::from_utf8_lossy(&record.name)
            )));
        }

        record.crc32 = crc32;
        record.size = size;
        record.compressed_size = compressed_size;

        if pending.streaming {
            let descriptor = spec::DataDescriptor {
                crc32,
                compressed_size,
                uncompressed_size: size,
            };
            let mut bytes = Vec::new();
            descriptor.write(&mut bytes, pending.local_zip64);
            self.ensure_room(bytes.len())?;
            self.storage.write_all(&bytes)?;
        } else {
            let header = local_header(&record, pending.local_zip64);
            let resume = self.storage.stream_position()?;
            self.storage.seek(SeekFrom::Start(pending.header_position))?;
            self.storage.write_all(&header)?;
            self.storage.seek(SeekFrom::Start(resume))?;
        }

        debug!(
            "Finished {}: {} bytes, {} compressed, CRC {:#010x}",
            String::from_utf8_lossy(&record.name),
            size,
            compressed_size,
            crc32
        );
        self.records.push(record);
        Ok(())
    }

    /// Copies an already-compressed entry into the archive, flags and all.
    pub(crate) fn copy_raw_entry<R: Read + ?Sized>(
        &mut self,
        entry: &RawEntry,
        data: &mut R,
    ) -> ZipResult<()> {
        self.check_open()?;
        self.discard_failed_close()?;
        let streamed = spec::has_data_descriptor(entry.flags);
        let zip64 = entry.size >= u32::MAX as u64 || entry.compressed_size >= u32::MAX as u64;

        let mut record = CentralRecord {
            name: entry.name.to_vec(),
            version_made_by: System::unix_source_version(VERSION_MADE_BY),
            version_needed: if zip64 {
                entry.version_needed.max(spec::VERSION_ZIP64)
            } else {
                entry.version_needed
            },
            flags: entry.flags,
            method: entry.method,
            dos_time: entry.dos_time,
            dos_date: entry.dos_date,
            crc32: entry.crc32,
            compressed_size: entry.compressed_size,
            size: entry.size,
            disk: 0,
            header_offset: 0,
            internal_attributes: 0,
            external_attributes: 0,
            extra: entry.extra.to_vec(),
            comment: Vec::new(),
        };

        // Streamed entries keep zeroes in the local header, like they had.
        let header = if streamed {
            let mut blank = record.clone();
            blank.crc32 = 0;
            blank.size = 0;
            blank.compressed_size = 0;
            local_header(&blank, zip64)
        } else {
            local_header(&record, zip64)
        };
        self.ensure_room(header.len())?;
        let (disk, header_offset) = self.here()?;
        record.disk = disk;
        record.header_offset = header_offset;
        self.storage.write_all(&header)?;

        let copied = io::copy(&mut data.take(entry.compressed_size), &mut self.storage)?;
        if copied != entry.compressed_size {
            return Err(ZipError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Entry data ended early",
            )));
        }

        if streamed {
            let mut bytes = Vec::new();
            spec::DataDescriptor {
                crc32: entry.crc32,
                compressed_size: entry.compressed_size,
                uncompressed_size: entry.size,
            }
            .write(&mut bytes, zip64);
            self.ensure_room(bytes.len())?;
            self.storage.write_all(&bytes)?;
        }
        self.records.push(record);
        Ok(())
    }

    /// Finalizes the archive: writes the central directory and end records,
    /// then closes the storage.
    ///
    /// An open entry is closed first.
    /// If writing the directory fails, every entry is still remembered,
    /// and calling this again starts the directory over.
    /// Once it succeeds, calling it again (or writing anything after) is an error.
    pub fn close(&mut self) -> ZipResult<()> {
        match self.state {
            State::Finalized => return Err(ZipError::InvalidState("Archive is already finalized")),
            State::EntryOpen(_) => self.close_entry()?,
            State::Open => {}
        }

        match self.close_position {
            Some(position) => {
                debug!("Rewriting the central directory from {}", position);
                self.storage.seek(SeekFrom::Start(position))?;
            }
            None => self.close_position = Some(self.storage.stream_position()?),
        }

        let existing = std::mem::take(&mut self.existing_directory);
        let records = std::mem::take(&mut self.records);
        let written = self.write_directory(&existing, &records);
        self.existing_directory = existing;
        self.records = records;
        written?;

        self.state = State::Finalized;
        self.storage.close()?;
        Ok(())
    }

    /// Writes the central directory and end records,
    /// then cuts off anything after them.
    fn write_directory(&mut self, existing: &[u8], records: &[CentralRecord]) -> ZipResult<()> {
        let mut directory_start = None;
        let mut entries_by_disk: Vec<u32> = Vec::new();
        if !existing.is_empty() {
            self.ensure_room(existing.len())?;
            directory_start = Some((self.here()?, self.storage.stream_position()?));
            self.storage.write_all(existing)?;
            let disk = self.storage.current_disk();
            entries_by_disk.extend((0..self.existing_entries).map(|_| disk));
        }
        let mut bytes = Vec::new();
        for record in records {
            bytes.clear();
            record.write(&mut bytes);
            self.ensure_room(bytes.len())?;
            if directory_start.is_none() {
                directory_start = Some((self.here()?, self.storage.stream_position()?));
            }
            self.storage.write_all(&bytes)?;
            entries_by_disk.push(self.storage.current_disk());
        }

        // With nothing in the directory, it starts (and ends) right here.
        let end_records = 56 + 20 + spec::EndOfCentralDirectory::SIZE + self.comment.len();
        if directory_start.is_none() {
            self.ensure_room(end_records)?;
            directory_start = Some((self.here()?, self.storage.stream_position()?));
        }
        let ((directory_disk, directory_offset), directory_position) =
            directory_start.ok_or(ZipError::InvalidState("No central directory position"))?;
        let directory_size = self.storage.stream_position()? - directory_position;

        self.ensure_room(end_records)?;
        let (end_disk, zip64_eocdr_offset) = self.here()?;
        let entries = entries_by_disk.len() as u64;
        let entries_on_this_disk = entries_by_disk.iter().filter(|d| **d == end_disk).count() as u64;

        let needs_zip64 = entries >= u16::MAX as u64
            || directory_size >= u32::MAX as u64
            || directory_offset >= u32::MAX as u64
            || end_disk >= u16::MAX as u32;

        let mut end = Vec::new();
        if needs_zip64 {
            let zip64_eocdr = spec::Zip64EndOfCentralDirectory {
                source_version: System::unix_source_version(VERSION_MADE_BY),
                minimum_extract_version: spec::VERSION_ZIP64,
                disk_number: end_disk,
                disk_with_central_directory: directory_disk,
                entries_on_this_disk,
                entries,
                central_directory_size: directory_size,
                central_directory_offset: directory_offset,
            };
            trace!("{:?}", zip64_eocdr);
            zip64_eocdr.write(&mut end);
            let locator = spec::Zip64EndOfCentralDirectoryLocator {
                disk_with_central_directory: end_disk,
                zip64_eocdr_offset,
                disks: end_disk + 1,
            };
            trace!("{:?}", locator);
            locator.write(&mut end);
        }
        let eocdr = spec::EndOfCentralDirectory {
            disk_number: u16_or_sentinel(end_disk as u64),
            disk_with_central_directory: u16_or_sentinel(directory_disk as u64),
            entries_on_this_disk: u16_or_sentinel(entries_on_this_disk),
            entries: u16_or_sentinel(entries),
            central_directory_size: u32_or_sentinel(directory_size),
            central_directory_offset: u32_or_sentinel(directory_offset),
            file_comment: &self.comment,
        };
        trace!("{:?}", eocdr);
        eocdr.write(&mut end);
        self.storage.write_all(&end)?;

        // Appending (or an earlier failed close) may leave bytes past our end.
        let end_position = self.storage.stream_position()?;
        self.storage.truncate(end_position)?;
        self.storage.flush()?;
        debug!(
            "Finalized archive: {} entries, {} byte central directory",
            entries, directory_size
        );
        Ok(())
    }

    /// Finalizes the archive (if it isn't already) and hands back the storage.
    pub fn finish(mut self) -> ZipResult<S> {
        if !matches!(self.state, State::Finalized) {
            self.close()?;
        }
        Ok(self.storage)
    }
}

/// Writes into the open entry through `std::io::Write`
pub struct EntryWriter<'a, S: Storage> {
    archive: &'a mut ZipWriter<S>,
}

impl<S: Storage> Write for EntryWriter<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.archive.write(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
