//! Tools for reading a ZIP archive.
//!
//! To start reading an archive, create a [`ZipReader`] from a [`Storage`].
//! It finds and parses the central directory up front,
//! then lets you open one entry at a time and read it out.
//!
//! [`ZipReader`]: struct.ZipReader.html
//! [`Storage`]: ../storage/trait.Storage.html

use std::io::{self, Read, Seek, SeekFrom};

use camino::Utf8Path;
use chrono::{DateTime, NaiveDateTime, Utc};
use log::*;

use crate::arch::usize;
use crate::codec::{CompressionMethod, Decoder};
use crate::crypto::*;
use crate::result::*;
use crate::spec;
use crate::storage::Storage;

#[cfg(feature = "aes-crypto")]
use crate::aes::{AesCipher, AUTH_CODE_LEN, PASSWORD_VERIFIER_LEN};

/// Raw bytes pulled from storage per read
const CHUNK: usize = 32 * 1024;

/// Metadata for a file or directory in the archive,
/// retrieved from its central directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Position of the entry in the central directory
    pub index: usize,

    /// The provided path of the file.
    /// Decoded from UTF-8 if the archive says so, CP437 otherwise.
    pub name: String,

    /// The name exactly as stored
    pub(crate) raw_name: Vec<u8>,

    /// Uncompressed size of the file in bytes
    pub size: u64,

    /// Compressed size of the file in bytes,
    /// including any encryption header and trailer
    pub compressed_size: u64,

    /// Compression algorithm used to store the file
    pub compression_method: CompressionMethod,

    /// The CRC-32 of the decompressed file
    pub crc32: u32,

    /// How the file is encrypted, if it is
    pub encryption: Option<Encryption>,

    /// The date and time the file was last modified, in MS-DOS's two-second resolution
    pub last_modified: NaiveDateTime,

    /// The modification time from the extended timestamp field, if present
    pub unix_modified: Option<DateTime<Utc>>,

    /// Unix mode bits, if the file was archived in a Unix OS.
    ///
    /// This library does _not_ try to convert DOS permission bits into
    /// roughly-equivalent Unix mode bits, or do other cross-OS handwaving.
    pub unix_mode: Option<u32>,

    pub external_attributes: u32,

    pub internal_attributes: u16,

    /// The entry's comment, if any
    pub comment: String,

    /// The disk (volume) the entry's local header starts on
    pub disk_number: u32,

    pub(crate) flags: u16,

    pub(crate) dos_time: u16,

    /// The offset to the local file header, relative to its disk
    pub(crate) header_offset: u64,
}

impl FileMetadata {
    /// Returns true if the given entry is a directory
    pub fn is_dir(&self) -> bool {
        // Path::ends_with() doesn't consider separators,
        // so we need a different approach.
        self.size == 0 && self.name.ends_with('/')
    }

    /// Returns true if the given entry is a file
    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }

    /// The entry's name as a path.
    /// Nothing is validated: it could be absolute, or full of `..`s.
    pub fn path(&self) -> &Utf8Path {
        Utf8Path::new(&self.name)
    }

    /// The entry's name, exactly as it was stored
    pub fn raw_name(&self) -> &[u8] {
        &self.raw_name
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    /// True if the entry was streamed, with its sizes in a trailing data descriptor
    pub fn has_data_descriptor(&self) -> bool {
        spec::has_data_descriptor(self.flags)
    }

    /// Where the entry's local header starts, relative to its disk
    pub fn header_offset(&self) -> u64 {
        self.header_offset
    }
}

/// Seeks to the given position and reads exactly `len` bytes.
pub(crate) fn read_at<S: Storage + ?Sized>(
    storage: &mut S,
    position: u64,
    len: usize,
) -> io::Result<Vec<u8>> {
    let mut buf = vec![0; len];
    storage.seek(SeekFrom::Start(position))?;
    storage.read_exact(&mut buf)?;
    Ok(buf)
}

/// Adds an offset read from the archive to a position, refusing to wrap.
fn offset_by(base: u64, offset: u64, what: &str) -> ZipResult<u64> {
    base.checked_add(offset).ok_or_else(|| {
        ZipError::CorruptDirectory(format!("{what} at offset {offset} is out of range"))
    })
}

fn truncated(what: &str) -> impl FnOnce(io::Error) -> ZipError + '_ {
    move |e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ZipError::CorruptDirectory(format!("{what} runs past the end of the archive"))
        } else {
            ZipError::Io(e)
        }
    }
}

/// Everything we learn from the back of an archive
pub(crate) struct CentralDirectory {
    pub entries: Vec<FileMetadata>,
    /// The directory's records, exactly as stored
    pub raw: Vec<u8>,
    pub comment: Vec<u8>,
    /// Logical position the directory starts at
    pub start: u64,
    /// Bytes of something-other-than-ZIP in front of the archive
    pub archive_offset: u64,
}

/// Finds, reads, and parses an archive's central directory.
pub(crate) fn read_central_directory<S: Storage + ?Sized>(
    storage: &mut S,
) -> ZipResult<CentralDirectory> {
    let len = storage.size()?;
    // The EOCDR is at the very end, save a comment of up to 64K.
    let window_len = len.min((spec::EndOfCentralDirectory::SIZE + u16::MAX as usize) as u64);
    let window_start = len - window_len;
    let window = read_at(storage, window_start, usize(window_len)?)?;

    let eocdr_posit = spec::find_eocdr(&window).ok_or(ZipError::NotAnArchive(
        "Couldn't find End Of Central Directory Record",
    ))?;
    let eocdr = spec::EndOfCentralDirectory::parse(&window[eocdr_posit..])?;
    trace!("{:?}", eocdr);
    let eocdr_position = window_start + eocdr_posit as u64;

    let split = storage.disk_count() > 1;
    if !split && (eocdr.disk_number != 0 || eocdr.disk_with_central_directory != 0) {
        return Err(ZipError::UnsupportedFeature(format!(
            "Archive is split across {} disks; open it with its volumes",
            eocdr.disk_number as u32 + 1
        )));
    }

    let mut entry_count = eocdr.entries as u64;
    let mut directory_size = eocdr.central_directory_size as u64;
    let mut directory_offset = eocdr.central_directory_offset as u64;
    let mut directory_disk = eocdr.disk_with_central_directory as u32;
    // Whatever immediately follows the central directory
    let mut directory_end = eocdr_position;

    let locator_size = spec::Zip64EndOfCentralDirectoryLocator::size_in_file() as u64;
    let locator = match eocdr_position.checked_sub(locator_size) {
        Some(locator_position) => {
            let bytes = read_at(storage, locator_position, locator_size as usize)?;
            spec::Zip64EndOfCentralDirectoryLocator::parse(&bytes)
        }
        None => None,
    };
    if let Some(locator) = locator {
        trace!("{:?}", locator);

        // Search for the zip64 EOCDR, from its nominal starting position
        // to the end of where it could be.
        let search_start = offset_by(
            storage.disk_start(locator.disk_with_central_directory)?,
            locator.zip64_eocdr_offset,
            "Zip64 End Of Central Directory Record",
        )?;
        let search_end = eocdr_position - locator_size;
        if search_start > search_end {
            return Err(ZipError::CorruptDirectory(format!(
                "Zip64 End Of Central Directory Record offset {} is past its locator",
                search_start
            )));
        }
        let search_space = read_at(storage, search_start, usize(search_end - search_start)?)?;
        let zip64_eocdr_posit = spec::find_zip64_eocdr(&search_space)?;
        let zip64_eocdr = spec::Zip64EndOfCentralDirectory::parse(&search_space[zip64_eocdr_posit..])?;
        trace!("{:?}", zip64_eocdr);

        entry_count = zip64_eocdr.entries;
        directory_size = zip64_eocdr.central_directory_size;
        directory_offset = zip64_eocdr.central_directory_offset;
        directory_disk = zip64_eocdr.disk_with_central_directory;
        directory_end = search_start + zip64_eocdr_posit as u64;
    }

    let nominal_start = offset_by(
        storage.disk_start(directory_disk)?,
        directory_offset,
        "Central directory",
    )?;
    // Zip files can be prepended by arbitrary junk (self-extractors, say),
    // so all the given positions might be off.
    // The directory ends where the next record starts; work backwards from that.
    let archive_offset = if split {
        0
    } else {
        directory_end
            .checked_sub(directory_size)
            .and_then(|actual| actual.checked_sub(nominal_start))
            .ok_or_else(|| {
                ZipError::CorruptDirectory(format!(
                    "Central directory of {} bytes at offset {} doesn't fit before its end record",
                    directory_size, directory_offset
                ))
            })?
    };
    if archive_offset != 0 {
        warn!("{} bytes of data precede the archive", archive_offset);
    }
    let start = nominal_start + archive_offset;
    if start.saturating_add(directory_size) > len {
        return Err(ZipError::CorruptDirectory(format!(
            "Central directory of {} bytes at {} runs past the end of the archive",
            directory_size, start
        )));
    }
    trace!(
        "{} entries in {} bytes at offset {}",
        entry_count,
        directory_size,
        start
    );

    let raw = read_at(storage, start, usize(directory_size)?)
        .map_err(truncated("Central directory"))?;

    // Don't trust the count to size an allocation.
    let max_possible = raw.len() / spec::CentralDirectoryEntry::FIXED_SIZE;
    let mut entries = Vec::with_capacity(usize(entry_count)?.min(max_possible));
    let mut central_directory = raw.as_slice();
    for index in 0..usize(entry_count)? {
        let dir_entry = spec::CentralDirectoryEntry::parse_and_consume(&mut central_directory)?;
        trace!("{:?}", dir_entry);

        let file_metadata = FileMetadata::from_cde(&dir_entry, index)?;
        debug!("{:?}", file_metadata);
        entries.push(file_metadata);
    }
    if !central_directory.is_empty() {
        debug!(
            "{} bytes follow the last central directory entry",
            central_directory.len()
        );
    }

    Ok(CentralDirectory {
        entries,
        comment: eocdr.file_comment.to_vec(),
        raw,
        start,
        archive_offset,
    })
}

enum State {
    Opened,
    EntryOpen(Box<EntryCursor>),
    Closed,
}

/// A ZIP archive to be read
///
/// Entries are read one at a time: open one with [`open_entry`],
/// [`read`] it out, then [`close_entry`] it before opening the next.
///
/// [`open_entry`]: struct.ZipReader.html#method.open_entry
/// [`read`]: struct.ZipReader.html#method.read
/// [`close_entry`]: struct.ZipReader.html#method.close_entry
pub struct ZipReader<S: Storage> {
    storage: S,
    /// A list of entries from the ZIP's central directory
    entries: Vec<FileMetadata>,
    comment: Vec<u8>,
    archive_offset: u64,
    password: Option<Password>,
    state: State,
}

impl<S: Storage> ZipReader<S> {
    /// Opens an archive, reading its central directory.
    ///
    /// ```no_run
    /// # use ziprw::*;
    /// let file = LocalFile::open("foo.zip", OpenMode::Read)?;
    /// let mut archive = ZipReader::new(file)?;
    /// for entry in archive.entries() {
    ///     println!("{} ({} bytes)", entry.name, entry.size);
    /// }
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn new(mut storage: S) -> ZipResult<Self> {
        let directory = read_central_directory(&mut storage)?;
        debug!(
            "Opened archive with {} entries",
            directory.entries.len()
        );
        Ok(Self {
            storage,
            entries: directory.entries,
            comment: directory.comment,
            archive_offset: directory.archive_offset,
            password: None,
            state: State::Opened,
        })
    }

    /// Returns the entries found in the ZIP archive's central directory,
    /// in the order they're stored.
    ///
    /// No effort is made to deduplicate or otherwise validate these entries.
    pub fn entries(&self) -> &[FileMetadata] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The archive's comment, as stored
    pub fn comment(&self) -> &[u8] {
        &self.comment
    }

    /// How many bytes of something else precede the archive
    pub fn archive_offset(&self) -> u64 {
        self.archive_offset
    }

    /// The index of the first entry with the given name
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    /// The first entry with the given name.
    /// ZIP allows duplicates; get at the others with [`entries`](#method.entries).
    pub fn by_name(&self, name: &str) -> Option<&FileMetadata> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Sets the password used for encrypted entries
    /// when `open_entry` isn't given one.
    pub fn set_password(&mut self, password: Option<&[u8]>) {
        self.password = password.map(Password::new);
    }

    fn check_open(&self) -> ZipResult<()> {
        match self.state {
            State::Opened => Ok(()),
            State::EntryOpen(_) => Err(ZipError::InvalidState("An entry is already open")),
            State::Closed => Err(ZipError::InvalidState("Archive is closed")),
        }
    }

    /// Opens the entry at the given index for reading.
    ///
    /// `password` overrides the one from [`set_password`](#method.set_password).
    /// It's ignored if the entry isn't encrypted.
    pub fn open_entry(&mut self, index: usize, password: Option<&[u8]>) -> ZipResult<()> {
        self.check_open()?;
        let metadata = self
            .entries
            .get(index)
            .ok_or_else(|| ZipError::NoSuchEntry(format!("#{}", index)))?;
        debug!("Opening {}", metadata.name);

        if let CompressionMethod::Unsupported(method) = metadata.compression_method {
            return Err(ZipError::UnsupportedFeature(format!(
                "{} uses compression method {}",
                metadata.name, method
            )));
        }
        let header_position = offset_by(
            self.storage.disk_start(metadata.disk_number)?,
            metadata.header_offset,
            &metadata.name,
        )
        .and_then(|p| offset_by(p, self.archive_offset, &metadata.name))?;
        let mut header = read_at(
            &mut self.storage,
            header_position,
            spec::LocalFileHeader::FIXED_SIZE,
        )
        .map_err(truncated("Local file header"))?;
        if header[..4] != spec::LOCAL_FILE_HEADER_MAGIC {
            return Err(ZipError::CorruptDirectory(format!(
                "No local file header for {} at offset {}",
                metadata.name, metadata.header_offset
            )));
        }
        let mut rest = vec![0; spec::LocalFileHeader::variable_length(&header)];
        self.storage
            .read_exact(&mut rest)
            .map_err(truncated("Local file header"))?;
        header.extend_from_slice(&rest);
        let local_header = spec::LocalFileHeader::parse_and_consume(&mut header.as_slice())?;
        trace!("{:?}", local_header);
        #[cfg(feature = "check-local-metadata")]
        spec::validate_local_header(metadata, &local_header)?;

        let data_position = offset_by(
            header_position,
            local_header.size_in_file() as u64,
            &metadata.name,
        )?;
        let password = password.or_else(|| self.password.as_ref().map(Password::as_bytes));

        let mut cursor = EntryCursor {
            index,
            decoder: Decoder::new(metadata.compression_method, 0)?,
            cipher: None,
            position: data_position,
            raw_remaining: metadata.compressed_size,
            check_crc: true,
            auth_code_position: None,
            buffer: Vec::new(),
            done: false,
            failure: None,
        };

        match metadata.encryption {
            None => {
                if password.is_some() {
                    debug!("{} isn't encrypted; ignoring password", metadata.name);
                }
            }
            Some(Encryption::ZipCrypto) => {
                let password =
                    password.ok_or_else(|| ZipError::BadPassword(metadata.name.clone()))?;
                let mut encryption_header = [0u8; ZIPCRYPTO_HEADER_LEN];
                if cursor.raw_remaining < ZIPCRYPTO_HEADER_LEN as u64 {
                    return Err(ZipError::CorruptDirectory(format!(
                        "{} is too small to hold its encryption header",
                        metadata.name
                    )));
                }
                self.storage
                    .read_exact(&mut encryption_header)
                    .map_err(truncated("Encryption header"))?;
                // Streamed entries can't know their CRC up front,
                // so they check against the modification time instead.
                // Be lenient: some writers use the CRC anyways.
                let crc_check = (metadata.crc32 >> 24) as u8;
                let time_check = (metadata.dos_time >> 8) as u8;
                let checks: &[u8] = if metadata.has_data_descriptor() {
                    &[time_check, crc_check]
                } else {
                    &[crc_check]
                };
                let keys = ZipCryptoKeys::open(password, &encryption_header, checks)
                    .ok_or_else(|| ZipError::BadPassword(metadata.name.clone()))?;
                cursor.cipher = Some(Cipher::ZipCrypto(keys));
                cursor.position += ZIPCRYPTO_HEADER_LEN as u64;
                cursor.raw_remaining -= ZIPCRYPTO_HEADER_LEN as u64;
            }
            #[cfg(feature = "aes-crypto")]
            Some(Encryption::Aes {
                strength,
                vendor_version,
            }) => {
                let password =
                    password.ok_or_else(|| ZipError::BadPassword(metadata.name.clone()))?;
                let salt_len = strength.salt_len();
                let overhead = (salt_len + PASSWORD_VERIFIER_LEN + AUTH_CODE_LEN) as u64;
                if cursor.raw_remaining < overhead {
                    return Err(ZipError::CorruptDirectory(format!(
                        "{} is too small to hold its encryption header",
                        metadata.name
                    )));
                }
                let mut salt = vec![0u8; salt_len + PASSWORD_VERIFIER_LEN];
                self.storage
                    .read_exact(&mut salt)
                    .map_err(truncated("Encryption header"))?;
                let (cipher, verifier) = AesCipher::new(strength, password, &salt[..salt_len]);
                if verifier[..] != salt[salt_len..] {
                    return Err(ZipError::BadPassword(metadata.name.clone()));
                }
                cursor.cipher = Some(Cipher::Aes(Box::new(cipher)));
                cursor.position += (salt_len + PASSWORD_VERIFIER_LEN) as u64;
                cursor.raw_remaining -= overhead;
                cursor.auth_code_position =
                    Some(offset_by(cursor.position, cursor.raw_remaining, &metadata.name)?);
                // AE-2 zeroes the CRC and relies on the authentication code.
                cursor.check_crc = vendor_version != 2;
            }
            #[cfg(not(feature = "aes-crypto"))]
            Some(Encryption::Aes { .. }) => {
                return Err(ZipError::UnsupportedFeature(format!(
                    "{} is AES encrypted, and AES support wasn't built",
                    metadata.name
                )));
            }
            Some(Encryption::Strong) => {
                return Err(ZipError::UnsupportedFeature(format!(
                    "{} uses strong encryption",
                    metadata.name
                )));
            }
        }

        cursor.decoder = Decoder::new(metadata.compression_method, cursor.raw_remaining)?;
        self.state = State::EntryOpen(Box::new(cursor));
        Ok(())
    }

    /// Opens the first entry with the given name for reading.
    pub fn open_entry_by_name(&mut self, name: &str, password: Option<&[u8]>) -> ZipResult<()> {
        let index = self
            .index_of(name)
            .ok_or_else(|| ZipError::NoSuchEntry(name.to_owned()))?;
        self.open_entry(index, password)
    }

    /// Reads decompressed bytes from the open entry.
    ///
    /// Returns `Ok(0)` at the end of the entry.
    /// Integrity is checked when the end is reached, so a corrupted entry
    /// fails with [`ZipError::ChecksumMismatch`] only after its bytes are returned.
    ///
    /// [`ZipError::ChecksumMismatch`]: ../result/enum.ZipError.html#variant.ChecksumMismatch
    pub fn read(&mut self, buf: &mut [u8]) -> ZipResult<usize> {
        let cursor = match &mut self.state {
            State::EntryOpen(cursor) => cursor,
            _ => return Err(ZipError::InvalidState("No entry is open")),
        };
        let metadata = &self.entries[cursor.index];
        cursor.read(&mut self.storage, metadata, buf)
    }

    /// An `io::Read` over the open entry
    pub fn entry_reader(&mut self) -> ZipResult<EntryReader<'_, S>> {
        match self.state {
            State::EntryOpen(_) => Ok(EntryReader { archive: self }),
            _ => Err(ZipError::InvalidState("No entry is open")),
        }
    }

    /// Closes the open entry. Stopping partway through is fine.
    pub fn close_entry(&mut self) -> ZipResult<()> {
        match self.state {
            State::EntryOpen(_) => {
                self.state = State::Opened;
                Ok(())
            }
            _ => Err(ZipError::InvalidState("No entry is open")),
        }
    }

    /// Reads the entry at the given index into memory, checking its integrity.
    pub fn read_entry_to_end(&mut self, index: usize, password: Option<&[u8]>) -> ZipResult<Vec<u8>> {
        self.open_entry(index, password)?;
        // Don't trust the header with how much to allocate.
        let capacity = usize(self.entries[index].size)?.min(1 << 24);
        let mut contents = Vec::with_capacity(capacity);
        let mut buf = vec![0u8; CHUNK];
        let result = loop {
            match self.read(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => contents.extend_from_slice(&buf[..n]),
                Err(e) => break Err(e),
            }
        };
        self.close_entry()?;
        result.map(|()| contents)
    }

    /// Closes the archive, releasing the storage and forgetting any password.
    pub fn close(&mut self) -> ZipResult<()> {
        if let State::Closed = self.state {
            return Err(ZipError::InvalidState("Archive is already closed"));
        }
        self.state = State::Closed;
        self.password = None;
        if self.storage.has_error() {
            warn!("Storage reported errors while reading");
        }
        self.storage.close()?;
        Ok(())
    }
}

fn integrity_failure(metadata: &FileMetadata, actual: u32) -> ZipError {
    ZipError::ChecksumMismatch {
        name: metadata.name.clone(),
        expected: metadata.crc32,
        actual,
    }
}

/// The state of one open entry
struct EntryCursor {
    index: usize,
    decoder: Decoder,
    cipher: Option<Cipher>,
    /// Where the next raw byte comes from
    position: u64,
    /// Raw (compressed, encrypted) bytes left
    raw_remaining: u64,
    check_crc: bool,
    /// Where the AES authentication code lives, if there is one
    auth_code_position: Option<u64>,
    buffer: Vec<u8>,
    done: bool,
    /// The (expected, actual) checksums of an integrity failure,
    /// returned again by every read after it
    failure: Option<(u32, u32)>,
}

impl EntryCursor {
    /// Pulls the next chunk of raw bytes from storage and decrypts them.
    fn fill<S: Storage>(&mut self, storage: &mut S) -> io::Result<()> {
        let n = self.raw_remaining.min(CHUNK as u64) as usize;
        self.buffer.resize(n, 0);
        storage.seek(SeekFrom::Start(self.position))?;
        storage.read_exact(&mut self.buffer)?;
        self.position += n as u64;
        self.raw_remaining -= n as u64;
        if let Some(cipher) = &mut self.cipher {
            cipher.decrypt(&mut self.buffer);
        }
        Ok(())
    }

    fn read<S: Storage>(
        &mut self,
        storage: &mut S,
        metadata: &FileMetadata,
        buf: &mut [u8],
    ) -> ZipResult<usize> {
        if let Some((expected, actual)) = self.failure {
            return Err(ZipError::ChecksumMismatch {
                name: metadata.name.clone(),
                expected,
                actual,
            });
        }
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        let result = self.read_more(storage, metadata, buf);
        if let Err(ZipError::ChecksumMismatch {
            expected, actual, ..
        }) = &result
        {
            self.failure = Some((*expected, *actual));
        }
        result
    }

    fn read_more<S: Storage>(
        &mut self,
        storage: &mut S,
        metadata: &FileMetadata,
        buf: &mut [u8],
    ) -> ZipResult<usize> {
        loop {
            if self.decoder.is_finished() {
                self.verify(storage, metadata)?;
                self.done = true;
                return Ok(0);
            }
            let fed: &[u8] = if self.decoder.needs_input() {
                if self.raw_remaining == 0 {
                    debug!("{} ended before its compressed stream did", metadata.name);
                    return Err(integrity_failure(metadata, self.decoder.crc32()));
                }
                match self.fill(storage) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        return Err(integrity_failure(metadata, self.decoder.crc32()));
                    }
                    Err(e) => return Err(e.into()),
                }
                self.buffer.as_slice()
            } else {
                &[]
            };
            let progress = match self.decoder.feed(fed, buf) {
                Ok(p) => p,
                Err(e) => {
                    debug!("Couldn't decompress {}: {}", metadata.name, e);
                    return Err(integrity_failure(metadata, self.decoder.crc32()));
                }
            };
            if progress.produced > 0 {
                return Ok(progress.produced);
            }
        }
    }

    /// Checks the CRC, size, and authentication code once the data runs out.
    fn verify<S: Storage>(&mut self, storage: &mut S, metadata: &FileMetadata) -> ZipResult<()> {
        let actual = self.decoder.crc32();
        if self.decoder.total_out() != metadata.size {
            debug!(
                "{} decompressed to {} bytes, expected {}",
                metadata.name,
                self.decoder.total_out(),
                metadata.size
            );
            return Err(integrity_failure(metadata, actual));
        }
        if self.check_crc && actual != metadata.crc32 {
            return Err(integrity_failure(metadata, actual));
        }

        #[cfg(feature = "aes-crypto")]
        if let Some(auth_code_position) = self.auth_code_position {
            // The MAC covers all the ciphertext,
            // including anything past the end of the compressed stream.
            while self.raw_remaining > 0 {
                self.fill(storage)?;
            }
            let stored = read_at(storage, auth_code_position, AUTH_CODE_LEN)
                .map_err(|_| integrity_failure(metadata, actual))?;
            if let Some(Cipher::Aes(aes)) = &self.cipher {
                let computed = aes.auth_code();
                if computed[..] != stored[..] {
                    let word = |b: &[u8]| u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                    return Err(ZipError::ChecksumMismatch {
                        name: metadata.name.clone(),
                        expected: word(&stored),
                        actual: word(&computed),
                    });
                }
            }
        }
        #[cfg(not(feature = "aes-crypto"))]
        let _ = (storage, self.auth_code_position);

        debug!("Finished reading {}", metadata.name);
        Ok(())
    }
}

/// Reads the open entry through `std::io::Read`
pub struct EntryReader<'a, S: Storage> {
    archive: &'a mut ZipReader<S>,
}

impl<S: Storage> Read for EntryReader<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.archive.read(buf)?)
    }
}
