//! Code specific to the ZIP file format specification.
//!
//! We try to keep the nitty gritty here,
//! and higher-level stuff in the [`read`] and [`write`] modules.
//! Everything in here works on byte slices;
//! getting those bytes in and out of storage is someone else's problem.
//!
//! Most comments quote the ZIP spec, [`APPNOTE.TXT`].
//!
//! [_Zip Files: History, Explanation and Implementation_]
//! is also a fantastic resource and a great read.
//!
//! [`read`]: ../read/index.html
//! [`write`]: ../write/index.html
//! [`APPNOTE.TXT`]: https://pkware.cachefly.net/webdocs/APPNOTE/APPNOTE-6.3.6.TXT
//! [_Zip Files: History, Explanation and Implementation_]: https://www.hanshq.net/zip.html

use std::borrow::Cow;
use std::convert::TryInto;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use codepage_437::*;
use log::*;
use memchr::memmem;

use crate::codec::CompressionMethod;
use crate::crypto::{AesStrength, Encryption};
use crate::read::FileMetadata;
use crate::result::*;

// Magic numbers denoting various sections of a ZIP archive

/// End of central directory magic number
pub const EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 5, 6];
/// Zip64 end of central directory magic number
pub const ZIP64_EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 6, 6];
/// Zip64 end of central directory locator magic number
pub const ZIP64_EOCDR_LOCATOR_MAGIC: [u8; 4] = [b'P', b'K', 6, 7];
/// Central directory magic number
pub const CENTRAL_DIRECTORY_MAGIC: [u8; 4] = [b'P', b'K', 1, 2];
/// Local file header magic number
pub const LOCAL_FILE_HEADER_MAGIC: [u8; 4] = [b'P', b'K', 3, 4];
/// Data descriptor magic number (optional, but everybody writes it)
pub const DATA_DESCRIPTOR_MAGIC: [u8; 4] = [b'P', b'K', 7, 8];

/// Zip64 extended information extra field
pub const ZIP64_EXTRA_ID: u16 = 0x0001;
/// Extended timestamp extra field ("UT")
pub const EXTENDED_TIMESTAMP_EXTRA_ID: u16 = 0x5455;
/// WinZip AES extra field
pub const AES_EXTRA_ID: u16 = 0x9901;
/// The compression method recorded for WinZip AES entries.
/// The real one hides in the AES extra field.
pub const AES_METHOD: u16 = 99;

// General purpose bit flags

/// Bit 0: If set, indicates that the file is encrypted.
pub const FLAG_ENCRYPTED: u16 = 1;
/// Bit 3: CRC and sizes are zero in the local header
/// and follow the data in a data descriptor.
pub const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
/// Bit 6: Strong encryption.
pub const FLAG_STRONG_ENCRYPTION: u16 = 1 << 6;
/// Bit 11: Language encoding flag (EFS).
pub const FLAG_UTF8: u16 = 1 << 11;

/// Version needed to extract: deflate, folders, traditional encryption
pub const VERSION_DEFAULT: u16 = 20;
/// Version needed to extract: Zip64 extensions
pub const VERSION_ZIP64: u16 = 45;
/// Version needed to extract: AES encryption
pub const VERSION_AES: u16 = 51;

impl CompressionMethod {
    pub(crate) fn from_u16(u: u16) -> Self {
        match u {
            0 => CompressionMethod::None,
            8 => CompressionMethod::Deflate,
            // 12 => CompressionMethod::Bzip2,
            v => CompressionMethod::Unsupported(v),
        }
    }

    pub(crate) fn to_u16(self) -> u16 {
        match self {
            CompressionMethod::None => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unsupported(v) => v,
        }
    }
}

/// The OS a file in the archive was compressed with.
/// Used to decode additional metadata like permissions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum System {
    Dos,
    Unix,
    Unknown,
}

impl System {
    pub fn from_source_version(source_version: u16) -> Self {
        // 4.4.2.1 The upper byte indicates the compatibility of the file
        // attribute information.  If the external file attributes
        // are compatible with MS-DOS and can be read by PKZIP for
        // DOS version 2.04g then this value will be zero.  If these
        // attributes are not compatible, then this value will
        // identify the host system on which the attributes are
        // compatible.  Software can use this information to determine
        // the line record format for text files etc.
        //
        // 4.4.2.2 The current mappings are:
        //
        //  0 - MS-DOS and OS/2 (FAT / VFAT / FAT32 file systems)
        //  1 - Amiga                     2 - OpenVMS
        //  3 - UNIX                      4 - VM/CMS
        //  5 - Atari ST                  6 - OS/2 H.P.F.S.
        //  7 - Macintosh                 8 - Z-System
        //  9 - CP/M                     10 - Windows NTFS
        // 11 - MVS (OS/390 - Z/OS)      12 - VSE
        // 13 - Acorn Risc               14 - VFAT
        // 15 - alternate MVS            16 - BeOS
        // 17 - Tandem                   18 - OS/400
        // 19 - OS X (Darwin)            20 thru 255 - unused
        match source_version >> 8 {
            0 => System::Dos,
            3 => System::Unix,
            _ => System::Unknown,
        }
    }

    /// The "version made by" we write: Unix attributes, given spec version.
    pub fn unix_source_version(spec_version: u16) -> u16 {
        (3 << 8) | spec_version
    }
}

// Straight from the Rust docs:

/// Reads a little-endian u64 from the front of the provided slice, shrinking it.
fn read_u64(input: &mut &[u8]) -> u64 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u64>());
    *input = rest;
    u64::from_le_bytes(int_bytes.try_into().expect("less than eight bytes for u64"))
}

/// Reads a little-endian u32 from the front of the provided slice, shrinking it.
fn read_u32(input: &mut &[u8]) -> u32 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u32>());
    *input = rest;
    u32::from_le_bytes(int_bytes.try_into().expect("less than four bytes for u32"))
}

/// Reads a little-endian u16 from the front of the provided slice, shrinking it.
fn read_u16(input: &mut &[u8]) -> u16 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u16>());
    *input = rest;
    u16::from_le_bytes(int_bytes.try_into().expect("less than two bytes for u16"))
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// The `read_*` helpers panic on short input,
/// so every parser checks its lengths up front.
fn ensure_len(input: &[u8], needed: usize, what: &str) -> ZipResult<()> {
    if input.len() < needed {
        return Err(ZipError::CorruptDirectory(format!(
            "{what} truncated: need {needed} bytes, have {}",
            input.len()
        )));
    }
    Ok(())
}

/// Data from the End of central directory record
///
/// Found at the back of the ZIP archive and provides offsets for finding
/// its central directory, along with the disk numbers
/// that matter again once an archive is split into volumes.
#[derive(Debug)]
pub struct EndOfCentralDirectory<'a> {
    pub disk_number: u16,
    pub disk_with_central_directory: u16,
    pub entries_on_this_disk: u16,
    pub entries: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
    pub file_comment: &'a [u8],
}

impl<'a> EndOfCentralDirectory<'a> {
    pub const SIZE: usize = 22;

    pub fn parse(mut eocdr: &'a [u8]) -> ZipResult<Self> {
        // 4.3.16  End of central directory record:
        //
        // end of central dir signature    4 bytes  (0x06054b50)
        // number of this disk             2 bytes
        // number of the disk with the
        // start of the central directory  2 bytes
        // total number of entries in
        // the central dir on this disk    2 bytes
        // total number of entries in
        // the central dir                 2 bytes
        // size of the central directory   4 bytes
        // offset of start of central
        // directory with respect to
        // the starting disk number        4 bytes
        // zipfile comment length          2 bytes
        if eocdr.len() < Self::SIZE || eocdr[..4] != EOCDR_MAGIC {
            return Err(ZipError::NotAnArchive(
                "Couldn't find End Of Central Directory Record",
            ));
        }
        eocdr = &eocdr[4..];
        let disk_number = read_u16(&mut eocdr);
        let disk_with_central_directory = read_u16(&mut eocdr);
        let entries_on_this_disk = read_u16(&mut eocdr);
        let entries = read_u16(&mut eocdr);
        let central_directory_size = read_u32(&mut eocdr);
        let central_directory_offset = read_u32(&mut eocdr);
        let comment_length = read_u16(&mut eocdr) as usize;
        if comment_length > eocdr.len() {
            warn!(
                "Archive comment claims {} bytes but only {} remain",
                comment_length,
                eocdr.len()
            );
        }
        let file_comment = &eocdr[..comment_length.min(eocdr.len())];

        Ok(Self {
            disk_number,
            disk_with_central_directory,
            entries_on_this_disk,
            entries,
            central_directory_size,
            central_directory_offset,
            file_comment,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&EOCDR_MAGIC);
        put_u16(out, self.disk_number);
        put_u16(out, self.disk_with_central_directory);
        put_u16(out, self.entries_on_this_disk);
        put_u16(out, self.entries);
        put_u32(out, self.central_directory_size);
        put_u32(out, self.central_directory_offset);
        put_u16(out, self.file_comment.len() as u16);
        out.extend_from_slice(self.file_comment);
    }
}

/// Searches backward through the tail of an archive to find the
/// End of central directory record.
///
/// It should be right at the end of the file,
/// but its variable-length comment means we can't jump to a known offset.
/// A candidate whose comment runs exactly to the end of the window wins;
/// otherwise we settle for the last one that has room for the fixed fields.
pub fn find_eocdr(window: &[u8]) -> Option<usize> {
    let mut fallback = None;
    for posit in memmem::rfind_iter(window, &EOCDR_MAGIC) {
        let rest = &window[posit..];
        if rest.len() < EndOfCentralDirectory::SIZE {
            continue;
        }
        let comment_length = u16::from_le_bytes([rest[20], rest[21]]) as usize;
        if EndOfCentralDirectory::SIZE + comment_length == rest.len() {
            return Some(posit);
        }
        if fallback.is_none() {
            fallback = Some(posit);
        }
    }
    fallback
}

/// Data from the Zip64 end of central directory locator
///
/// This should immediately precede the End of central directory record
/// on Zip64 files and tell us where to find the Zip64 end of central directory record.
#[derive(Debug)]
pub struct Zip64EndOfCentralDirectoryLocator {
    pub disk_with_central_directory: u32,
    pub zip64_eocdr_offset: u64,
    pub disks: u32,
}

impl Zip64EndOfCentralDirectoryLocator {
    pub fn parse(mut mapping: &[u8]) -> Option<Self> {
        // 4.3.15 Zip64 end of central directory locator
        //
        // zip64 end of central dir locator
        // signature                       4 bytes  (0x07064b50)
        // number of the disk with the
        // start of the zip64 end of
        // central directory               4 bytes
        // relative offset of the zip64
        // end of central directory record 8 bytes
        // total number of disks           4 bytes
        if mapping.len() < Self::size_in_file() || mapping[..4] != ZIP64_EOCDR_LOCATOR_MAGIC {
            return None;
        }
        mapping = &mapping[4..];
        let disk_with_central_directory = read_u32(&mut mapping);
        let zip64_eocdr_offset = read_u64(&mut mapping);
        let disks = read_u32(&mut mapping);

        Some(Self {
            disk_with_central_directory,
            zip64_eocdr_offset,
            disks,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&ZIP64_EOCDR_LOCATOR_MAGIC);
        put_u32(out, self.disk_with_central_directory);
        put_u64(out, self.zip64_eocdr_offset);
        put_u32(out, self.disks);
    }

    pub const fn size_in_file() -> usize {
        20
    }
}

/// Data from the Zip64 end of central directory record
///
/// Same story as the classic End of central directory record,
/// but with fields wide enough for the 21st century.
#[derive(Debug)]
pub struct Zip64EndOfCentralDirectory {
    pub source_version: u16,
    pub minimum_extract_version: u16,
    pub disk_number: u32,
    pub disk_with_central_directory: u32,
    pub entries_on_this_disk: u64,
    pub entries: u64,
    pub central_directory_size: u64,
    pub central_directory_offset: u64,
}

impl Zip64EndOfCentralDirectory {
    pub fn parse(mut eocdr: &[u8]) -> ZipResult<Self> {
        // 4.3.14  Zip64 end of central directory record
        //
        // zip64 end of central dir
        // signature                       4 bytes  (0x06064b50)
        // size of zip64 end of central
        // directory record                8 bytes
        // version made by                 2 bytes
        // version needed to extract       2 bytes
        // number of this disk             4 bytes
        // number of the disk with the
        // start of the central directory  4 bytes
        // total number of entries in the
        // central directory on this disk  8 bytes
        // total number of entries in the
        // central directory               8 bytes
        // size of the central directory   8 bytes
        // offset of start of central
        // directory with respect to
        // the starting disk number        8 bytes
        // zip64 extensible data sector    (variable size)
        ensure_len(
            eocdr,
            Self::fixed_size_in_file(),
            "Zip64 End Of Central Directory Record",
        )?;
        if eocdr[..4] != ZIP64_EOCDR_MAGIC {
            return Err(ZipError::CorruptDirectory(
                "Invalid Zip64 End Of Central Directory Record signature".to_owned(),
            ));
        }
        eocdr = &eocdr[4..];
        let eocdr_size = read_u64(&mut eocdr);
        let source_version = read_u16(&mut eocdr);
        let minimum_extract_version = read_u16(&mut eocdr);
        let disk_number = read_u32(&mut eocdr);
        let disk_with_central_directory = read_u32(&mut eocdr);
        let entries_on_this_disk = read_u64(&mut eocdr);
        let entries = read_u64(&mut eocdr);
        let central_directory_size = read_u64(&mut eocdr);
        let central_directory_offset = read_u64(&mut eocdr);

        // 4.3.14.1 The value stored into the "size of zip64 end of central
        // directory record" SHOULD be the size of the remaining
        // record and SHOULD NOT include the leading 12 bytes.
        //
        // Size = SizeOfFixedFields + SizeOfVariableData - 12.
        //
        // We don't use the extensible data, but a size smaller than
        // the fixed fields means we're looking at garbage.
        if eocdr_size.saturating_add(12) < Self::fixed_size_in_file() as u64 {
            return Err(ZipError::CorruptDirectory(
                "Invalid size in Zip64 End Of Central Directory Record".to_owned(),
            ));
        }

        Ok(Self {
            source_version,
            minimum_extract_version,
            disk_number,
            disk_with_central_directory,
            entries_on_this_disk,
            entries,
            central_directory_size,
            central_directory_offset,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&ZIP64_EOCDR_MAGIC);
        put_u64(out, Self::fixed_size_in_file() as u64 - 12);
        put_u16(out, self.source_version);
        put_u16(out, self.minimum_extract_version);
        put_u32(out, self.disk_number);
        put_u32(out, self.disk_with_central_directory);
        put_u64(out, self.entries_on_this_disk);
        put_u64(out, self.entries);
        put_u64(out, self.central_directory_size);
        put_u64(out, self.central_directory_offset);
    }

    pub const fn fixed_size_in_file() -> usize {
        56
    }
}

/// Finds the Zip64 end of central directory record in the given slice.
///
/// The slice should start at the Zip64 EOCDR's nominal location,
/// but we might have to do some searching since ZIP archives can have
/// arbitrary junk up front.
pub fn find_zip64_eocdr(mapping: &[u8]) -> ZipResult<usize> {
    memmem::find(mapping, &ZIP64_EOCDR_MAGIC).ok_or_else(|| {
        ZipError::CorruptDirectory("Couldn't find Zip64 End Of Central Directory Record".to_owned())
    })
}

/// Data from a central directory entry
///
/// Each of these records contians information about a file or folder
/// stored in the ZIP archive.
#[derive(Debug)]
pub struct CentralDirectoryEntry<'a> {
    pub source_version: u16,
    pub minimum_extract_version: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub disk_number: u16,
    pub internal_file_attributes: u16,
    pub external_file_attributes: u32,
    pub header_offset: u32,
    pub path: &'a [u8],
    pub extra_field: &'a [u8],
    pub file_comment: &'a [u8],
}

impl<'a> CentralDirectoryEntry<'a> {
    pub const FIXED_SIZE: usize = 46;

    pub fn parse_and_consume(entry: &mut &'a [u8]) -> ZipResult<Self> {
        // 4.3.12  Central directory structure:
        //
        // [central directory header 1]
        // .
        // .
        // .
        // [central directory header n]
        // [digital signature]
        //
        // File header:
        //
        //   central file header signature   4 bytes  (0x02014b50)
        //   version made by                 2 bytes
        //   version needed to extract       2 bytes
        //   general purpose bit flag        2 bytes
        //   compression method              2 bytes
        //   last mod file time              2 bytes
        //   last mod file date              2 bytes
        //   crc-32                          4 bytes
        //   compressed size                 4 bytes
        //   uncompressed size               4 bytes
        //   file name length                2 bytes
        //   extra field length              2 bytes
        //   file comment length             2 bytes
        //   disk number start               2 bytes
        //   internal file attributes        2 bytes
        //   external file attributes        4 bytes
        //   relative offset of local header 4 bytes
        //
        //   file name (variable size)
        //   extra field (variable size)
        //   file comment (variable size)
        ensure_len(entry, Self::FIXED_SIZE, "Central directory entry")?;
        if entry[..4] != CENTRAL_DIRECTORY_MAGIC {
            return Err(ZipError::CorruptDirectory(
                "Invalid central directory entry signature".to_owned(),
            ));
        }
        *entry = &entry[4..];
        let source_version = read_u16(entry);
        let minimum_extract_version = read_u16(entry);
        let flags = read_u16(entry);
        let compression_method = read_u16(entry);
        let last_modified_time = read_u16(entry);
        let last_modified_date = read_u16(entry);
        let crc32 = read_u32(entry);
        let compressed_size = read_u32(entry);
        let uncompressed_size = read_u32(entry);
        let path_length = read_u16(entry) as usize;
        let extra_field_length = read_u16(entry) as usize;
        let file_comment_length = read_u16(entry) as usize;
        let disk_number = read_u16(entry);
        let internal_file_attributes = read_u16(entry);
        let external_file_attributes = read_u32(entry);
        let header_offset = read_u32(entry);
        ensure_len(
            entry,
            path_length + extra_field_length + file_comment_length,
            "Central directory entry's name, extra field, and comment",
        )?;
        let (path, remaining) = entry.split_at(path_length);
        let (extra_field, remaining) = remaining.split_at(extra_field_length);
        let (file_comment, remaining) = remaining.split_at(file_comment_length);
        *entry = remaining;

        Ok(Self {
            source_version,
            minimum_extract_version,
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            disk_number,
            internal_file_attributes,
            external_file_attributes,
            header_offset,
            path,
            extra_field,
            file_comment,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&CENTRAL_DIRECTORY_MAGIC);
        put_u16(out, self.source_version);
        put_u16(out, self.minimum_extract_version);
        put_u16(out, self.flags);
        put_u16(out, self.compression_method);
        put_u16(out, self.last_modified_time);
        put_u16(out, self.last_modified_date);
        put_u32(out, self.crc32);
        put_u32(out, self.compressed_size);
        put_u32(out, self.uncompressed_size);
        put_u16(out, self.path.len() as u16);
        put_u16(out, self.extra_field.len() as u16);
        put_u16(out, self.file_comment.len() as u16);
        put_u16(out, self.disk_number);
        put_u16(out, self.internal_file_attributes);
        put_u32(out, self.external_file_attributes);
        put_u32(out, self.header_offset);
        out.extend_from_slice(self.path);
        out.extend_from_slice(self.extra_field);
        out.extend_from_slice(self.file_comment);
    }

    pub fn size_in_file(&self) -> usize {
        Self::FIXED_SIZE + self.path.len() + self.extra_field.len() + self.file_comment.len()
    }
}

/// Extracts the "is this text UTF-8?" bit from the 16-bit flags field.
///
/// If false, text is assumped to be CP437.
pub fn is_utf8(flags: u16) -> bool {
    // Bit 11: Language encoding flag (EFS).  If this bit is set,
    //         the filename and comment fields for this file
    //         MUST be encoded using UTF-8. (see APPENDIX D)
    flags & FLAG_UTF8 != 0
}

/// Extracts the "is this file encrypted?" bit from the 16-bit flags field.
pub fn is_encrypted(flags: u16) -> bool {
    // Bit 0: If set, indicates that the file is encrypted
    flags & FLAG_ENCRYPTED != 0
}

/// Extracts the "are sizes in a trailing data descriptor?" bit.
pub fn has_data_descriptor(flags: u16) -> bool {
    flags & FLAG_DATA_DESCRIPTOR != 0
}

/// Decodes a name or comment per the flags' encoding bit.
pub fn decode_text(raw: &[u8], flags: u16) -> String {
    if is_utf8(flags) {
        match std::str::from_utf8(raw) {
            Ok(s) => s.to_owned(),
            Err(e) => {
                warn!("Text flagged as UTF-8 isn't ({}); decoding lossily", e);
                String::from_utf8_lossy(raw).into_owned()
            }
        }
    } else {
        let str_cow: Cow<str> = Cow::borrow_from_cp437(raw, &CP437_CONTROL);
        str_cow.into_owned()
    }
}

impl FileMetadata {
    /// Extracts `FileMetadata` from a central directory entry
    pub(crate) fn from_cde(cde: &CentralDirectoryEntry, index: usize) -> ZipResult<Self> {
        let name = decode_text(cde.path, cde.flags);
        let comment = decode_text(cde.file_comment, cde.flags);

        let extras = ExtraFields::parse(cde.extra_field)?;

        let mut size = cde.uncompressed_size as u64;
        let mut compressed_size = cde.compressed_size as u64;
        let mut header_offset = cde.header_offset as u64;
        let mut disk_number = cde.disk_number as u32;
        if let Some(zip64) = extras.zip64 {
            apply_zip64(
                zip64,
                &mut size,
                &mut compressed_size,
                Some(&mut header_offset),
                Some(&mut disk_number),
            )
            .map_err(|e| annotate(e, &name))?;
        }

        let (compression_method, encryption) =
            method_and_encryption(cde.flags, cde.compression_method, &extras);

        let unix_mode = match System::from_source_version(cde.source_version) {
            System::Unix => Some(cde.external_file_attributes >> 16),
            _ => None,
        };

        Ok(Self {
            index,
            name,
            raw_name: cde.path.to_vec(),
            size,
            compressed_size,
            compression_method,
            crc32: cde.crc32,
            encryption,
            last_modified: parse_msdos(cde.last_modified_time, cde.last_modified_date),
            unix_modified: extras
                .modified
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
            unix_mode,
            external_attributes: cde.external_file_attributes,
            internal_attributes: cde.internal_file_attributes,
            comment,
            disk_number,
            flags: cde.flags,
            dos_time: cde.last_modified_time,
            header_offset,
        })
    }
}

fn annotate(e: ZipError, name: &str) -> ZipError {
    match e {
        ZipError::CorruptDirectory(msg) => ZipError::CorruptDirectory(format!("{name}: {msg}")),
        other => other,
    }
}

/// Sorts out what an entry's data looks like
/// from its flags, method, and extra fields.
pub(crate) fn method_and_encryption(
    flags: u16,
    raw_method: u16,
    extras: &ExtraFields,
) -> (CompressionMethod, Option<Encryption>) {
    if raw_method == AES_METHOD {
        if let Some(aes) = extras.aes {
            return (
                CompressionMethod::from_u16(aes.compression_method),
                Some(Encryption::Aes {
                    strength: aes.strength,
                    vendor_version: aes.vendor_version,
                }),
            );
        }
    }
    let encryption = if flags & FLAG_STRONG_ENCRYPTION != 0 {
        Some(Encryption::Strong)
    } else if is_encrypted(flags) {
        Some(Encryption::ZipCrypto)
    } else {
        None
    };
    (CompressionMethod::from_u16(raw_method), encryption)
}

/// Checks that a local file header agrees with its central directory entry.
///
/// The central directory is authoritative, but a mismatch means somebody
/// has been splicing archives together (or worse).
pub(crate) fn validate_local_header(
    metadata: &FileMetadata,
    local: &LocalFileHeader,
) -> ZipResult<()> {
    let mismatch = |what: &str| {
        Err(ZipError::CorruptDirectory(format!(
            "Local file header for {} at offset {} doesn't match its central directory entry ({})",
            metadata.name, metadata.header_offset, what
        )))
    };

    if local.path != metadata.raw_name.as_slice() {
        return mismatch("name");
    }
    let extras = ExtraFields::parse(local.extra_field)?;
    let (method, _) = method_and_encryption(local.flags, local.compression_method, &extras);
    if method != metadata.compression_method {
        return mismatch("compression method");
    }
    if has_data_descriptor(local.flags) {
        // CRC and sizes are (probably) zeroes here; the descriptor has them.
        return Ok(());
    }
    let mut size = local.uncompressed_size as u64;
    let mut compressed_size = local.compressed_size as u64;
    if let Some(zip64) = extras.zip64 {
        apply_zip64(zip64, &mut size, &mut compressed_size, None, None)?;
    }
    if local.crc32 != metadata.crc32 {
        return mismatch("CRC-32");
    }
    if size != metadata.size || compressed_size != metadata.compressed_size {
        return mismatch("sizes");
    }
    Ok(())
}

fn parse_msdos_opt(time: u16, date: u16) -> Option<NaiveDateTime> {
    let seconds = (0b0000_0000_0001_1111 & time) as u32 * 2; // MSDOS uses 2-second precision
    let minutes = (0b0000_0111_1110_0000 & time) as u32 >> 5;
    let hours = (0b1111_1000_0000_0000 & time) as u32 >> 11;

    let days = (0b0000_0000_0001_1111 & date) as u32;
    let months = (0b0000_0001_1110_0000 & date) as u32 >> 5;
    // MSDOS uses years since 1980; Always interpreted as a positive value
    let years = ((0b1111_1110_0000_0000 & date) >> 9) as i32 + 1980;

    NaiveDate::from_ymd_opt(years, months, days)?.and_hms_opt(hours, minutes, seconds)
}

/// The DOS epoch, which is what we get for all-zero (or nonsensical) timestamps.
pub fn msdos_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1980, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("1980-01-01 is a valid date")
}

/// Converts an MS-DOS time and date into a `NaiveDateTime`.
///
/// Plenty of archivers write zeroes (or garbage) here,
/// so invalid values come back as the DOS epoch instead of an error.
pub fn parse_msdos(time: u16, date: u16) -> NaiveDateTime {
    parse_msdos_opt(time, date).unwrap_or_else(msdos_epoch)
}

/// Converts a `NaiveDateTime` to an MS-DOS (time, date) pair,
/// clamped to the years DOS can represent (1980-2107).
pub fn to_msdos(when: &NaiveDateTime) -> (u16, u16) {
    if when.year() < 1980 {
        return (0, (1 << 5) | 1);
    }
    if when.year() > 2107 {
        return (
            (23 << 11) | (59 << 5) | (58 / 2),
            (127 << 9) | (12 << 5) | 31,
        );
    }
    let time = ((when.hour() as u16) << 11)
        | ((when.minute() as u16) << 5)
        | (when.second() as u16 / 2);
    let date =
        (((when.year() - 1980) as u16) << 9) | ((when.month() as u16) << 5) | when.day() as u16;
    (time, date)
}

/// The WinZip AES extra field (0x9901)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AesExtraField {
    /// 1 for AE-1 (CRC present), 2 for AE-2 (CRC zeroed)
    pub vendor_version: u16,
    pub strength: AesStrength,
    /// The compression method actually used on the plaintext.
    pub compression_method: u16,
}

/// The extra fields we understand, plucked out of an extra field blob.
#[derive(Debug, Default)]
pub struct ExtraFields<'a> {
    /// Payload of the Zip64 extended information field, if present.
    /// What's in it depends on which header fields hold sentinels.
    pub zip64: Option<&'a [u8]>,
    /// Unix modification time from the extended timestamp field.
    pub modified: Option<i64>,
    pub aes: Option<AesExtraField>,
}

impl<'a> ExtraFields<'a> {
    /// Parses the "extra fields" found in central directory entries
    /// and local file headers.
    pub fn parse(mut extra_field: &'a [u8]) -> ZipResult<Self> {
        // 4.5.1 In order to allow different programs and different types
        // of information to be stored in the 'extra' field in .ZIP
        // files, the following structure MUST be used for all
        // programs storing data in this field:

        //     header1+data1 + header2+data2 . . .

        // Each header MUST consist of:

        //     Header ID - 2 bytes
        //     Data Size - 2 bytes
        let mut fields = Self::default();
        while extra_field.len() >= 4 {
            let kind = read_u16(&mut extra_field);
            let field_len = read_u16(&mut extra_field) as usize;
            if field_len > extra_field.len() {
                warn!(
                    "Extra field {:#06x} claims {} bytes but only {} remain; ignoring the rest",
                    kind,
                    field_len,
                    extra_field.len()
                );
                return Ok(fields);
            }
            let (mut payload, rest) = extra_field.split_at(field_len);
            extra_field = rest;

            match kind {
                ZIP64_EXTRA_ID => fields.zip64 = Some(payload),
                EXTENDED_TIMESTAMP_EXTRA_ID => {
                    // Flags byte, then each time the flags promise.
                    // Modification time comes first (bit 0).
                    if payload.len() >= 5 && payload[0] & 1 != 0 {
                        payload = &payload[1..];
                        fields.modified = Some(read_u32(&mut payload) as i32 as i64);
                    }
                }
                AES_EXTRA_ID => {
                    if payload.len() < 7 {
                        return Err(ZipError::CorruptDirectory(
                            "AES extra field too short".to_owned(),
                        ));
                    }
                    let vendor_version = read_u16(&mut payload);
                    let vendor_id = &payload[..2];
                    if vendor_id != b"AE" {
                        return Err(ZipError::UnsupportedFeature(format!(
                            "AES extra field from unknown vendor {:?}",
                            vendor_id
                        )));
                    }
                    payload = &payload[2..];
                    let strength = AesStrength::from_u8(payload[0]).ok_or_else(|| {
                        ZipError::UnsupportedFeature(format!("AES strength {}", payload[0]))
                    })?;
                    payload = &payload[1..];
                    let compression_method = read_u16(&mut payload);
                    fields.aes = Some(AesExtraField {
                        vendor_version,
                        strength,
                        compression_method,
                    });
                }
                // Everything else is somebody else's business.
                _ => trace!("Skipping extra field {:#06x} ({} bytes)", kind, field_len),
            }
        }
        Ok(fields)
    }
}

/// Replaces sentinel values with their 64-bit counterparts from a
/// Zip64 extended information extra field.
///
/// 4.5.3: the fields MUST only appear if the corresponding
/// header field is set to 0xFFFF or 0xFFFFFFFF, and always in this order.
pub fn apply_zip64(
    mut zip64: &[u8],
    size: &mut u64,
    compressed_size: &mut u64,
    header_offset: Option<&mut u64>,
    disk_number: Option<&mut u32>,
) -> ZipResult<()> {
    let short = || ZipError::CorruptDirectory("Zip64 extra field too short".to_owned());

    if *size == u32::MAX as u64 {
        if zip64.len() < 8 {
            return Err(short());
        }
        *size = read_u64(&mut zip64);
    }
    if *compressed_size == u32::MAX as u64 {
        if zip64.len() < 8 {
            return Err(short());
        }
        *compressed_size = read_u64(&mut zip64);
    }
    if let Some(header_offset) = header_offset {
        if *header_offset == u32::MAX as u64 {
            if zip64.len() < 8 {
                return Err(short());
            }
            *header_offset = read_u64(&mut zip64);
        }
    }
    if let Some(disk_number) = disk_number {
        if *disk_number == u16::MAX as u32 {
            if zip64.len() < 4 {
                return Err(short());
            }
            *disk_number = read_u32(&mut zip64);
        }
    }
    Ok(())
}

/// Writes a Zip64 extended information extra field holding the given values,
/// which the caller has already put in spec order
/// (uncompressed size, compressed size, header offset).
pub fn write_zip64_extra(out: &mut Vec<u8>, values: &[u64], disk_number: Option<u32>) {
    let len = values.len() * 8 + disk_number.map_or(0, |_| 4);
    put_u16(out, ZIP64_EXTRA_ID);
    put_u16(out, len as u16);
    for v in values {
        put_u64(out, *v);
    }
    if let Some(disk) = disk_number {
        put_u32(out, disk);
    }
}

/// Writes an extended timestamp extra field with just a modification time.
pub fn write_timestamp_extra(out: &mut Vec<u8>, modified: i64) {
    let clamped = modified.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
    put_u16(out, EXTENDED_TIMESTAMP_EXTRA_ID);
    put_u16(out, 5);
    out.push(1);
    out.extend_from_slice(&clamped.to_le_bytes());
}

/// Writes a WinZip AES extra field.
pub fn write_aes_extra(out: &mut Vec<u8>, aes: &AesExtraField) {
    put_u16(out, AES_EXTRA_ID);
    put_u16(out, 7);
    put_u16(out, aes.vendor_version);
    out.extend_from_slice(b"AE");
    out.push(aes.strength as u8);
    put_u16(out, aes.compression_method);
}

/// Copies an extra field blob, minus any fields with the given ID.
/// A truncated trailing field is dropped.
pub fn strip_extra_field(mut extra_field: &[u8], id: u16) -> Vec<u8> {
    let mut kept = Vec::with_capacity(extra_field.len());
    while extra_field.len() >= 4 {
        let whole = extra_field;
        let kind = read_u16(&mut extra_field);
        let field_len = read_u16(&mut extra_field) as usize;
        if field_len > extra_field.len() {
            break;
        }
        if kind != id {
            kept.extend_from_slice(&whole[..4 + field_len]);
        }
        extra_field = &extra_field[field_len..];
    }
    kept
}

/// Data from a local file header
///
/// Each files' actual contents is preceded by this header.
/// These headers alllow for "streaming" decompression without
/// the use of the central directory,
/// which is what the repair scan leans on.
#[derive(Debug)]
pub struct LocalFileHeader<'a> {
    pub minimum_extract_version: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub path: &'a [u8],
    pub extra_field: &'a [u8],
}

impl<'a> LocalFileHeader<'a> {
    pub const FIXED_SIZE: usize = 30;

    /// Given the fixed-size part of a local file header,
    /// returns how many bytes of name and extra field follow it.
    pub fn variable_length(fixed: &[u8]) -> usize {
        let mut lengths = &fixed[26..30];
        let path_length = read_u16(&mut lengths) as usize;
        let extra_field_length = read_u16(&mut lengths) as usize;
        path_length + extra_field_length
    }

    pub fn parse_and_consume(header: &mut &'a [u8]) -> ZipResult<Self> {
        // 4.3.7  Local file header:
        //
        // local file header signature     4 bytes  (0x04034b50)
        // version needed to extract       2 bytes
        // general purpose bit flag        2 bytes
        // compression method              2 bytes
        // last mod file time              2 bytes
        // last mod file date              2 bytes
        // crc-32                          4 bytes
        // compressed size                 4 bytes
        // uncompressed size               4 bytes
        // file name length                2 bytes
        // extra field length              2 bytes
        //
        // file name (variable size)
        // extra field (variable size)
        ensure_len(header, Self::FIXED_SIZE, "Local file header")?;
        if header[..4] != LOCAL_FILE_HEADER_MAGIC {
            return Err(ZipError::CorruptDirectory(
                "Invalid local file header signature".to_owned(),
            ));
        }
        *header = &header[4..];
        let minimum_extract_version = read_u16(header);
        let flags = read_u16(header);
        let compression_method = read_u16(header);
        let last_modified_time = read_u16(header);
        let last_modified_date = read_u16(header);
        let crc32 = read_u32(header);
        let compressed_size = read_u32(header);
        let uncompressed_size = read_u32(header);
        let path_length = read_u16(header) as usize;
        let extra_field_length = read_u16(header) as usize;
        ensure_len(
            header,
            path_length + extra_field_length,
            "Local file header's name and extra field",
        )?;
        let (path, remaining) = header.split_at(path_length);
        let (extra_field, remaining) = remaining.split_at(extra_field_length);
        *header = remaining;

        Ok(Self {
            minimum_extract_version,
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            path,
            extra_field,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&LOCAL_FILE_HEADER_MAGIC);
        put_u16(out, self.minimum_extract_version);
        put_u16(out, self.flags);
        put_u16(out, self.compression_method);
        put_u16(out, self.last_modified_time);
        put_u16(out, self.last_modified_date);
        put_u32(out, self.crc32);
        put_u32(out, self.compressed_size);
        put_u32(out, self.uncompressed_size);
        put_u16(out, self.path.len() as u16);
        put_u16(out, self.extra_field.len() as u16);
        out.extend_from_slice(self.path);
        out.extend_from_slice(self.extra_field);
    }

    pub fn size_in_file(&self) -> usize {
        Self::FIXED_SIZE + self.path.len() + self.extra_field.len()
    }
}

/// Data from a data descriptor
///
/// 4.3.9: written after the file data when bit 3 of the flags is set,
/// since the writer couldn't know the CRC and sizes up front.
/// Sizes are eight bytes wide when the entry has a Zip64 extra field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDescriptor {
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

impl DataDescriptor {
    pub const fn size_in_file(zip64: bool, signed: bool) -> usize {
        let sizes = if zip64 { 16 } else { 8 };
        let signature = if signed { 4 } else { 0 };
        signature + 4 + sizes
    }

    /// Always writes the (optional) signature; readers have to deal with both.
    pub fn write(&self, out: &mut Vec<u8>, zip64: bool) {
        out.extend_from_slice(&DATA_DESCRIPTOR_MAGIC);
        put_u32(out, self.crc32);
        if zip64 {
            put_u64(out, self.compressed_size);
            put_u64(out, self.uncompressed_size);
        } else {
            put_u32(out, self.compressed_size as u32);
            put_u32(out, self.uncompressed_size as u32);
        }
    }

    pub fn parse(mut input: &[u8], zip64: bool, signed: bool) -> Option<Self> {
        if input.len() < Self::size_in_file(zip64, signed) {
            return None;
        }
        if signed {
            if input[..4] != DATA_DESCRIPTOR_MAGIC {
                return None;
            }
            input = &input[4..];
        }
        let crc32 = read_u32(&mut input);
        let (compressed_size, uncompressed_size) = if zip64 {
            (read_u64(&mut input), read_u64(&mut input))
        } else {
            (read_u32(&mut input) as u64, read_u32(&mut input) as u64)
        };
        Some(Self {
            crc32,
            compressed_size,
            uncompressed_size,
        })
    }
}
