//! Salvaging entries from archives whose central directory is gone.
//!
//! [`repair`] ignores the back of the archive entirely.
//! It scans forward for local file headers, checks each one it finds,
//! and copies the entries that hold up into a fresh archive.
//!
//! [`repair`]: fn.repair.html

use std::io::{self, Seek, SeekFrom};

use log::*;
use memchr::memmem;

use crate::codec::{CompressionMethod, Decoder};
use crate::read::read_at;
use crate::result::*;
use crate::spec::{self, DataDescriptor, ExtraFields, LocalFileHeader};
use crate::storage::Storage;
use crate::write::{RawEntry, ZipWriter};

/// Bytes of the damaged archive searched at a time
const WINDOW: usize = 64 * 1024;

/// Decompressed bytes produced per decoder call while checking entries
const CHUNK: usize = 32 * 1024;

/// What a repair managed to save
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RepairReport {
    pub entries_recovered: u64,
    /// Uncompressed bytes in the recovered entries
    pub bytes_recovered: u64,
    /// Things that looked like local headers, but weren't usable entries
    pub candidates_rejected: u64,
}

/// An entry we found and believe
#[derive(Debug)]
struct Candidate {
    name: Vec<u8>,
    version_needed: u16,
    flags: u16,
    method: u16,
    dos_time: u16,
    dos_date: u16,
    crc32: u32,
    compressed_size: u64,
    size: u64,
    extra: Vec<u8>,
    data_start: u64,
    /// Where the entry (including any data descriptor) ends
    end: u64,
}

/// Scans a damaged archive for entries and writes every one that checks out
/// into `output` as a new, whole archive.
///
/// Entries are copied without recompressing them,
/// so encrypted entries survive (though only their framing can be checked).
/// The damaged archive is only read.
///
/// ```no_run
/// # use ziprw::*;
/// let mut damaged = LocalFile::open("broken.zip", OpenMode::Read)?;
/// let output = LocalFile::open("fixed.zip", OpenMode::Create)?;
/// let (_, report) = repair(&mut damaged, output)?;
/// println!("Saved {} entries", report.entries_recovered);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn repair<D: Storage + ?Sized, W: Storage>(
    damaged: &mut D,
    output: W,
) -> ZipResult<(W, RepairReport)> {
    let len = damaged.size()?;
    let mut writer = ZipWriter::new(output);
    let mut report = RepairReport::default();

    let mut position = 0;
    while let Some(at) = find_signature(damaged, position, len, &spec::LOCAL_FILE_HEADER_MAGIC)? {
        let candidate = match examine(damaged, at, len) {
            Ok(c) => c,
            Err(ZipError::Io(e)) if !is_data_error(&e) => return Err(ZipError::Io(e)),
            Err(e) => {
                warn!("Rejecting the local header at offset {}: {}", at, e);
                report.candidates_rejected += 1;
                position = at + 1;
                continue;
            }
        };
        debug!(
            "Recovering {} ({} bytes) from offset {}",
            String::from_utf8_lossy(&candidate.name),
            candidate.size,
            at
        );

        let extra = spec::strip_extra_field(&candidate.extra, spec::ZIP64_EXTRA_ID);
        let raw = RawEntry {
            name: &candidate.name,
            version_needed: candidate.version_needed,
            flags: candidate.flags,
            method: candidate.method,
            dos_time: candidate.dos_time,
            dos_date: candidate.dos_date,
            crc32: candidate.crc32,
            compressed_size: candidate.compressed_size,
            size: candidate.size,
            extra: &extra,
        };
        damaged.seek(SeekFrom::Start(candidate.data_start))?;
        writer.copy_raw_entry(&raw, damaged)?;

        report.entries_recovered += 1;
        report.bytes_recovered += candidate.size;
        position = candidate.end;
    }

    if report.entries_recovered == 0 {
        return Err(ZipError::NotAnArchive(
            "No recoverable entries found by scanning for local headers",
        ));
    }
    debug!("{:?}", report);
    Ok((writer.finish()?, report))
}

/// Damage to the archive's contents, as opposed to trouble reading it at all
fn is_data_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData
    )
}

fn reject(why: String) -> ZipError {
    ZipError::CorruptDirectory(why)
}

/// Finds the next occurrence of `magic` at or after `from`.
fn find_signature<S: Storage + ?Sized>(
    storage: &mut S,
    from: u64,
    len: u64,
    magic: &[u8; 4],
) -> io::Result<Option<u64>> {
    let finder = memmem::Finder::new(magic);
    let mut start = from;
    while start + magic.len() as u64 <= len {
        let window_len = (len - start).min(WINDOW as u64) as usize;
        let window = read_at(storage, start, window_len)?;
        if let Some(i) = finder.find(&window) {
            return Ok(Some(start + i as u64));
        }
        if start + window_len as u64 >= len {
            break;
        }
        // Overlap windows so a signature straddling them isn't missed.
        start += (window_len - (magic.len() - 1)) as u64;
    }
    Ok(None)
}

/// Checks out the would-be local header at `at`.
fn examine<S: Storage + ?Sized>(storage: &mut S, at: u64, len: u64) -> ZipResult<Candidate> {
    let fixed_size = LocalFileHeader::FIXED_SIZE as u64;
    if at + fixed_size > len {
        return Err(reject("header runs past the end".to_owned()));
    }
    let fixed = read_at(storage, at, LocalFileHeader::FIXED_SIZE)?;
    let header_len = fixed_size + LocalFileHeader::variable_length(&fixed) as u64;
    if at + header_len > len {
        return Err(reject("name and extra field run past the end".to_owned()));
    }
    let header_bytes = read_at(storage, at, header_len as usize)?;
    let header = LocalFileHeader::parse_and_consume(&mut header_bytes.as_slice())?;
    trace!("{:?}", header);

    if header.path.is_empty() {
        return Err(reject("empty name".to_owned()));
    }
    let extra = ExtraFields::parse(header.extra_field)?;
    let encrypted = spec::is_encrypted(header.flags);
    let method = match (&extra.aes, header.compression_method) {
        (Some(aes), spec::AES_METHOD) => CompressionMethod::from_u16(aes.compression_method),
        (None, spec::AES_METHOD) => {
            return Err(reject("AES method without its extra field".to_owned()))
        }
        (_, raw) => CompressionMethod::from_u16(raw),
    };
    // Encrypted data can't be decoded, and unknown methods can't be decoded by us.
    let checkable = !encrypted && !matches!(method, CompressionMethod::Unsupported(_));

    let mut crc32 = header.crc32;
    let mut compressed_size = header.compressed_size as u64;
    let mut size = header.uncompressed_size as u64;
    let local_zip64 = extra.zip64.is_some();
    if let Some(zip64) = extra.zip64 {
        spec::apply_zip64(zip64, &mut size, &mut compressed_size, None, None)?;
    }

    let data_start = at + header_len;
    let end;
    if !spec::has_data_descriptor(header.flags) {
        end = data_start
            .checked_add(compressed_size)
            .filter(|end| *end <= len)
            .ok_or_else(|| reject(format!("{} bytes of data run past the end", compressed_size)))?;
        if checkable {
            let (actual_crc, actual_size, _) = decode(storage, data_start, compressed_size, method)?;
            check(crc32, size, actual_crc, actual_size)?;
        }
    } else if checkable && method == CompressionMethod::Deflate {
        // DEFLATE marks its own end, so decoding tells us where the data stops.
        let (actual_crc, actual_size, used) = decode(storage, data_start, len - data_start, method)?;
        crc32 = actual_crc;
        size = actual_size;
        compressed_size = used;
        let data_end = data_start + used;
        end = data_end
            + descriptor_after(storage, data_end, len, local_zip64, crc32, compressed_size, size)?;
    } else {
        let (descriptor, descriptor_len) =
            find_descriptor(storage, data_start, len, local_zip64)?;
        crc32 = descriptor.crc32;
        compressed_size = descriptor.compressed_size;
        size = descriptor.uncompressed_size;
        end = data_start + compressed_size + descriptor_len;
        if checkable {
            let (actual_crc, actual_size, _) = decode(storage, data_start, compressed_size, method)?;
            check(crc32, size, actual_crc, actual_size)?;
        }
    }

    Ok(Candidate {
        name: header.path.to_vec(),
        version_needed: header.minimum_extract_version,
        flags: header.flags,
        method: header.compression_method,
        dos_time: header.last_modified_time,
        dos_date: header.last_modified_date,
        crc32,
        compressed_size,
        size,
        extra: header.extra_field.to_vec(),
        data_start,
        end,
    })
}

fn check(crc32: u32, size: u64, actual_crc: u32, actual_size: u64) -> ZipResult<()> {
    if actual_crc != crc32 {
        return Err(reject(format!(
            "CRC {:#010x} doesn't match the header's {:#010x}",
            actual_crc, crc32
        )));
    }
    if actual_size != size {
        return Err(reject(format!(
            "{} bytes decompressed, but the header says {}",
            actual_size, size
        )));
    }
    Ok(())
}

/// Decompresses at most `limit` bytes starting at `start`, throwing the output away.
/// Returns the CRC and size of the output, and how much input was used.
fn decode<S: Storage + ?Sized>(
    storage: &mut S,
    start: u64,
    limit: u64,
    method: CompressionMethod,
) -> ZipResult<(u32, u64, u64)> {
    let mut decoder = Decoder::new(method, limit)?;
    let mut output = vec![0u8; CHUNK];
    let end = start + limit;
    let mut position = start;
    while !decoder.is_finished() {
        if decoder.needs_input() {
            if position == end {
                return Err(reject("compressed data ends early".to_owned()));
            }
            let n = (end - position).min(WINDOW as u64) as usize;
            let input = read_at(storage, position, n)?;
            position += n as u64;
            decoder.feed(&input, &mut output)?;
        } else {
            decoder.feed(&[], &mut output)?;
        }
    }
    Ok((decoder.crc32(), decoder.total_out(), decoder.total_in()))
}

/// Figures out which (if any) kind of data descriptor follows an entry
/// whose CRC and sizes we already know. Returns its length.
fn descriptor_after<S: Storage + ?Sized>(
    storage: &mut S,
    at: u64,
    len: u64,
    zip64_first: bool,
    crc32: u32,
    compressed_size: u64,
    size: u64,
) -> ZipResult<u64> {
    let available = (len - at).min(DataDescriptor::size_in_file(true, true) as u64) as usize;
    let bytes = read_at(storage, at, available)?;
    let expected = DataDescriptor {
        crc32,
        compressed_size,
        uncompressed_size: size,
    };
    for zip64 in [zip64_first, !zip64_first] {
        for signed in [true, false] {
            if DataDescriptor::parse(&bytes, zip64, signed) == Some(expected) {
                return Ok(DataDescriptor::size_in_file(zip64, signed) as u64);
            }
        }
    }
    warn!("No data descriptor follows the streamed entry ending at {}", at);
    Ok(0)
}

/// For streamed entries we can't decode,
/// looks for a signed data descriptor whose compressed size
/// matches its distance from the start of the data.
fn find_descriptor<S: Storage + ?Sized>(
    storage: &mut S,
    data_start: u64,
    len: u64,
    zip64_first: bool,
) -> ZipResult<(DataDescriptor, u64)> {
    let mut from = data_start;
    while let Some(at) = find_signature(storage, from, len, &spec::DATA_DESCRIPTOR_MAGIC)? {
        let available = (len - at).min(DataDescriptor::size_in_file(true, true) as u64) as usize;
        let bytes = read_at(storage, at, available)?;
        for zip64 in [zip64_first, !zip64_first] {
            if let Some(descriptor) = DataDescriptor::parse(&bytes, zip64, true) {
                if descriptor.compressed_size == at - data_start {
                    trace!("{:?}", descriptor);
                    return Ok((descriptor, DataDescriptor::size_in_file(zip64, true) as u64));
                }
            }
        }
        from = at + 1;
    }
    Err(reject("no data descriptor matches the streamed data".to_owned()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::read::ZipReader;
    use crate::storage::MemoryBuffer;
    use crate::write::EntryOptions;

    fn archive(entries: &[(&str, &[u8], EntryOptions)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(MemoryBuffer::create());
        for (name, data, options) in entries {
            writer.start_entry(name, options).unwrap();
            writer.write(data).unwrap();
            writer.close_entry().unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn signatures_across_windows() {
        let mut bytes = vec![0u8; WINDOW * 2];
        let at = WINDOW - 2;
        bytes[at..at + 4].copy_from_slice(&spec::LOCAL_FILE_HEADER_MAGIC);
        let mut storage = MemoryBuffer::from_bytes(bytes);
        let len = storage.size().unwrap();
        assert_eq!(
            find_signature(&mut storage, 0, len, &spec::LOCAL_FILE_HEADER_MAGIC).unwrap(),
            Some(at as u64)
        );
        assert_eq!(
            find_signature(&mut storage, at as u64 + 1, len, &spec::LOCAL_FILE_HEADER_MAGIC)
                .unwrap(),
            None
        );
    }

    #[test]
    fn every_kind_of_entry() {
        let stored = EntryOptions::default().compression(CompressionMethod::None);
        let bytes = archive(&[
            ("streamed.txt", b"deflated and streamed", EntryOptions::default()),
            (
                "patched.txt",
                b"deflated, size known",
                EntryOptions::default().size(20),
            ),
            ("stored.txt", b"stored and streamed", stored.clone()),
            ("stored-known.txt", b"stored, size known", stored.size(18)),
        ]);
        // Lop off the central directory.
        let first_central = memmem::find(&bytes, &spec::CENTRAL_DIRECTORY_MAGIC).unwrap();
        let damaged = bytes[..first_central].to_vec();
        assert!(ZipReader::new(MemoryBuffer::from_bytes(damaged.clone())).is_err());

        let (fixed, report) =
            repair(&mut MemoryBuffer::from_bytes(damaged), MemoryBuffer::create()).unwrap();
        assert_eq!(report.entries_recovered, 4);
        assert_eq!(report.candidates_rejected, 0);

        let mut reader = ZipReader::new(MemoryBuffer::from_bytes(fixed.into_inner())).unwrap();
        let names: Vec<_> = reader.entries().iter().map(|e| e.name.clone()).collect();
        assert_eq!(
            names,
            ["streamed.txt", "patched.txt", "stored.txt", "stored-known.txt"]
        );
        assert_eq!(
            reader.read_entry_to_end(2, None).unwrap(),
            b"stored and streamed"
        );
    }

    #[test]
    fn bad_crc_is_rejected() {
        let mut bytes = archive(&[(
            "a.txt",
            b"aaaaaaaaaa",
            EntryOptions::default()
                .compression(CompressionMethod::None)
                .size(10),
        )]);
        // The data starts after the 30-byte header and the five-byte name.
        bytes[35] = b'b';
        match repair(&mut MemoryBuffer::from_bytes(bytes), MemoryBuffer::create()) {
            Err(ZipError::NotAnArchive(_)) => {}
            other => panic!("Expected nothing to be recovered, got {:?}", other.map(|r| r.1)),
        }
    }
}
