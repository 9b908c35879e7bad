use std::cell::Cell;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, TimeZone, Utc};
use log::*;
use memchr::memmem;
use rayon::prelude::*;

use ziprw::*;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Something DEFLATE can squeeze, but not into nothing
fn sample(len: usize) -> Vec<u8> {
    (0..len as u32)
        .map(|i| ((i * 31) % 251) as u8 ^ (i >> 7) as u8)
        .collect()
}

fn write_archive(entries: &[(&str, Vec<u8>, EntryOptions)]) -> Result<Vec<u8>> {
    let mut archive = ZipWriter::new(MemoryBuffer::create());
    for (name, data, options) in entries {
        archive.start_entry(name, options)?;
        // In uneven pieces, to make sure nothing cares how writes are split.
        for piece in data.chunks(777) {
            archive.write(piece)?;
        }
        archive.close_entry()?;
    }
    Ok(archive.finish()?.into_inner())
}

fn reader(bytes: Vec<u8>) -> Result<ZipReader<MemoryBuffer>> {
    ZipReader::new(MemoryBuffer::from_bytes(bytes)).context("Couldn't load archive")
}

#[test]
fn round_trip() -> Result<()> {
    init();
    let stored = EntryOptions::default().compression(CompressionMethod::None);
    let entries = vec![
        ("deflated.bin", sample(100_000), EntryOptions::default()),
        ("stored.bin", sample(5000), stored.clone()),
        ("fast.bin", sample(5000), EntryOptions::default().level(1)),
        ("best.bin", sample(5000), EntryOptions::default().level(9)),
        ("empty.txt", Vec::new(), EntryOptions::default()),
        ("empty-stored.txt", Vec::new(), stored),
        ("dir/", Vec::new(), EntryOptions::default()),
    ];
    let bytes = write_archive(&entries)?;

    let mut archive = reader(bytes)?;
    assert_eq!(archive.len(), entries.len());
    for (i, (name, data, _)) in entries.iter().enumerate() {
        let metadata = &archive.entries()[i];
        assert_eq!(metadata.name, *name);
        assert_eq!(metadata.size, data.len() as u64);
        assert_eq!(metadata.crc32, crc32fast::hash(data));
        assert!(!metadata.is_encrypted());
        assert_eq!(archive.read_entry_to_end(i, None)?, *data);
    }
    assert_eq!(
        archive.by_name("stored.bin").unwrap().compression_method,
        CompressionMethod::None
    );
    assert!(archive.by_name("dir/").unwrap().is_dir());
    assert_eq!(archive.by_name("dir/").unwrap().unix_mode, Some(0o040755));
    assert_eq!(
        archive.by_name("deflated.bin").unwrap().unix_mode,
        Some(0o100644)
    );
    assert!(
        archive.by_name("deflated.bin").unwrap().compressed_size < 100_000,
        "DEFLATE didn't compress anything"
    );
    archive.close()?;
    Ok(())
}

#[test]
fn every_flipped_byte_is_caught() -> Result<()> {
    init();
    let data = sample(3000);
    let methods = [CompressionMethod::None, CompressionMethod::Deflate];
    // Both with sizes patched into the local header and with a data descriptor
    for (method, declared) in methods.iter().flat_map(|m| [(*m, true), (*m, false)]) {
        let mut options = EntryOptions::default().compression(method);
        if declared {
            options = options.size(data.len() as u64);
        }
        let bytes = write_archive(&[("data.bin", data.clone(), options)])?;
        assert_eq!(reader(bytes.clone())?.entries()[0].has_data_descriptor(), !declared);
        let compressed_size = reader(bytes.clone())?.entries()[0].compressed_size as usize;
        // A 30-byte local header, then the name, then the data
        let data_start = 30 + "data.bin".len();

        for i in data_start..data_start + compressed_size {
            let mut flipped = bytes.clone();
            flipped[i] ^= 0xff;
            let mut archive = reader(flipped)?;
            match archive.read_entry_to_end(0, None) {
                Err(ZipError::ChecksumMismatch { name, .. }) => assert_eq!(name, "data.bin"),
                Err(other) => panic!("Flipping byte {} gave {:?}", i, other),
                Ok(_) => panic!("Flipping byte {} went unnoticed", i),
            }
        }
    }
    Ok(())
}

#[test]
fn integrity_failures_stick() -> Result<()> {
    init();
    let data = sample(100_000);
    let options = EntryOptions::default().compression(CompressionMethod::None);
    let mut bytes = write_archive(&[("d.bin", data, options)])?;
    bytes[30 + "d.bin".len() + 50_000] ^= 0x01;

    let mut archive = reader(bytes)?;
    archive.open_entry(0, None)?;
    let mut buf = vec![0u8; 4096];
    let mut read = 0;
    let failure = loop {
        match archive.read(&mut buf) {
            Ok(0) => panic!("Corrupt entry read to a clean end"),
            Ok(n) => read += n,
            Err(e) => break e,
        }
    };
    assert!(matches!(failure, ZipError::ChecksumMismatch { .. }));
    assert_eq!(read, 100_000);
    // Reading on doesn't turn the failure into an end of file.
    for _ in 0..3 {
        match archive.read(&mut buf) {
            Err(ZipError::ChecksumMismatch { name, .. }) => assert_eq!(name, "d.bin"),
            other => panic!("Read after a failure gave {:?}", other),
        }
    }
    archive.close_entry()?;
    assert!(matches!(
        archive.read_entry_to_end(0, None),
        Err(ZipError::ChecksumMismatch { .. })
    ));
    Ok(())
}

#[test]
fn streaming_sizes() -> Result<()> {
    init();
    let data = sample(200_000);
    let bytes = write_archive(&[("streamed.bin", data.clone(), EntryOptions::default())])?;

    let mut archive = reader(bytes.clone())?;
    let metadata = archive.entries()[0].clone();
    assert!(metadata.has_data_descriptor());
    assert_eq!(metadata.size, data.len() as u64);

    // The descriptor right before the central directory holds the same numbers.
    let central = memmem::find(&bytes, b"PK\x01\x02").unwrap();
    let descriptor = &bytes[central - 16..central];
    assert_eq!(&descriptor[..4], b"PK\x07\x08");
    let field = |at: usize| u32::from_le_bytes(descriptor[at..at + 4].try_into().unwrap());
    assert_eq!(field(4), metadata.crc32);
    assert_eq!(field(8) as u64, metadata.compressed_size);
    assert_eq!(field(12) as u64, data.len() as u64);
    // And the local header holds zeroes.
    assert_eq!(&bytes[14..26], &[0u8; 12]);

    assert_eq!(archive.read_entry_to_end(0, None)?, data);
    Ok(())
}

#[test]
fn declared_sizes_are_patched_in() -> Result<()> {
    init();
    let data = sample(10_000);
    let options = EntryOptions::default().size(data.len() as u64);
    let bytes = write_archive(&[("known.bin", data.clone(), options)])?;
    let mut archive = reader(bytes.clone())?;
    let metadata = archive.entries()[0].clone();
    assert!(!metadata.has_data_descriptor());
    assert_eq!(u32::from_le_bytes(bytes[14..18].try_into()?), metadata.crc32);
    assert_eq!(
        u32::from_le_bytes(bytes[22..26].try_into()?) as usize,
        data.len()
    );
    assert_eq!(archive.read_entry_to_end(0, None)?, data);
    Ok(())
}

#[test]
fn closing_twice() -> Result<()> {
    init();
    let mut archive = ZipWriter::new(MemoryBuffer::create());
    archive.start_entry("a.txt", &EntryOptions::default())?;
    archive.write(b"first")?;
    archive.close_entry()?;
    assert!(matches!(
        archive.close_entry(),
        Err(ZipError::InvalidState(_))
    ));
    archive.close()?;
    assert!(matches!(archive.close(), Err(ZipError::InvalidState(_))));
    assert!(matches!(
        archive.write(b"more"),
        Err(ZipError::InvalidState(_))
    ));
    let bytes = archive.finish()?.into_inner();

    let mut archive = reader(bytes)?;
    assert!(matches!(
        archive.close_entry(),
        Err(ZipError::InvalidState(_))
    ));
    assert_eq!(archive.read_entry_to_end(0, None)?, b"first");
    archive.close()?;
    assert!(matches!(archive.close(), Err(ZipError::InvalidState(_))));
    assert!(matches!(
        archive.open_entry(0, None),
        Err(ZipError::InvalidState(_))
    ));
    Ok(())
}

/// Storage that fails a single write when asked to
struct FlakyStorage {
    inner: MemoryBuffer,
    fail_next_write: Rc<Cell<bool>>,
}

impl Read for FlakyStorage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for FlakyStorage {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_next_write.replace(false) {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for FlakyStorage {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl Storage for FlakyStorage {
    fn size(&mut self) -> io::Result<u64> {
        self.inner.size()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.inner.truncate(len)
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }

    fn has_error(&self) -> bool {
        self.inner.has_error()
    }
}

#[test]
fn failed_close_can_be_retried() -> Result<()> {
    init();
    let fail = Rc::new(Cell::new(false));
    let storage = FlakyStorage {
        inner: MemoryBuffer::create(),
        fail_next_write: fail.clone(),
    };
    let mut archive = ZipWriter::new(storage);
    for name in &["a.txt", "b.txt"] {
        archive.start_entry(name, &EntryOptions::default())?;
        archive.write(name.as_bytes())?;
        archive.close_entry()?;
    }

    fail.set(true);
    match archive.close() {
        Err(ZipError::Io(e)) => assert_eq!(e.to_string(), "disk full"),
        other => panic!("Close with a failing disk gave {:?}", other),
    }
    // More entries can still go in, over the abandoned directory.
    archive.start_entry("c.txt", &EntryOptions::default())?;
    archive.write(b"c.txt")?;
    archive.close_entry()?;

    fail.set(true);
    assert!(archive.close().is_err());
    archive.close()?;
    assert!(matches!(archive.close(), Err(ZipError::InvalidState(_))));

    let bytes = archive.finish()?.inner.into_inner();
    assert_eq!(memmem::find_iter(&bytes, b"PK\x05\x06").count(), 1);
    let mut archive = reader(bytes)?;
    assert_eq!(archive.len(), 3);
    for (i, name) in ["a.txt", "b.txt", "c.txt"].iter().enumerate() {
        assert_eq!(archive.entries()[i].name, *name);
        assert_eq!(archive.read_entry_to_end(i, None)?, name.as_bytes());
    }
    Ok(())
}

#[test]
fn close_finishes_the_open_entry() -> Result<()> {
    init();
    let mut archive = ZipWriter::new(MemoryBuffer::create());
    archive.start_entry("left-open.txt", &EntryOptions::default())?;
    archive.write(b"still here")?;
    let bytes = archive.finish()?.into_inner();
    assert_eq!(reader(bytes)?.read_entry_to_end(0, None)?, b"still here");
    Ok(())
}

#[test]
fn duplicate_names() -> Result<()> {
    init();
    let bytes = write_archive(&[
        ("twin.txt", b"first".to_vec(), EntryOptions::default()),
        ("other.txt", b"other".to_vec(), EntryOptions::default()),
        ("twin.txt", b"second".to_vec(), EntryOptions::default()),
    ])?;
    let mut archive = reader(bytes)?;
    assert_eq!(archive.index_of("twin.txt"), Some(0));
    assert_eq!(archive.by_name("twin.txt").unwrap().index, 0);

    archive.open_entry_by_name("twin.txt", None)?;
    let mut contents = String::new();
    archive.entry_reader()?.read_to_string(&mut contents)?;
    archive.close_entry()?;
    assert_eq!(contents, "first");

    assert_eq!(archive.read_entry_to_end(2, None)?, b"second");
    assert!(matches!(
        archive.open_entry_by_name("nope.txt", None),
        Err(ZipError::NoSuchEntry(_))
    ));
    Ok(())
}

#[test]
fn one_entry_at_a_time() -> Result<()> {
    init();
    let bytes = write_archive(&[
        ("a.txt", sample(100_000), EntryOptions::default()),
        ("b.txt", b"bee".to_vec(), EntryOptions::default()),
    ])?;
    let mut archive = reader(bytes)?;
    archive.open_entry(0, None)?;
    assert!(matches!(
        archive.open_entry(1, None),
        Err(ZipError::InvalidState(_))
    ));
    // Read a little, then walk away.
    let mut buf = [0u8; 10];
    assert_eq!(archive.read(&mut buf)?, 10);
    archive.close_entry()?;
    assert!(matches!(
        archive.read(&mut buf),
        Err(ZipError::InvalidState(_))
    ));

    // Later entries don't notice.
    assert_eq!(archive.read_entry_to_end(1, None)?, b"bee");
    assert_eq!(archive.read_entry_to_end(0, None)?, sample(100_000));
    Ok(())
}

#[test]
fn unsupported_method() -> Result<()> {
    init();
    let options = EntryOptions::default()
        .compression(CompressionMethod::None)
        .size(5);
    let mut bytes = write_archive(&[("bzip.bz", b"hello".to_vec(), options)])?;
    // Claim it's bzip2 (method 12) in both headers.
    bytes[8..10].copy_from_slice(&12u16.to_le_bytes());
    let central = memmem::find(&bytes, b"PK\x01\x02").unwrap();
    bytes[central + 10..central + 12].copy_from_slice(&12u16.to_le_bytes());

    let mut archive = reader(bytes)?;
    assert_eq!(
        archive.entries()[0].compression_method,
        CompressionMethod::Unsupported(12)
    );
    assert!(matches!(
        archive.open_entry(0, None),
        Err(ZipError::UnsupportedFeature(_))
    ));
    // That didn't leave anything open.
    assert!(matches!(
        archive.close_entry(),
        Err(ZipError::InvalidState(_))
    ));
    Ok(())
}

#[test]
fn comments() -> Result<()> {
    init();
    let mut archive = ZipWriter::new(MemoryBuffer::create());
    archive.start_entry(
        "commented.txt",
        &EntryOptions::default().comment("An entry comment"),
    )?;
    archive.write(b"text")?;
    archive.close_entry()?;
    archive.start_entry("plain.txt", &EntryOptions::default())?;
    archive.close_entry()?;
    // Mention the EOCD signature in the comment, just to be difficult.
    archive.set_comment("The archive comment: PK\u{5}\u{6}")?;
    let bytes = archive.finish()?.into_inner();

    let archive = reader(bytes)?;
    assert_eq!(archive.comment(), b"The archive comment: PK\x05\x06");
    assert_eq!(archive.entries()[0].comment, "An entry comment");
    assert_eq!(archive.entries()[1].comment, "");
    Ok(())
}

#[test]
fn names_and_times() -> Result<()> {
    init();
    let modified = NaiveDate::from_ymd_opt(2021, 3, 14)
        .unwrap()
        .and_hms_opt(15, 9, 26)
        .unwrap();
    let unix_modified = Utc.with_ymd_and_hms(2021, 3, 14, 15, 9, 27).unwrap();
    let options = EntryOptions::default()
        .modified(modified)
        .unix_modified(unix_modified)
        .unix_mode(0o100755);
    let bytes = write_archive(&[
        ("naïve/résumé.txt", b"unicode".to_vec(), options.clone()),
        ("ascii.txt", b"plain".to_vec(), options),
    ])?;

    let archive = reader(bytes)?;
    let unicode = &archive.entries()[0];
    assert_eq!(unicode.name, "naïve/résumé.txt");
    assert_eq!(unicode.raw_name(), "naïve/résumé.txt".as_bytes());
    assert_eq!(unicode.path().file_name(), Some("résumé.txt"));
    // DOS times have two-second resolution.
    assert_eq!(unicode.last_modified, modified);
    assert_eq!(unicode.unix_modified, Some(unix_modified));
    assert_eq!(unicode.unix_mode, Some(0o100755));
    assert_eq!(archive.entries()[1].name, "ascii.txt");
    Ok(())
}

#[test]
fn prepended_data() -> Result<()> {
    init();
    let archive = write_archive(&[
        ("hi.txt", b"hi".to_vec(), EntryOptions::default()),
        ("there.txt", sample(1000), EntryOptions::default().size(1000)),
    ])?;
    let mut bytes = b"#!/bin/sh\necho 'Pretend this is a self-extractor'\nexit 0\n".to_vec();
    let stub_len = bytes.len() as u64;
    bytes.extend_from_slice(&archive);

    let mut archive = reader(bytes.clone())?;
    assert_eq!(archive.archive_offset(), stub_len);
    assert_eq!(archive.read_entry_to_end(0, None)?, b"hi");
    assert_eq!(archive.read_entry_to_end(1, None)?, sample(1000));

    // Appending keeps the stub and the offsets consistent with it.
    let mut appender = ZipWriter::append(MemoryBuffer::new(bytes, OpenMode::Append))?;
    appender.start_entry("more.txt", &EntryOptions::default())?;
    appender.write(b"more")?;
    let bytes = appender.finish()?.into_inner();
    assert!(bytes.starts_with(b"#!/bin/sh"));
    let mut archive = reader(bytes)?;
    assert_eq!(archive.archive_offset(), stub_len);
    assert_eq!(archive.read_entry_to_end(2, None)?, b"more");
    Ok(())
}

#[test]
fn append() -> Result<()> {
    init();
    let mut archive = ZipWriter::new(MemoryBuffer::create());
    archive.start_entry("old.txt", &EntryOptions::default())?;
    archive.write(b"old")?;
    archive.set_comment("kept")?;
    let bytes = archive.finish()?.into_inner();

    let mut archive = ZipWriter::append(MemoryBuffer::new(bytes, OpenMode::Append))?;
    archive.start_entry("new.txt", &EntryOptions::default().size(3))?;
    archive.write(b"new")?;
    let bytes = archive.finish()?.into_inner();

    let mut archive = reader(bytes)?;
    assert_eq!(archive.comment(), b"kept");
    let names: Vec<_> = archive.entries().iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, ["old.txt", "new.txt"]);
    assert_eq!(archive.read_entry_to_end(0, None)?, b"old");
    assert_eq!(archive.read_entry_to_end(1, None)?, b"new");
    Ok(())
}

#[test]
fn truncated_and_garbage_input() -> Result<()> {
    init();
    let bytes = write_archive(&[("a.bin", sample(50_000), EntryOptions::default())])?;
    // Every prefix fails cleanly; none of them panic.
    for len in (0..bytes.len()).step_by(997) {
        assert!(reader(bytes[..len].to_vec()).is_err());
    }
    assert!(matches!(
        ZipReader::new(MemoryBuffer::from_bytes(b"PK\x05\x06".to_vec())),
        Err(ZipError::NotAnArchive(_))
    ));
    Ok(())
}

#[test]
fn files_on_disk() -> Result<()> {
    init();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("on-disk.zip");

    let mut archive = ZipWriter::new(LocalFile::open(&path, OpenMode::Create)?);
    archive.start_entry("a.txt", &EntryOptions::default())?;
    archive.entry_writer()?.write_all(&sample(70_000))?;
    archive.close()?;

    let mut archive = ZipReader::new(LocalFile::open(&path, OpenMode::Read)?)?;
    assert_eq!(archive.read_entry_to_end(0, None)?, sample(70_000));
    archive.close()?;
    Ok(())
}

#[test]
fn independent_handles_in_parallel() -> Result<()> {
    init();
    (0..16u32).into_par_iter().try_for_each(|i| -> Result<()> {
        let name = format!("thread-{}.bin", i);
        let data = sample(10_000 + i as usize * 1000);
        let bytes = write_archive(&[(name.as_str(), data.clone(), EntryOptions::default())])?;
        let mut archive = reader(bytes)?;
        assert_eq!(archive.entries()[0].name, name);
        assert_eq!(archive.read_entry_to_end(0, None)?, data);
        debug!("Thread {} round-tripped {} bytes", i, data.len());
        Ok(())
    })
}
