use std::fs;

use anyhow::{Context, Result};
use log::*;

use ziprw::volumes::{volume_path, MIN_VOLUME_SIZE};
use ziprw::*;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn contents(i: usize) -> Vec<u8> {
    (0..20_000 + i * 1_000)
        .map(|j| ((j * 7 + i * 13) % 256) as u8)
        .collect()
}

#[test]
fn split_round_trip() -> Result<()> {
    init();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("split.zip");

    let storage = MultiVolumeFile::open(&path, OpenMode::Create, MIN_VOLUME_SIZE)?;
    let mut archive = ZipWriter::new(storage);
    for i in 0..12 {
        // Stored, so the data is as big as it looks.
        let options = EntryOptions::default()
            .compression(CompressionMethod::None)
            .comment("a comment to fatten up the central directory");
        // Declaring a size doesn't stop split archives from streaming.
        let options = if i % 2 == 0 {
            options.size(contents(i).len() as u64)
        } else {
            options
        };
        archive.start_entry(&format!("entry-{:02}.bin", i), &options)?;
        archive.write(&contents(i))?;
        archive.close_entry()?;
    }
    archive.set_comment("split across volumes")?;
    let storage = archive.finish()?;
    let paths: Vec<_> = storage.volume_paths().map(|p| p.to_owned()).collect();
    info!("Wrote {:?}", paths);
    assert!(paths.len() >= 4, "Only wrote {} volumes", paths.len());
    assert_eq!(paths.last(), Some(&path));
    for (i, volume) in paths[..paths.len() - 1].iter().enumerate() {
        assert_eq!(*volume, volume_path(&path, i + 1));
        assert!(fs::metadata(volume)?.len() <= MIN_VOLUME_SIZE);
    }

    let volumes: Vec<Vec<u8>> = paths
        .iter()
        .map(fs::read)
        .collect::<Result<_, _>>()
        .context("Couldn't read back volumes")?;
    // The end records are all in the last volume.
    let last = volumes.last().unwrap();
    assert!(memchr::memmem::find(last, b"PK\x05\x06").is_some());

    let mut archive = ZipReader::new(MultiVolumeFile::open(&path, OpenMode::Read, 0)?)?;
    assert_eq!(archive.comment(), b"split across volumes");
    assert_eq!(archive.len(), 12);
    let mut disks_used = Vec::new();
    for i in 0..12 {
        let metadata = archive.entries()[i].clone();
        assert_eq!(metadata.name, format!("entry-{:02}.bin", i));
        assert!(metadata.has_data_descriptor());
        disks_used.push(metadata.disk_number);

        // No local header straddles two volumes.
        let volume = &volumes[metadata.disk_number as usize];
        let offset = metadata.header_offset() as usize;
        let header_end = offset + 30 + metadata.raw_name().len();
        assert!(header_end <= volume.len(), "{} is split", metadata.name);
        assert_eq!(&volume[offset..offset + 4], b"PK\x03\x04");

        assert_eq!(archive.read_entry_to_end(i, None)?, contents(i));
    }
    assert!(disks_used.windows(2).all(|w| w[0] <= w[1]));
    assert!(*disks_used.last().unwrap() > 0);
    archive.close()?;
    Ok(())
}

#[test]
fn stale_volumes_are_cleared() -> Result<()> {
    init();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("stale.zip");
    fs::write(volume_path(&path, 1), b"leftovers")?;
    fs::write(volume_path(&path, 2), b"more leftovers")?;

    let mut archive = ZipWriter::new(MultiVolumeFile::open(&path, OpenMode::Create, MIN_VOLUME_SIZE)?);
    archive.start_entry("small.txt", &EntryOptions::default())?;
    archive.write(b"fits in one volume")?;
    archive.close()?;

    assert!(!volume_path(&path, 1).exists());
    assert!(!volume_path(&path, 2).exists());
    let mut archive = ZipReader::new(MultiVolumeFile::open(&path, OpenMode::Read, 0)?)?;
    assert_eq!(archive.read_entry_to_end(0, None)?, b"fits in one volume");
    Ok(())
}

#[test]
fn split_archives_need_their_volumes() -> Result<()> {
    init();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("needy.zip");
    let mut archive = ZipWriter::new(MultiVolumeFile::open(&path, OpenMode::Create, MIN_VOLUME_SIZE)?);
    archive.start_entry("big.bin", &EntryOptions::default().compression(CompressionMethod::None))?;
    archive.write(&contents(100))?;
    archive.close()?;

    // Just the last volume, opened as a plain file
    let last_alone = LocalFile::open(&path, OpenMode::Read)?;
    assert!(matches!(
        ZipReader::new(last_alone),
        Err(ZipError::UnsupportedFeature(_))
    ));
    Ok(())
}
