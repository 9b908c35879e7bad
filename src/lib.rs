//! ziprw reads and writes ZIP archives one entry at a time,
//! streaming each entry's data through DEFLATE (and optionally encryption)
//! without ever holding a whole entry in memory:
//!
//! ```no_run
//! # use ziprw::*;
//! let file = LocalFile::open("foo.zip", OpenMode::Create)?;
//! let mut archive = ZipWriter::new(file);
//!
//! archive.start_entry("hello/hi.txt", &EntryOptions::default())?;
//! archive.write(b"Hello, world!\n")?;
//! archive.close_entry()?;
//!
//! // Declaring the size up front lets the writer skip the data descriptor.
//! let big = std::fs::read("big.bin")?;
//! archive.start_entry(
//!     "big.bin",
//!     &EntryOptions::default().level(9).size(big.len() as u64),
//! )?;
//! archive.write(&big)?;
//!
//! // Closing the archive closes any open entry and writes the central directory.
//! archive.set_comment("Made with ziprw")?;
//! archive.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Reading works the same way, in reverse:
//!
//! ```no_run
//! # use std::io;
//! # use ziprw::*;
//! let file = LocalFile::open("foo.zip", OpenMode::Read)?;
//! let mut archive = ZipReader::new(file)?;
//!
//! for entry in archive.entries() {
//!     println!("{} ({} bytes)", entry.name, entry.size);
//! }
//!
//! // ZIP doesn't promise unique names; lookups by name find the first.
//! archive.open_entry_by_name("hello/hi.txt", None)?;
//! io::copy(&mut archive.entry_reader()?, &mut io::stdout())?;
//! archive.close_entry()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Archives live in a [`Storage`]: a [`LocalFile`], a [`MemoryBuffer`],
//! or a [`MultiVolumeFile`] for archives split into `.z01`, `.z02`, ... `.zip` volumes.
//! Each handle is single-threaded and has at most one entry open,
//! but independent handles can be used from as many threads as you like.
//!
//! If an archive's central directory is lost or mangled,
//! [`repair`] can scan what's left for entries and write them into a new archive.
//!
//! [`Storage`]: storage/trait.Storage.html
//! [`LocalFile`]: storage/struct.LocalFile.html
//! [`MemoryBuffer`]: storage/struct.MemoryBuffer.html
//! [`MultiVolumeFile`]: volumes/struct.MultiVolumeFile.html
//! [`repair`]: repair/fn.repair.html

pub mod codec;
pub mod crypto;
pub mod read;
pub mod repair;
pub mod result;
pub mod storage;
pub mod volumes;
pub mod write;

pub use codec::CompressionMethod;
pub use crypto::{AesStrength, Encryption, EncryptionMethod};
pub use read::{EntryReader, FileMetadata, ZipReader};
pub use repair::{repair, RepairReport};
pub use result::{ZipError, ZipResult};
pub use storage::{LocalFile, MemoryBuffer, OpenMode, Storage};
pub use volumes::MultiVolumeFile;
pub use write::{EntryOptions, EntryWriter, ZipWriter};

#[cfg(feature = "aes-crypto")]
mod aes;
mod arch;
mod spec;
