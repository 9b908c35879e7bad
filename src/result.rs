//! Error types and the related `Result<T>`

use thiserror::Error;

pub type ZipResult<T> = Result<T, ZipError>;

#[derive(Debug, Error)]
pub enum ZipError {
    /// An error from underlying I/O
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    /// No End Of Central Directory record could be found.
    #[error("Not a Zip archive: {0}")]
    NotAnArchive(&'static str),

    /// The central directory (or a local header it points to)
    /// is inconsistent with the rest of the archive.
    #[error("Corrupt central directory: {0}")]
    CorruptDirectory(String),

    /// The ZIP archive uses a compression method, encryption scheme,
    /// or layout we don't support.
    #[error("Unsupported Zip feature: {0}")]
    UnsupportedFeature(String),

    /// The password was missing or didn't match the entry's encryption header.
    #[error("Wrong or missing password for {0}")]
    BadPassword(String),

    /// The entry's data didn't match its stored checksum
    /// (or authentication code, for AES entries).
    #[error("Checksum mismatch in {name}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        name: String,
        expected: u32,
        actual: u32,
    },

    /// The call isn't valid in the handle's current state,
    /// e.g., opening a second entry or closing twice.
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// No entry in the archive has the given name
    #[error("No entry in the archive named {0}")]
    NoSuchEntry(String),

    /// A cast from a 64-bit int to a usize failed,
    /// probably on a 32-bit system.
    #[error("Zip structure too large for address space")]
    InsufficientAddressSpace,
}

impl ZipError {
    /// Returns true for errors a user can fix and retry:
    /// re-entering a password or fetching a fresh copy of the archive.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ZipError::BadPassword(_) | ZipError::ChecksumMismatch { .. }
        )
    }
}

/// So entries can be read through `std::io::Read`
impl From<ZipError> for std::io::Error {
    fn from(e: ZipError) -> Self {
        match e {
            ZipError::Io(io) => io,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}
