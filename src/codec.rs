//! The compression side of things: push bytes in, get bytes out.
//!
//! [`Encoder`] and [`Decoder`] wrap flate2's raw DEFLATE streams
//! (or just copy bytes, for stored entries), and keep count of what went
//! through them along with a running CRC-32 of the uncompressed side.
//!
//! [`Encoder`]: struct.Encoder.html
//! [`Decoder`]: struct.Decoder.html

use std::io;

use crc32fast::Hasher;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::result::*;

/// The compression method used to store a file
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompressionMethod {
    /// The file is uncompressed
    None,
    /// The file is [DEFLATE](https://en.wikipedia.org/wiki/DEFLATE)d.
    /// This is the most common format used by ZIP archives.
    Deflate,
    /// The file is compressed with a yet-unsupported format.
    /// (The u16 indicates the internal format code.)
    Unsupported(u16),
}

/// zlib's default compression level
pub const DEFAULT_LEVEL: u32 = 6;
/// Fastest compression that still compresses
pub const FASTEST_LEVEL: u32 = 1;
/// Smallest output
pub const BEST_LEVEL: u32 = 9;

const CHUNK: usize = 32 * 1024;

/// What one call to `feed` or `finish` did
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Input bytes taken
    pub consumed: usize,
    /// Output bytes made
    pub produced: usize,
    /// True once the stream has ended
    pub finished: bool,
}

fn unsupported(method: CompressionMethod) -> ZipError {
    ZipError::UnsupportedFeature(format!("Compression method {:?}", method))
}

fn corrupt<E: std::fmt::Display>(e: E) -> ZipError {
    ZipError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("Corrupt DEFLATE stream: {}", e),
    ))
}

enum Compressor {
    Store,
    Deflate(Box<Compress>),
}

/// Compresses one entry's worth of data.
pub struct Encoder {
    compressor: Compressor,
    crc: Hasher,
    total_in: u64,
    total_out: u64,
    finished: bool,
}

impl Encoder {
    pub fn new(method: CompressionMethod, level: u32) -> ZipResult<Self> {
        let compressor = match method {
            CompressionMethod::None => Compressor::Store,
            CompressionMethod::Deflate => Compressor::Deflate(Box::new(Compress::new(
                Compression::new(level.min(BEST_LEVEL)),
                false,
            ))),
            other => return Err(unsupported(other)),
        };
        Ok(Self {
            compressor,
            crc: Hasher::new(),
            total_in: 0,
            total_out: 0,
            finished: false,
        })
    }

    /// Compresses all of `input`, appending whatever comes out to `output`.
    pub fn feed(&mut self, input: &[u8], output: &mut Vec<u8>) -> ZipResult<Progress> {
        if self.finished {
            return Err(ZipError::InvalidState("Encoder already finished"));
        }
        let before = output.len();
        match &mut self.compressor {
            Compressor::Store => output.extend_from_slice(input),
            Compressor::Deflate(compress) => {
                let mut consumed = 0;
                while consumed < input.len() {
                    output.reserve(CHUNK.max(input.len() - consumed));
                    let in_before = compress.total_in();
                    compress
                        .compress_vec(&input[consumed..], output, FlushCompress::None)
                        .map_err(corrupt)?;
                    consumed += (compress.total_in() - in_before) as usize;
                }
            }
        }
        self.crc.update(input);
        let produced = output.len() - before;
        self.total_in += input.len() as u64;
        self.total_out += produced as u64;
        Ok(Progress {
            consumed: input.len(),
            produced,
            finished: false,
        })
    }

    /// Flushes everything left in the compressor and ends the stream.
    pub fn finish(&mut self, output: &mut Vec<u8>) -> ZipResult<Progress> {
        let before = output.len();
        if !self.finished {
            if let Compressor::Deflate(compress) = &mut self.compressor {
                loop {
                    output.reserve(CHUNK);
                    let status = compress
                        .compress_vec(&[], output, FlushCompress::Finish)
                        .map_err(corrupt)?;
                    if status == Status::StreamEnd {
                        break;
                    }
                }
            }
            self.finished = true;
        }
        let produced = output.len() - before;
        self.total_out += produced as u64;
        Ok(Progress {
            consumed: 0,
            produced,
            finished: true,
        })
    }

    /// CRC-32 of everything fed in so far
    pub fn crc32(&self) -> u32 {
        self.crc.clone().finalize()
    }

    /// Uncompressed bytes taken
    pub fn total_in(&self) -> u64 {
        self.total_in
    }

    /// Compressed bytes produced
    pub fn total_out(&self) -> u64 {
        self.total_out
    }
}

enum Decompressor {
    Store,
    Deflate(Box<Decompress>),
}

/// Decompresses one entry's worth of data.
///
/// Input that can't be used yet is held onto,
/// so callers can feed it chunks of whatever size is convenient.
pub struct Decoder {
    decompressor: Decompressor,
    /// Compressed bytes we've been given but haven't decompressed
    pending: Vec<u8>,
    pending_start: usize,
    /// How many compressed bytes a stored entry has
    compressed_size: u64,
    crc: Hasher,
    total_in: u64,
    total_out: u64,
    finished: bool,
    /// The last feed couldn't make progress with what it had.
    starved: bool,
}

impl Decoder {
    pub fn new(method: CompressionMethod, compressed_size: u64) -> ZipResult<Self> {
        let decompressor = match method {
            CompressionMethod::None => Decompressor::Store,
            CompressionMethod::Deflate => Decompressor::Deflate(Box::new(Decompress::new(false))),
            other => return Err(unsupported(other)),
        };
        Ok(Self {
            decompressor,
            pending: Vec::new(),
            pending_start: 0,
            compressed_size,
            crc: Hasher::new(),
            total_in: 0,
            total_out: 0,
            finished: compressed_size == 0 && matches!(method, CompressionMethod::None),
            starved: true,
        })
    }

    fn pending(&self) -> &[u8] {
        &self.pending[self.pending_start..]
    }

    /// True if the decoder can't produce more without more input.
    pub fn needs_input(&self) -> bool {
        !self.finished && self.starved
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Takes all of `input` and decompresses as much as fits in `output`.
    ///
    /// A result with nothing produced and `finished` unset means
    /// the decoder wants more input.
    pub fn feed(&mut self, input: &[u8], output: &mut [u8]) -> ZipResult<Progress> {
        if !input.is_empty() {
            self.pending.drain(..self.pending_start);
            self.pending_start = 0;
            self.pending.extend_from_slice(input);
        }
        let mut progress = Progress {
            consumed: input.len(),
            ..Default::default()
        };
        if self.finished || output.is_empty() {
            progress.finished = self.finished;
            return Ok(progress);
        }

        let (used, produced) = match &mut self.decompressor {
            Decompressor::Store => {
                let remaining = self.compressed_size - self.total_in;
                let available = &self.pending[self.pending_start..];
                let n = available.len().min(output.len()).min(remaining as usize);
                output[..n].copy_from_slice(&available[..n]);
                if self.total_in + n as u64 == self.compressed_size {
                    self.finished = true;
                }
                (n, n)
            }
            Decompressor::Deflate(decompress) => {
                let in_before = decompress.total_in();
                let out_before = decompress.total_out();
                let status = decompress
                    .decompress(
                        &self.pending[self.pending_start..],
                        output,
                        FlushDecompress::None,
                    )
                    .map_err(corrupt)?;
                if status == Status::StreamEnd {
                    self.finished = true;
                }
                (
                    (decompress.total_in() - in_before) as usize,
                    (decompress.total_out() - out_before) as usize,
                )
            }
        };
        self.pending_start += used;
        self.total_in += used as u64;
        self.total_out += produced as u64;
        self.crc.update(&output[..produced]);
        self.starved = !self.finished && produced == 0;

        progress.produced = produced;
        progress.finished = self.finished;
        Ok(progress)
    }

    /// Input that came after the end of the compressed stream
    pub fn leftover(&self) -> &[u8] {
        if self.finished {
            self.pending()
        } else {
            &[]
        }
    }

    /// CRC-32 of everything produced so far
    pub fn crc32(&self) -> u32 {
        self.crc.clone().finalize()
    }

    /// Compressed bytes actually used
    pub fn total_in(&self) -> u64 {
        self.total_in
    }

    /// Uncompressed bytes produced
    pub fn total_out(&self) -> u64 {
        self.total_out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut v = Vec::new();
        for i in 0..20_000u32 {
            v.extend_from_slice(format!("line {} of some fairly compressible text\n", i % 97).as_bytes());
        }
        v
    }

    fn compress(method: CompressionMethod, level: u32, data: &[u8]) -> (Vec<u8>, u32) {
        let mut encoder = Encoder::new(method, level).unwrap();
        let mut out = Vec::new();
        // Odd chunk sizes on purpose
        for chunk in data.chunks(1000 + 7) {
            let p = encoder.feed(chunk, &mut out).unwrap();
            assert_eq!(p.consumed, chunk.len());
        }
        assert!(encoder.finish(&mut out).unwrap().finished);
        assert_eq!(encoder.total_in(), data.len() as u64);
        assert_eq!(encoder.total_out(), out.len() as u64);
        (out, encoder.crc32())
    }

    fn decompress(method: CompressionMethod, compressed: &[u8], chunk: usize) -> (Vec<u8>, u32) {
        let mut decoder = Decoder::new(method, compressed.len() as u64).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        let mut input = compressed.chunks(chunk);
        while !decoder.is_finished() {
            let next: &[u8] = if decoder.needs_input() {
                input.next().expect("ran out of input")
            } else {
                &[]
            };
            let p = decoder.feed(next, &mut buf).unwrap();
            out.extend_from_slice(&buf[..p.produced]);
        }
        assert_eq!(decoder.total_in(), compressed.len() as u64);
        (out, decoder.crc32())
    }

    #[test]
    fn deflate_round_trip() {
        let data = sample();
        for level in &[FASTEST_LEVEL, DEFAULT_LEVEL, BEST_LEVEL] {
            let (compressed, crc) = compress(CompressionMethod::Deflate, *level, &data);
            assert!(compressed.len() < data.len() / 4);
            assert_eq!(crc, crc32fast::hash(&data));
            for chunk in &[1, 333, 1 << 20] {
                let (decompressed, decoded_crc) =
                    decompress(CompressionMethod::Deflate, &compressed, *chunk);
                assert_eq!(decompressed, data);
                assert_eq!(decoded_crc, crc);
            }
        }
    }

    #[test]
    fn stored_round_trip() {
        let data = sample();
        let (stored, crc) = compress(CompressionMethod::None, 0, &data);
        assert_eq!(stored, data);
        let (decompressed, decoded_crc) = decompress(CompressionMethod::None, &stored, 5000);
        assert_eq!(decompressed, data);
        assert_eq!(decoded_crc, crc);
    }

    #[test]
    fn empty_streams() {
        let (compressed, crc) = compress(CompressionMethod::Deflate, DEFAULT_LEVEL, b"");
        assert!(!compressed.is_empty());
        assert_eq!(crc, 0);
        let (decompressed, _) = decompress(CompressionMethod::Deflate, &compressed, 10);
        assert!(decompressed.is_empty());

        assert!(Decoder::new(CompressionMethod::None, 0).unwrap().is_finished());
    }

    #[test]
    fn trailing_bytes_are_left_over() {
        let (mut compressed, _) = compress(CompressionMethod::Deflate, DEFAULT_LEVEL, b"hello hello hello");
        let stream_len = compressed.len();
        compressed.extend_from_slice(b"PK\x07\x08trailing");

        let mut decoder = Decoder::new(CompressionMethod::Deflate, compressed.len() as u64).unwrap();
        let mut buf = [0u8; 64];
        let p = decoder.feed(&compressed, &mut buf).unwrap();
        assert!(p.finished);
        assert_eq!(&buf[..p.produced], b"hello hello hello");
        assert_eq!(decoder.total_in(), stream_len as u64);
        assert_eq!(decoder.leftover(), b"PK\x07\x08trailing");
    }

    #[test]
    fn garbage_is_an_error() {
        let mut decoder = Decoder::new(CompressionMethod::Deflate, 16).unwrap();
        let mut buf = [0u8; 64];
        // Block type 3 is reserved.
        assert!(decoder.feed(&[0xff; 16], &mut buf).is_err());
    }

    #[test]
    fn unsupported_methods() {
        assert!(matches!(
            Encoder::new(CompressionMethod::Unsupported(12), 6),
            Err(ZipError::UnsupportedFeature(_))
        ));
        assert!(matches!(
            Decoder::new(CompressionMethod::Unsupported(14), 0),
            Err(ZipError::UnsupportedFeature(_))
        ));
    }
}
