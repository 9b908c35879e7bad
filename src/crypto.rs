//! Entry encryption
//!
//! Traditional PKWARE encryption ("ZipCrypto") lives here.
//! It's thoroughly broken, but everything can read it.
//! WinZip's AES scheme lives in the `aes` module,
//! behind the `aes-crypto` feature.

use std::sync::atomic::{compiler_fence, Ordering};

use rand::{rngs::OsRng, RngCore};

#[cfg(feature = "aes-crypto")]
use crate::aes::AesCipher;

/// How an entry in an archive is encrypted
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Encryption {
    /// Traditional PKWARE encryption
    ZipCrypto,
    /// WinZip AES
    Aes {
        strength: AesStrength,
        /// 1 for AE-1, 2 for AE-2 (which doesn't store a CRC)
        vendor_version: u16,
    },
    /// PKWARE's strong encryption, which we can't read.
    Strong,
}

/// How to encrypt a new entry
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EncryptionMethod {
    /// Traditional PKWARE encryption. Weak, but universally supported.
    ZipCrypto,
    /// WinZip AES (AE-2)
    Aes(AesStrength),
}

/// AES key size, as recorded in the AES extra field
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum AesStrength {
    Aes128 = 1,
    Aes192 = 2,
    Aes256 = 3,
}

impl AesStrength {
    pub fn from_u8(u: u8) -> Option<Self> {
        match u {
            1 => Some(AesStrength::Aes128),
            2 => Some(AesStrength::Aes192),
            3 => Some(AesStrength::Aes256),
            _ => None,
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            AesStrength::Aes128 => 16,
            AesStrength::Aes192 => 24,
            AesStrength::Aes256 => 32,
        }
    }

    pub fn salt_len(self) -> usize {
        self.key_len() / 2
    }
}

/// Zeroes a buffer that held a password or key.
pub(crate) fn scrub(buf: &mut [u8]) {
    buf.fill(0);
    compiler_fence(Ordering::SeqCst);
}

/// Length of the random header before ZipCrypto data
pub const ZIPCRYPTO_HEADER_LEN: usize = 12;

/// One raw step of CRC-32, with none of the usual pre- and post-inversion
fn crc32_byte(crc: u32, b: u8) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(!crc);
    hasher.update(&[b]);
    !hasher.finalize()
}

/// The three keys of traditional PKWARE encryption (APPNOTE 6.1)
pub(crate) struct ZipCryptoKeys {
    keys: [u32; 3],
}

impl ZipCryptoKeys {
    pub fn new(password: &[u8]) -> Self {
        let mut k = Self {
            keys: [0x1234_5678, 0x2345_6789, 0x3456_7890],
        };
        for b in password {
            k.update(*b);
        }
        k
    }

    fn update(&mut self, plain: u8) {
        self.keys[0] = crc32_byte(self.keys[0], plain);
        self.keys[1] = self.keys[1]
            .wrapping_add(self.keys[0] & 0xff)
            .wrapping_mul(134_775_813)
            .wrapping_add(1);
        self.keys[2] = crc32_byte(self.keys[2], (self.keys[1] >> 24) as u8);
    }

    fn stream_byte(&self) -> u8 {
        let temp = (self.keys[2] | 2) as u16 as u32;
        (temp.wrapping_mul(temp ^ 1) >> 8) as u8
    }

    pub fn decrypt(&mut self, buf: &mut [u8]) {
        for b in buf {
            let plain = *b ^ self.stream_byte();
            self.update(plain);
            *b = plain;
        }
    }

    pub fn encrypt(&mut self, buf: &mut [u8]) {
        for b in buf {
            let cipher = *b ^ self.stream_byte();
            self.update(*b);
            *b = cipher;
        }
    }

    /// Decrypts an entry's 12-byte header and checks its last byte
    /// against the acceptable values (the high byte of the CRC or DOS time).
    /// Returns the keys, ready for the entry's data, if it matches.
    pub fn open(
        password: &[u8],
        header: &[u8; ZIPCRYPTO_HEADER_LEN],
        checks: &[u8],
    ) -> Option<Self> {
        let mut keys = Self::new(password);
        let mut header = *header;
        keys.decrypt(&mut header);
        if checks.contains(&header[ZIPCRYPTO_HEADER_LEN - 1]) {
            Some(keys)
        } else {
            None
        }
    }

    /// Makes a random, encrypted header for a new entry,
    /// ending with `check`.
    pub fn start(password: &[u8], check: u8) -> (Self, [u8; ZIPCRYPTO_HEADER_LEN]) {
        let mut keys = Self::new(password);
        let mut header = [0u8; ZIPCRYPTO_HEADER_LEN];
        OsRng.fill_bytes(&mut header[..ZIPCRYPTO_HEADER_LEN - 1]);
        header[ZIPCRYPTO_HEADER_LEN - 1] = check;
        keys.encrypt(&mut header);
        (keys, header)
    }
}

/// A password we're holding onto, zeroed when dropped
#[derive(Clone)]
pub(crate) struct Password(Vec<u8>);

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Password(..)")
    }
}

impl Password {
    pub fn new(bytes: &[u8]) -> Self {
        Password(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for Password {
    fn drop(&mut self) {
        scrub(&mut self.0);
    }
}

impl Drop for ZipCryptoKeys {
    fn drop(&mut self) {
        self.keys = [0; 3];
        compiler_fence(Ordering::SeqCst);
    }
}

/// Whichever cipher an open entry is using
pub(crate) enum Cipher {
    ZipCrypto(ZipCryptoKeys),
    #[cfg(feature = "aes-crypto")]
    Aes(Box<AesCipher>),
}

impl Cipher {
    pub fn decrypt(&mut self, buf: &mut [u8]) {
        match self {
            Cipher::ZipCrypto(keys) => keys.decrypt(buf),
            #[cfg(feature = "aes-crypto")]
            Cipher::Aes(aes) => aes.decrypt(buf),
        }
    }

    pub fn encrypt(&mut self, buf: &mut [u8]) {
        match self {
            Cipher::ZipCrypto(keys) => keys.encrypt(buf),
            #[cfg(feature = "aes-crypto")]
            Cipher::Aes(aes) => aes.encrypt(buf),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_schedule() {
        let keys = ZipCryptoKeys::new(b"secret");
        assert_eq!(keys.keys, [0xdda9_e469, 0x9621_2999, 0xf9fc_9651]);

        // Python's zipfile decrypts this back to the original
        let mut keys = ZipCryptoKeys::new(b"secret");
        let mut data = b"Hello, ZipCrypto!".to_vec();
        keys.encrypt(&mut data);
        assert_eq!(
            data,
            [
                0x80, 0x75, 0xf6, 0x32, 0x20, 0x4d, 0xe8, 0x85, 0x45, 0x14, 0x63, 0x16, 0x18,
                0x55, 0x4f, 0xb8, 0xa4
            ]
        );
    }

    #[test]
    fn zipcrypto_round_trip() {
        let (mut keys, header) = ZipCryptoKeys::start(b"hunter2", 0xab);
        let mut data = b"some secret text".to_vec();
        keys.encrypt(&mut data);
        assert_ne!(&data[..], b"some secret text");

        let mut keys = ZipCryptoKeys::open(b"hunter2", &header, &[0xab]).unwrap();
        keys.decrypt(&mut data);
        assert_eq!(&data[..], b"some secret text");
    }

    #[test]
    fn zipcrypto_wrong_password() {
        let (_, header) = ZipCryptoKeys::start(b"hunter2", 0xab);
        // The check byte is only one byte, so one wrong password in 256 slips past.
        // Count rather than asserting on any single guess.
        let wrong = (0..100u32)
            .filter(|i| ZipCryptoKeys::open(format!("nope{}", i).as_bytes(), &header, &[0xab]).is_none())
            .count();
        assert!(wrong > 90);
    }

    #[test]
    fn strengths() {
        assert_eq!(AesStrength::from_u8(3), Some(AesStrength::Aes256));
        assert_eq!(AesStrength::from_u8(4), None);
        assert_eq!(AesStrength::Aes128.salt_len(), 8);
        assert_eq!(AesStrength::Aes192.salt_len(), 12);
        assert_eq!(AesStrength::Aes256.key_len(), 32);
    }
}
