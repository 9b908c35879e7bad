//! WinZip AES encryption (AE-1 and AE-2)
//!
//! See <https://www.winzip.com/en/support/aes-encryption/>.
//! Entry data is a salt, a two-byte password verifier,
//! the AES-CTR encrypted data, and ten bytes of HMAC-SHA1 over that data.
//! Keys come from PBKDF2-HMAC-SHA1 with 1000 iterations.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{KeyIvInit, StreamCipher};
use aes::{Aes128, Aes192, Aes256};
use ctr::Ctr128LE;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use sha1::Sha1;

use crate::crypto::{scrub, AesStrength};

type HmacSha1 = Hmac<Sha1>;

pub const PASSWORD_VERIFIER_LEN: usize = 2;
pub const AUTH_CODE_LEN: usize = 10;
const ITERATIONS: u32 = 1000;

enum Keystream {
    Aes128(Ctr128LE<Aes128>),
    Aes192(Ctr128LE<Aes192>),
    Aes256(Ctr128LE<Aes256>),
}

impl Keystream {
    fn apply(&mut self, buf: &mut [u8]) {
        match self {
            Keystream::Aes128(c) => c.apply_keystream(buf),
            Keystream::Aes192(c) => c.apply_keystream(buf),
            Keystream::Aes256(c) => c.apply_keystream(buf),
        }
    }
}

/// AES-CTR plus the running HMAC for one entry
pub(crate) struct AesCipher {
    keystream: Keystream,
    mac: HmacSha1,
}

impl AesCipher {
    /// Derives keys from the password and salt.
    /// Returns the cipher and the password verifier the entry should carry.
    pub fn new(
        strength: AesStrength,
        password: &[u8],
        salt: &[u8],
    ) -> (Self, [u8; PASSWORD_VERIFIER_LEN]) {
        let key_len = strength.key_len();
        let mut derived = vec![0u8; key_len * 2 + PASSWORD_VERIFIER_LEN];
        pbkdf2_hmac::<Sha1>(password, salt, ITERATIONS, &mut derived);

        let (key, rest) = derived.split_at(key_len);
        let (mac_key, verifier) = rest.split_at(key_len);

        // WinZip's counter is little-endian and starts at one.
        let iv = 1u128.to_le_bytes();
        let iv = GenericArray::from_slice(&iv);
        let keystream = match strength {
            AesStrength::Aes128 => {
                Keystream::Aes128(Ctr128LE::new(GenericArray::from_slice(key), iv))
            }
            AesStrength::Aes192 => {
                Keystream::Aes192(Ctr128LE::new(GenericArray::from_slice(key), iv))
            }
            AesStrength::Aes256 => {
                Keystream::Aes256(Ctr128LE::new(GenericArray::from_slice(key), iv))
            }
        };
        let mac = HmacSha1::new_from_slice(mac_key).expect("HMAC takes keys of any length");
        let verifier = [verifier[0], verifier[1]];
        scrub(&mut derived);

        (Self { keystream, mac }, verifier)
    }

    /// Makes a fresh random salt and cipher for a new entry.
    /// Returns the cipher and the salt + verifier to write before the data.
    pub fn start(strength: AesStrength, password: &[u8]) -> (Self, Vec<u8>) {
        let mut header = vec![0u8; strength.salt_len()];
        OsRng.fill_bytes(&mut header);
        let (cipher, verifier) = Self::new(strength, password, &header);
        header.extend_from_slice(&verifier);
        (cipher, header)
    }

    pub fn decrypt(&mut self, buf: &mut [u8]) {
        self.mac.update(buf);
        self.keystream.apply(buf);
    }

    pub fn encrypt(&mut self, buf: &mut [u8]) {
        self.keystream.apply(buf);
        self.mac.update(buf);
    }

    /// The authentication code over all the ciphertext so far.
    pub fn auth_code(&self) -> [u8; AUTH_CODE_LEN] {
        let full = self.mac.clone().finalize().into_bytes();
        let mut code = [0u8; AUTH_CODE_LEN];
        code.copy_from_slice(&full[..AUTH_CODE_LEN]);
        code
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_every_strength() {
        for strength in &[
            AesStrength::Aes128,
            AesStrength::Aes192,
            AesStrength::Aes256,
        ] {
            let (mut encryptor, header) = AesCipher::start(*strength, b"correct horse");
            assert_eq!(
                header.len(),
                strength.salt_len() + PASSWORD_VERIFIER_LEN
            );
            let plain: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();
            let mut data = plain.clone();
            // In uneven pieces: CTR has to carry its position across calls.
            let (a, b) = data.split_at_mut(333);
            encryptor.encrypt(a);
            encryptor.encrypt(b);
            assert_ne!(data, plain);

            let (salt, verifier) = header.split_at(strength.salt_len());
            let (mut decryptor, expected) = AesCipher::new(*strength, b"correct horse", salt);
            assert_eq!(&expected[..], verifier);
            decryptor.decrypt(&mut data);
            assert_eq!(data, plain);
            assert_eq!(decryptor.auth_code(), encryptor.auth_code());
        }
    }

    #[test]
    fn tampering_changes_the_auth_code() {
        let (mut encryptor, header) = AesCipher::start(AesStrength::Aes256, b"pw");
        let mut data = b"attack at dawn".to_vec();
        encryptor.encrypt(&mut data);
        data[3] ^= 1;

        let salt = &header[..AesStrength::Aes256.salt_len()];
        let (mut decryptor, _) = AesCipher::new(AesStrength::Aes256, b"pw", salt);
        decryptor.decrypt(&mut data);
        assert_ne!(decryptor.auth_code(), encryptor.auth_code());
    }

    #[test]
    fn derivation_is_deterministic() {
        let salt = [7u8; 16];
        let (_, a) = AesCipher::new(AesStrength::Aes256, b"password", &salt);
        let (_, b) = AesCipher::new(AesStrength::Aes256, b"password", &salt);
        assert_eq!(a, b);
    }
}
