//! Sealed blob format used for the remediation catalog and the rule set.
//!
//! Layout: `nonce (24) || checksum (4, little-endian) || ciphertext+tag`.
//! The checksum is a CRC-32 with the Koopman polynomial over the plaintext and
//! doubles as the associated data, so tampering with either half fails.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use crc::{Algorithm, Crc};

use crate::error::SealError;

const NONCE_LEN: usize = 24;
const CHECKSUM_LEN: usize = 4;
pub const KEY_LEN: usize = 32;

const KOOPMAN: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x741b_8cd7,
    init: 0xffff_ffff,
    refin: true,
    refout: true,
    xorout: 0xffff_ffff,
    check: 0x2d3d_d0ae,
    residue: 0x0000_0000,
};

static KCRC32: Crc<u32> = Crc::<u32>::new(&KOOPMAN);

pub fn kcrc32(data: &[u8]) -> u32 {
    KCRC32.checksum(data)
}

/// Opens sealed blobs. The agent only ever decrypts; sealing lives in
/// [`seal`] for tooling and tests.
pub trait BlobDecryptor: Send + Sync {
    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, SealError>;
}

#[derive(Clone)]
pub struct XChaChaDecryptor {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for XChaChaDecryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XChaChaDecryptor").finish_non_exhaustive()
    }
}

impl XChaChaDecryptor {
    pub fn new(key: &[u8]) -> Result<Self, SealError> {
        let key: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| SealError::KeyLength(key.len()))?;
        Ok(Self { key })
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, SealError> {
        let raw = hex::decode(hex_key.trim())?;
        Self::new(&raw)
    }
}

impl BlobDecryptor for XChaChaDecryptor {
    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, SealError> {
        if blob.len() < NONCE_LEN + CHECKSUM_LEN {
            return Err(SealError::Truncated);
        }
        let (nonce, rest) = blob.split_at(NONCE_LEN);
        let (checksum, ciphertext) = rest.split_at(CHECKSUM_LEN);

        let cipher = XChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|_| SealError::KeyLength(self.key.len()))?;
        let plain = cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: checksum,
                },
            )
            .map_err(|_| SealError::DecryptionFailed)?;

        let mut stored = [0u8; CHECKSUM_LEN];
        stored.copy_from_slice(checksum);
        if kcrc32(&plain) != u32::from_le_bytes(stored) {
            return Err(SealError::DecryptionFailed);
        }
        Ok(plain)
    }
}

/// Seal `plain` under `key` with a fresh random nonce.
pub fn seal(key: &[u8], plain: &[u8]) -> Result<Vec<u8>, SealError> {
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| SealError::KeyLength(key.len()))?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let checksum = kcrc32(plain).to_le_bytes();
    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plain,
                aad: &checksum,
            },
        )
        .map_err(|_| SealError::Nonce)?;

    let mut out = Vec::with_capacity(NONCE_LEN + CHECKSUM_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&checksum);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LEN] = [7u8; KEY_LEN];

    #[test]
    fn sealed_blob_opens_with_same_key() {
        let blob = seal(&KEY, b"{\"version\":1}").unwrap();
        let plain = XChaChaDecryptor::new(&KEY).unwrap().decrypt(&blob).unwrap();
        assert_eq!(plain, b"{\"version\":1}");
    }

    #[test]
    fn wrong_key_or_tampered_checksum_fails() {
        let blob = seal(&KEY, b"payload").unwrap();
        let other = XChaChaDecryptor::new(&[8u8; KEY_LEN]).unwrap();
        assert!(matches!(
            other.decrypt(&blob),
            Err(SealError::DecryptionFailed)
        ));

        let mut tampered = blob.clone();
        tampered[NONCE_LEN] ^= 0xff;
        let dec = XChaChaDecryptor::new(&KEY).unwrap();
        assert!(matches!(
            dec.decrypt(&tampered),
            Err(SealError::DecryptionFailed)
        ));
    }

    #[test]
    fn short_blob_and_bad_keys_are_rejected() {
        let dec = XChaChaDecryptor::new(&KEY).unwrap();
        assert!(matches!(dec.decrypt(&[0u8; 10]), Err(SealError::Truncated)));
        assert!(matches!(
            XChaChaDecryptor::new(&[1u8; 16]),
            Err(SealError::KeyLength(16))
        ));
        assert!(matches!(
            XChaChaDecryptor::from_hex("zz"),
            Err(SealError::KeyHex(_))
        ));
    }

    #[test]
    fn hex_key_round_trips() {
        let dec = XChaChaDecryptor::from_hex(&hex::encode(KEY)).unwrap();
        let blob = seal(&KEY, b"x").unwrap();
        assert_eq!(dec.decrypt(&blob).unwrap(), b"x");
    }

    #[test]
    fn koopman_crc_matches_known_check_value() {
        let ieee = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC).checksum(b"123456789");
        assert_ne!(kcrc32(b"123456789"), ieee);
        assert_eq!(kcrc32(b"123456789"), 0x2d3d_d0ae);
        assert_eq!(kcrc32(b""), 0);
    }
}
