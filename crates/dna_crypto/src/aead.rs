//! Authenticated Encryption with Associated Data
//!
//! AES-256-GCM with an explicit 12-byte nonce. The wire formats in this
//! protocol carry the nonce at fixed offsets, so unlike a prepended-nonce
//! helper the caller always supplies it.
//!
//! Key: 32 bytes.  Nonce: 12 bytes.  Tag: 16 bytes (appended by GCM).

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Encrypt `plaintext`; returns ciphertext with the 16-byte tag appended.
pub fn encrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AeadEncrypt)
}

/// Decrypt ciphertext-with-tag. Tag or AAD mismatch fails closed.
pub fn decrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

/// Fresh random nonce for formats that transmit it alongside the ciphertext.
pub fn random_nonce() -> [u8; NONCE_LEN] {
    use rand::RngCore;
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = [1u8; 32];
        let nonce = random_nonce();
        let ct = encrypt(&key, &nonce, b"secret", b"aad").unwrap();
        assert_eq!(ct.len(), 6 + TAG_LEN);
        let pt = decrypt(&key, &nonce, &ct, b"aad").unwrap();
        assert_eq!(&*pt, b"secret");
    }

    #[test]
    fn aad_mismatch_fails() {
        let key = [1u8; 32];
        let nonce = [2u8; 12];
        let ct = encrypt(&key, &nonce, b"secret", b"aad").unwrap();
        assert!(decrypt(&key, &nonce, &ct, b"other").is_err());
    }

    #[test]
    fn tamper_fails() {
        let key = [1u8; 32];
        let nonce = [2u8; 12];
        let mut ct = encrypt(&key, &nonce, b"secret", b"").unwrap();
        ct[0] ^= 0x01;
        assert!(decrypt(&key, &nonce, &ct, b"").is_err());
    }
}
