//! Key derivation functions
//!
//! `file_key_from_password` — Argon2id, derives the 32-byte key wrapping
//!   private key material at rest.
//!
//! `hkdf_sha512` — HKDF-SHA512, used for the recovery-phrase sub-seeds.

use argon2::{Argon2, Params, Version};
use hkdf::Hkdf;
use sha2::Sha512;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

// ── File key (Argon2id) ──────────────────────────────────────────────────────

/// 32-byte at-rest wrapping key derived from a user password. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct FileKey(pub [u8; 32]);

/// Argon2id cost parameters, persisted next to the sealed blob so files
/// survive a future retuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub salt: [u8; 16],
    pub t_cost: u32,
    pub m_cost_kib: u32,
    pub p_cost: u32,
}

impl KdfParams {
    /// Interactive desktop defaults: t=3, m=64 MiB, p=1.
    pub fn fresh() -> Self {
        Self {
            salt: generate_salt(),
            t_cost: 3,
            m_cost_kib: 64 * 1024,
            p_cost: 1,
        }
    }
}

/// Derive the at-rest wrapping key from a password and stored parameters.
pub fn file_key_from_password(
    password: &[u8],
    params: &KdfParams,
) -> Result<FileKey, CryptoError> {
    let argon_params = Params::new(params.m_cost_kib, params.t_cost, params.p_cost, Some(32))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon_params);
    let mut output = [0u8; 32];
    argon2
        .hash_password_into(password, &params.salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(FileKey(output))
}

/// Fresh random 16-byte salt (stored in the key-file header; not secret).
pub fn generate_salt() -> [u8; 16] {
    use rand::RngCore;
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

// ── HKDF-SHA512 ──────────────────────────────────────────────────────────────

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
pub fn hkdf_sha512(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha512>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argon2_is_deterministic_per_salt() {
        let params = KdfParams {
            salt: [9u8; 16],
            t_cost: 1,
            m_cost_kib: 8,
            p_cost: 1,
        };
        let a = file_key_from_password(b"pw", &params).unwrap();
        let b = file_key_from_password(b"pw", &params).unwrap();
        assert_eq!(a.0, b.0);

        let other = file_key_from_password(b"other", &params).unwrap();
        assert_ne!(a.0, other.0);
    }

    #[test]
    fn hkdf_separates_by_info() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        hkdf_sha512(b"ikm", None, b"dna.sign", &mut a).unwrap();
        hkdf_sha512(b"ikm", None, b"dna.kem", &mut b).unwrap();
        assert_ne!(a, b);
    }
}
