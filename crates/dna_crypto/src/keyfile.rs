//! Sealed at-rest container for key material.
//!
//! Self-describing layout, fixed offsets:
//!
//! ```text
//! magic(8)="DNAKEYS\0" ‖ version(2) ‖ alg_id(2) ‖ pub_len(4) ‖ priv_len(4)
//! ‖ kdf_params(32) ‖ nonce(12) ‖ aead_tag(16) ‖ pub_key ‖ enc_priv
//! ```
//!
//! `kdf_params` = salt(16) ‖ t_cost(4) ‖ m_cost_kib(4) ‖ p_cost(4) ‖ flags(4),
//! all integers big-endian. Flags bit 0 set means the private section is
//! AES-256-GCM encrypted under an Argon2id-derived key; clear means the
//! private section is stored in the clear, which callers may only request
//! through explicit configuration.
//!
//! The header through `kdf_params` is bound as AAD, so algorithm or length
//! tampering fails the tag check. A failed password check returns
//! `WrongPassword` and never touches the file.

use std::fs;
use std::path::Path;

use zeroize::Zeroizing;

use crate::aead;
use crate::error::CryptoError;
use crate::kdf::{self, KdfParams};

const MAGIC: &[u8; 8] = b"DNAKEYS\0";
const VERSION: u16 = 1;
const HEADER_LEN: usize = 80;
const FLAG_ENCRYPTED: u32 = 1;

/// What a container holds. The id is part of the sealed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFileAlg {
    /// ML-DSA-87 signing keypair (`identity.dsa`).
    MlDsa87,
    /// ML-KEM-1024 keypair (`identity.kem`).
    MlKem1024,
    /// Recovery mnemonic (`identity.mnem`); public section empty.
    Mnemonic,
    /// Message-backup snapshot; public section empty.
    Snapshot,
}

impl KeyFileAlg {
    fn id(self) -> u16 {
        match self {
            KeyFileAlg::MlDsa87 => 1,
            KeyFileAlg::MlKem1024 => 2,
            KeyFileAlg::Mnemonic => 3,
            KeyFileAlg::Snapshot => 4,
        }
    }

    fn from_id(id: u16) -> Result<Self, CryptoError> {
        match id {
            1 => Ok(KeyFileAlg::MlDsa87),
            2 => Ok(KeyFileAlg::MlKem1024),
            3 => Ok(KeyFileAlg::Mnemonic),
            4 => Ok(KeyFileAlg::Snapshot),
            other => Err(CryptoError::KeyFile(format!("unknown alg id {other}"))),
        }
    }
}

/// Decoded container contents.
#[derive(Debug)]
pub struct KeyFile {
    pub alg: KeyFileAlg,
    pub public: Vec<u8>,
    pub secret: Zeroizing<Vec<u8>>,
}

/// Serialize and seal a container to bytes.
pub fn seal_bytes(
    alg: KeyFileAlg,
    public: &[u8],
    secret: &[u8],
    password: Option<&str>,
) -> Result<Vec<u8>, CryptoError> {
    let (params, flags) = match password {
        Some(_) => (KdfParams::fresh(), FLAG_ENCRYPTED),
        None => (
            KdfParams {
                salt: [0u8; 16],
                t_cost: 0,
                m_cost_kib: 0,
                p_cost: 0,
            },
            0,
        ),
    };

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(MAGIC);
    header.extend_from_slice(&VERSION.to_be_bytes());
    header.extend_from_slice(&alg.id().to_be_bytes());
    header.extend_from_slice(&(public.len() as u32).to_be_bytes());
    header.extend_from_slice(&(secret.len() as u32).to_be_bytes());
    header.extend_from_slice(&params.salt);
    header.extend_from_slice(&params.t_cost.to_be_bytes());
    header.extend_from_slice(&params.m_cost_kib.to_be_bytes());
    header.extend_from_slice(&params.p_cost.to_be_bytes());
    header.extend_from_slice(&flags.to_be_bytes());
    debug_assert_eq!(header.len(), 52);

    let (nonce, tag, enc_priv) = match password {
        Some(pw) => {
            let key = kdf::file_key_from_password(pw.as_bytes(), &params)?;
            let nonce = aead::random_nonce();
            let mut ct = aead::encrypt(&key.0, &nonce, secret, &header)?;
            let tag: [u8; aead::TAG_LEN] = ct
                .split_off(ct.len() - aead::TAG_LEN)
                .try_into()
                .map_err(|_| CryptoError::AeadEncrypt)?;
            (nonce, tag, ct)
        }
        None => ([0u8; aead::NONCE_LEN], [0u8; aead::TAG_LEN], secret.to_vec()),
    };

    let mut out = header;
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&tag);
    out.extend_from_slice(public);
    out.extend_from_slice(&enc_priv);
    Ok(out)
}

/// Parse and unseal a container from bytes.
pub fn open_bytes(data: &[u8], password: Option<&str>) -> Result<KeyFile, CryptoError> {
    if data.len() < HEADER_LEN {
        return Err(CryptoError::KeyFile("truncated header".into()));
    }
    if &data[0..8] != MAGIC {
        return Err(CryptoError::KeyFile("bad magic".into()));
    }
    let version = u16::from_be_bytes([data[8], data[9]]);
    if version != VERSION {
        return Err(CryptoError::KeyFile(format!("unsupported version {version}")));
    }
    let alg = KeyFileAlg::from_id(u16::from_be_bytes([data[10], data[11]]))?;
    let pub_len = u32::from_be_bytes(data[12..16].try_into().unwrap()) as usize;
    let priv_len = u32::from_be_bytes(data[16..20].try_into().unwrap()) as usize;

    let mut salt = [0u8; 16];
    salt.copy_from_slice(&data[20..36]);
    let params = KdfParams {
        salt,
        t_cost: u32::from_be_bytes(data[36..40].try_into().unwrap()),
        m_cost_kib: u32::from_be_bytes(data[40..44].try_into().unwrap()),
        p_cost: u32::from_be_bytes(data[44..48].try_into().unwrap()),
    };
    let flags = u32::from_be_bytes(data[48..52].try_into().unwrap());

    let mut nonce = [0u8; aead::NONCE_LEN];
    nonce.copy_from_slice(&data[52..64]);
    let tag = &data[64..80];

    if data.len() != HEADER_LEN + pub_len + priv_len {
        return Err(CryptoError::KeyFile("length fields disagree with file size".into()));
    }
    let public = data[HEADER_LEN..HEADER_LEN + pub_len].to_vec();
    let enc_priv = &data[HEADER_LEN + pub_len..];

    let secret = if flags & FLAG_ENCRYPTED != 0 {
        let pw = password.ok_or(CryptoError::WrongPassword)?;
        let key = kdf::file_key_from_password(pw.as_bytes(), &params)?;
        let mut ct = Vec::with_capacity(enc_priv.len() + aead::TAG_LEN);
        ct.extend_from_slice(enc_priv);
        ct.extend_from_slice(tag);
        let header_aad = &data[0..52];
        aead::decrypt(&key.0, &nonce, &ct, header_aad)
            .map(|pt| Zeroizing::new(pt.to_vec()))
            .map_err(|_| CryptoError::WrongPassword)?
    } else {
        Zeroizing::new(enc_priv.to_vec())
    };

    Ok(KeyFile {
        alg,
        public,
        secret,
    })
}

/// Seal a container to disk. The write is atomic (temp file + rename).
pub fn seal(
    path: &Path,
    alg: KeyFileAlg,
    public: &[u8],
    secret: &[u8],
    password: Option<&str>,
) -> Result<(), CryptoError> {
    let bytes = seal_bytes(alg, public, secret, password)?;
    write_atomic(path, &bytes)
}

/// Load and unseal a container from disk.
pub fn load(path: &Path, password: Option<&str>) -> Result<KeyFile, CryptoError> {
    let data = fs::read(path)?;
    open_bytes(&data, password)
}

/// Re-wrap the private section under a new password, fresh salt and nonce.
/// Verification failure leaves the file untouched.
pub fn change_password(
    path: &Path,
    old: Option<&str>,
    new: Option<&str>,
) -> Result<(), CryptoError> {
    let current = load(path, old)?;
    seal(path, current.alg, &current.public, &current.secret, new)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CryptoError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_roundtrip() {
        let bytes = seal_bytes(KeyFileAlg::MlDsa87, b"PUB", b"SECRET", Some("p1")).unwrap();
        let kf = open_bytes(&bytes, Some("p1")).unwrap();
        assert_eq!(kf.alg, KeyFileAlg::MlDsa87);
        assert_eq!(kf.public, b"PUB");
        assert_eq!(&*kf.secret, b"SECRET");
    }

    #[test]
    fn wrong_password_is_reported_as_such() {
        let bytes = seal_bytes(KeyFileAlg::MlKem1024, b"", b"SECRET", Some("p1")).unwrap();
        match open_bytes(&bytes, Some("p2")) {
            Err(CryptoError::WrongPassword) => {}
            other => panic!("expected WrongPassword, got {other:?}"),
        }
        match open_bytes(&bytes, None) {
            Err(CryptoError::WrongPassword) => {}
            other => panic!("expected WrongPassword, got {other:?}"),
        }
    }

    #[test]
    fn cleartext_mode_roundtrip() {
        let bytes = seal_bytes(KeyFileAlg::Mnemonic, b"", b"word list", None).unwrap();
        let kf = open_bytes(&bytes, None).unwrap();
        assert_eq!(&*kf.secret, b"word list");
    }

    #[test]
    fn header_tampering_fails_tag_check() {
        let mut bytes = seal_bytes(KeyFileAlg::MlDsa87, b"PUB", b"SECRET", Some("p1")).unwrap();
        bytes[10] = 0;
        bytes[11] = 2; // claim MlKem1024
        assert!(open_bytes(&bytes, Some("p1")).is_err());
    }

    #[test]
    fn rejects_malformed() {
        assert!(open_bytes(b"short", None).is_err());
        let mut bytes = seal_bytes(KeyFileAlg::MlDsa87, b"PUB", b"SECRET", None).unwrap();
        bytes[0] = b'X';
        assert!(open_bytes(&bytes, None).is_err());
    }

    #[test]
    fn change_password_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.dsa");
        seal(&path, KeyFileAlg::MlDsa87, b"PUB", b"SECRET", Some("p1")).unwrap();

        change_password(&path, Some("p1"), Some("p2")).unwrap();
        match load(&path, Some("p1")) {
            Err(CryptoError::WrongPassword) => {}
            other => panic!("expected WrongPassword, got {other:?}"),
        }
        let kf = load(&path, Some("p2")).unwrap();
        assert_eq!(&*kf.secret, b"SECRET");
    }

    #[test]
    fn change_password_with_wrong_old_leaves_file_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.kem");
        seal(&path, KeyFileAlg::MlKem1024, b"", b"SECRET", Some("p1")).unwrap();
        let before = fs::read(&path).unwrap();

        assert!(change_password(&path, Some("bad"), Some("p2")).is_err());
        assert_eq!(fs::read(&path).unwrap(), before);
        assert_eq!(&*load(&path, Some("p1")).unwrap().secret, b"SECRET");
    }
}
