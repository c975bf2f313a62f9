//! dna_crypto — DNA messenger cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Public APIs return opaque newtypes to prevent accidental misuse.
//!
//! # Module layout
//! - `mnemonic`    — 24-word recovery phrase + deterministic seed derivation
//! - `keys`        — ML-DSA-87 signing and ML-KEM-1024 encapsulation keypairs
//! - `fingerprint` — SHA3-512 identity fingerprint of a signing public key
//! - `kdf`         — Argon2id file-key derivation, HKDF-SHA512 sub-seeds
//! - `aead`        — AES-256-GCM with explicit nonce and AAD
//! - `keyfile`     — sealed at-rest container for key material
//! - `error`       — unified error type

pub mod aead;
pub mod error;
pub mod fingerprint;
pub mod kdf;
pub mod keyfile;
pub mod keys;
pub mod mnemonic;

pub use error::CryptoError;
pub use fingerprint::Fingerprint;
pub use keys::{KemKeyPair, KemPublicKey, SharedSecret, SigningKeyPair, SigningPublicKey};
pub use mnemonic::{MasterSeed, RecoveryPhrase};
