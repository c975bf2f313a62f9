//! ML-DSA-87 signing and ML-KEM-1024 encapsulation keypairs.
//!
//! Both keypairs support two constructions:
//!   - `from_seed` — deterministic, driven by a ChaCha20 stream seeded from
//!     the recovery-phrase sub-seed. Same seed, same keys, every platform.
//!   - `from_secret_bytes` — rehydration from the sealed key store.
//!
//! Secret key bytes are the canonical representation; the typed library
//! handles are rebuilt per operation and the bytes are zeroized on drop.

use fips203::ml_kem_1024 as mlkem;
use fips203::traits::{Decaps, Encaps, KeyGen as KemKeyGen, SerDes as KemSerDes};
use fips204::ml_dsa_87 as mldsa;
use fips204::traits::{KeyGen as DsaKeyGen, SerDes as DsaSerDes, Signer, Verifier};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::fingerprint::Fingerprint;

/// Public key and signature sizes, fixed by the parameter sets.
pub const SIGNING_PUBKEY_LEN: usize = mldsa::PK_LEN; // 2592
pub const SIGNING_SECKEY_LEN: usize = mldsa::SK_LEN; // 4896
pub const SIGNATURE_LEN: usize = mldsa::SIG_LEN; // 4627
pub const KEM_PUBKEY_LEN: usize = mlkem::EK_LEN; // 1568
pub const KEM_SECKEY_LEN: usize = mlkem::DK_LEN; // 3168
pub const KEM_CIPHERTEXT_LEN: usize = mlkem::CT_LEN; // 1568
pub const SHARED_SECRET_LEN: usize = 32;

/// 32-byte KEM shared secret, zeroized on drop.
pub type SharedSecret = Zeroizing<[u8; SHARED_SECRET_LEN]>;

// ── Signing (ML-DSA-87) ──────────────────────────────────────────────────────

/// ML-DSA-87 public key bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningPublicKey(Vec<u8>);

impl SigningPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SIGNING_PUBKEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "signing public key must be {SIGNING_PUBKEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The identity fingerprint is a pure projection of these bytes.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_signing_key(&self.0)
    }

    /// Verify a detached signature made by this key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        verify_detached(&self.0, message, signature)
    }
}

/// Long-term identity signing keypair. Drop clears the secret bytes.
#[derive(ZeroizeOnDrop)]
pub struct SigningKeyPair {
    #[zeroize(skip)]
    public: SigningPublicKey,
    secret_bytes: Vec<u8>,
}

impl SigningKeyPair {
    /// Deterministic keygen from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self, CryptoError> {
        let mut rng = ChaCha20Rng::from_seed(*seed);
        let (pk, sk) = mldsa::KG::try_keygen_with_rng(&mut rng)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(Self {
            public: SigningPublicKey(pk.into_bytes().to_vec()),
            secret_bytes: sk.into_bytes().to_vec(),
        })
    }

    /// Rehydrate from stored public + secret bytes.
    pub fn from_parts(public: &[u8], secret: &[u8]) -> Result<Self, CryptoError> {
        if secret.len() != SIGNING_SECKEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "signing secret key must be {SIGNING_SECKEY_LEN} bytes, got {}",
                secret.len()
            )));
        }
        Ok(Self {
            public: SigningPublicKey::from_bytes(public)?,
            secret_bytes: secret.to_vec(),
        })
    }

    pub fn public(&self) -> &SigningPublicKey {
        &self.public
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.public.fingerprint()
    }

    pub fn secret_bytes(&self) -> &[u8] {
        &self.secret_bytes
    }

    /// Detached ML-DSA-87 signature (empty context).
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let arr: &[u8; SIGNING_SECKEY_LEN] = self
            .secret_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("signing secret key length".into()))?;
        let sk = mldsa::PrivateKey::try_from_bytes(*arr)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig = sk
            .try_sign(message, &[])
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(sig.to_vec())
    }
}

/// Verify a detached signature against raw public key bytes.
pub fn verify_detached(
    public_bytes: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let pk_arr: &[u8; SIGNING_PUBKEY_LEN] = public_bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("bad signing public key length".into()))?;
    let pk = mldsa::PublicKey::try_from_bytes(*pk_arr)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let sig_arr: &[u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| CryptoError::SignatureVerification)?;
    if pk.verify(message, sig_arr, &[]) {
        Ok(())
    } else {
        Err(CryptoError::SignatureVerification)
    }
}

// ── Encapsulation (ML-KEM-1024) ──────────────────────────────────────────────

/// ML-KEM-1024 encapsulation (public) key bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KemPublicKey(Vec<u8>);

impl KemPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEM_PUBKEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "KEM public key must be {KEM_PUBKEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Seal a fresh 32-byte shared secret to this key.
    /// Returns (shared_secret, kem_ciphertext).
    pub fn encapsulate(&self) -> Result<(SharedSecret, Vec<u8>), CryptoError> {
        let ek_arr: &[u8; KEM_PUBKEY_LEN] = self
            .0
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("bad KEM public key length".into()))?;
        let ek = mlkem::EncapsKey::try_from_bytes(*ek_arr)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let (ssk, ct) = ek
            .try_encaps()
            .map_err(|e| CryptoError::Encapsulation(e.to_string()))?;
        Ok((Zeroizing::new(ssk.into_bytes()), ct.into_bytes().to_vec()))
    }
}

/// ML-KEM-1024 keypair. Drop clears the decapsulation key bytes.
#[derive(ZeroizeOnDrop)]
pub struct KemKeyPair {
    #[zeroize(skip)]
    public: KemPublicKey,
    secret_bytes: Vec<u8>,
}

impl KemKeyPair {
    /// Deterministic keygen from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self, CryptoError> {
        let mut rng = ChaCha20Rng::from_seed(*seed);
        let (ek, dk) = mlkem::KG::try_keygen_with_rng(&mut rng)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(Self {
            public: KemPublicKey(ek.into_bytes().to_vec()),
            secret_bytes: dk.into_bytes().to_vec(),
        })
    }

    /// Rehydrate from stored public + secret bytes.
    pub fn from_parts(public: &[u8], secret: &[u8]) -> Result<Self, CryptoError> {
        if secret.len() != KEM_SECKEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "KEM secret key must be {KEM_SECKEY_LEN} bytes, got {}",
                secret.len()
            )));
        }
        Ok(Self {
            public: KemPublicKey::from_bytes(public)?,
            secret_bytes: secret.to_vec(),
        })
    }

    pub fn public(&self) -> &KemPublicKey {
        &self.public
    }

    pub fn secret_bytes(&self) -> &[u8] {
        &self.secret_bytes
    }

    /// Recover the shared secret from a KEM ciphertext sealed to us.
    pub fn decapsulate(&self, ciphertext: &[u8]) -> Result<SharedSecret, CryptoError> {
        let dk_arr: &[u8; KEM_SECKEY_LEN] = self
            .secret_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("bad KEM secret key length".into()))?;
        let dk = mlkem::DecapsKey::try_from_bytes(*dk_arr)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let ct_arr: &[u8; KEM_CIPHERTEXT_LEN] = ciphertext
            .try_into()
            .map_err(|_| CryptoError::Encapsulation("bad KEM ciphertext length".into()))?;
        let ct = mlkem::CipherText::try_from_bytes(*ct_arr)
            .map_err(|e| CryptoError::Encapsulation(e.to_string()))?;
        let ssk = dk
            .try_decaps(&ct)
            .map_err(|e| CryptoError::Encapsulation(e.to_string()))?;
        Ok(Zeroizing::new(ssk.into_bytes()))
    }
}

/// Explicit wipe for intermediate secret buffers that cannot use Zeroizing.
pub fn wipe(buf: &mut [u8]) {
    buf.zeroize();
}
