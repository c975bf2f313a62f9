//! Recovery phrase and deterministic seed derivation.
//!
//! A 24-word BIP-39 mnemonic (256-bit entropy + 8-bit checksum) is the
//! root of all identity key material:
//!
//! ```text
//! seed512         = PBKDF2-HMAC-SHA512(mnemonic, "mnemonic" ‖ passphrase, 2048, 64)
//! signing_seed    = HKDF-SHA512(seed512, info = "dna.sign", L = 32)
//! encryption_seed = HKDF-SHA512(seed512, info = "dna.kem",  L = 32)
//! ```
//!
//! The same phrase always yields the same fingerprint on every platform.
//! Seed buffers are zeroized on every exit path.

use bip39::{Language, Mnemonic};
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;
use crate::kdf;

const SIGNING_INFO: &[u8] = b"dna.sign";
const ENCRYPTION_INFO: &[u8] = b"dna.kem";

/// 24-word BIP-39 recovery phrase.
pub struct RecoveryPhrase {
    inner: Mnemonic,
}

impl RecoveryPhrase {
    pub const WORD_COUNT: usize = 24;

    /// Draw 256 bits of OS entropy and encode as a fresh phrase.
    pub fn generate() -> Result<Self, CryptoError> {
        let inner = Mnemonic::generate_in(Language::English, Self::WORD_COUNT)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Parse a user-supplied phrase. Whitespace is normalized; the BIP-39
    /// checksum and the 24-word length are both enforced.
    pub fn parse(phrase: &str) -> Result<Self, CryptoError> {
        let normalized = Zeroizing::new(
            phrase
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase(),
        );
        let inner = Mnemonic::parse_in_normalized(Language::English, &normalized)
            .map_err(|e| CryptoError::InvalidMnemonic(e.to_string()))?;
        if inner.word_count() != Self::WORD_COUNT {
            return Err(CryptoError::InvalidMnemonic(format!(
                "expected {} words, got {}",
                Self::WORD_COUNT,
                inner.word_count()
            )));
        }
        Ok(Self { inner })
    }

    /// The phrase as a single space-joined string. Zeroized on drop.
    pub fn phrase(&self) -> Zeroizing<String> {
        Zeroizing::new(self.inner.words().collect::<Vec<_>>().join(" "))
    }

    /// BIP-39 seed derivation, then domain-separated sub-seeds via HKDF.
    pub fn derive_seed(&self, passphrase: &str) -> MasterSeed {
        MasterSeed {
            seed: self.inner.to_seed(passphrase),
        }
    }
}

/// The 64-byte BIP-39 master seed. Retained for sub-key derivation,
/// zeroized on drop.
pub struct MasterSeed {
    seed: [u8; 64],
}

impl MasterSeed {
    /// 32-byte seed feeding deterministic ML-DSA-87 keygen.
    pub fn signing_seed(&self) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        self.expand(SIGNING_INFO)
    }

    /// 32-byte seed feeding deterministic ML-KEM-1024 keygen.
    pub fn encryption_seed(&self) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        self.expand(ENCRYPTION_INFO)
    }

    fn expand(&self, info: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let mut out = Zeroizing::new([0u8; 32]);
        kdf::hkdf_sha512(&self.seed, None, info, out.as_mut())?;
        Ok(out)
    }
}

impl Drop for MasterSeed {
    fn drop(&mut self) {
        self.seed.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VECTOR: &str = "legal winner thank year wave sausage worth useful legal \
                          winner thank year wave sausage worth useful legal winner \
                          thank year wave sausage worth title";

    #[test]
    fn parse_is_whitespace_and_case_tolerant() {
        let a = RecoveryPhrase::parse(VECTOR).unwrap();
        let b = RecoveryPhrase::parse(&format!("  {}  ", VECTOR.to_uppercase())).unwrap();
        assert_eq!(*a.phrase(), *b.phrase());
    }

    #[test]
    fn derivation_is_deterministic() {
        let phrase = RecoveryPhrase::parse(VECTOR).unwrap();
        let s1 = phrase.derive_seed("").signing_seed().unwrap();
        let s2 = RecoveryPhrase::parse(VECTOR)
            .unwrap()
            .derive_seed("")
            .signing_seed()
            .unwrap();
        assert_eq!(*s1, *s2);
    }

    #[test]
    fn passphrase_changes_seeds() {
        let phrase = RecoveryPhrase::parse(VECTOR).unwrap();
        let plain = phrase.derive_seed("").signing_seed().unwrap();
        let salted = phrase.derive_seed("extra").signing_seed().unwrap();
        assert_ne!(*plain, *salted);
    }

    #[test]
    fn signing_and_encryption_seeds_differ() {
        let seed = RecoveryPhrase::parse(VECTOR).unwrap().derive_seed("");
        assert_ne!(*seed.signing_seed().unwrap(), *seed.encryption_seed().unwrap());
    }

    #[test]
    fn rejects_bad_checksum_and_short_phrases() {
        assert!(RecoveryPhrase::parse("abandon abandon abandon").is_err());
        let mut words: Vec<&str> = VECTOR.split_whitespace().collect();
        words[23] = "abandon";
        assert!(RecoveryPhrase::parse(&words.join(" ")).is_err());
    }

    #[test]
    fn generated_phrase_reparses() {
        let phrase = RecoveryPhrase::generate().unwrap();
        let reparsed = RecoveryPhrase::parse(&phrase.phrase()).unwrap();
        assert_eq!(*phrase.phrase(), *reparsed.phrase());
    }
}
