use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Malformed record: {0}")]
    Malformed(String),

    #[error("Bad signature")]
    BadSignature,

    #[error("Fingerprint does not match embedded public key")]
    FingerprintMismatch,

    #[error("No entry for this member")]
    NotMember,

    #[error("Version mismatch")]
    WrongVersion,

    #[error("Decryption failed")]
    DecryptFailure,

    #[error("Invalid name: {0}")]
    NameInvalid(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] dna_crypto::CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}
