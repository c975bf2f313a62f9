//! The closed error taxonomy surfaced through completion callbacks.
//!
//! Crate-level errors are converted at the façade boundary; callers only
//! ever see these kinds. Crypto-integrity kinds are never retried;
//! transient resource kinds are retried internally up to the configured
//! limit before the final attempt's kind surfaces.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorKind {
    // Input
    #[error("InvalidArgument")]
    InvalidArgument,
    #[error("NameInvalid")]
    NameInvalid,
    #[error("FingerprintInvalid")]
    FingerprintInvalid,
    #[error("PasswordTooWeak")]
    PasswordTooWeak,

    // Auth
    #[error("WrongPassword")]
    WrongPassword,
    #[error("NotAuthorized")]
    NotAuthorized,
    #[error("BlockedByPeer")]
    BlockedByPeer,

    // Not found
    #[error("IdentityNotFound")]
    IdentityNotFound,
    #[error("NameNotRegistered")]
    NameNotRegistered,
    #[error("GroupNotFound")]
    GroupNotFound,
    #[error("MessageNotFound")]
    MessageNotFound,
    #[error("NotMember")]
    NotMember,

    // Conflict
    #[error("NameTaken")]
    NameTaken,
    #[error("NameExpired")]
    NameExpired,
    #[error("IdentityExists")]
    IdentityExists,
    #[error("VersionRaceLost")]
    VersionRaceLost,

    // Integrity
    #[error("BadSignature")]
    BadSignature,
    #[error("FingerprintMismatch")]
    FingerprintMismatch,
    #[error("MalformedRecord")]
    MalformedRecord,
    #[error("DecryptFailure")]
    DecryptFailure,

    // Resource
    #[error("DhtUnavailable")]
    DhtUnavailable,
    #[error("Timeout")]
    Timeout,
    #[error("StoreBusy")]
    StoreBusy,
    #[error("OutOfMemory")]
    OutOfMemory,

    // State
    #[error("NoIdentityLoaded")]
    NoIdentityLoaded,
    #[error("NotRunning")]
    NotRunning,
    #[error("Cancelled")]
    Cancelled,

    // Other
    #[error("Internal")]
    Internal,
}

impl ErrorKind {
    /// Only transient resource failures are eligible for the retry loop.
    pub fn is_retriable(self) -> bool {
        matches!(self, ErrorKind::DhtUnavailable | ErrorKind::Timeout)
    }
}

impl From<dna_crypto::CryptoError> for ErrorKind {
    fn from(e: dna_crypto::CryptoError) -> Self {
        use dna_crypto::CryptoError::*;
        match e {
            WrongPassword => ErrorKind::WrongPassword,
            SignatureVerification => ErrorKind::BadSignature,
            AeadDecrypt => ErrorKind::DecryptFailure,
            InvalidFingerprint(_) => ErrorKind::FingerprintInvalid,
            InvalidMnemonic(_) | InvalidKey(_) => ErrorKind::InvalidArgument,
            KeyFile(_) => ErrorKind::MalformedRecord,
            _ => ErrorKind::Internal,
        }
    }
}

impl From<dna_proto::ProtoError> for ErrorKind {
    fn from(e: dna_proto::ProtoError) -> Self {
        use dna_proto::ProtoError::*;
        match e {
            BadSignature => ErrorKind::BadSignature,
            FingerprintMismatch => ErrorKind::FingerprintMismatch,
            Malformed(_) | Serialisation(_) => ErrorKind::MalformedRecord,
            NotMember => ErrorKind::NotMember,
            WrongVersion => ErrorKind::VersionRaceLost,
            DecryptFailure => ErrorKind::DecryptFailure,
            NameInvalid(_) => ErrorKind::NameInvalid,
            Crypto(inner) => inner.into(),
        }
    }
}

impl From<dna_dht::DhtError> for ErrorKind {
    fn from(e: dna_dht::DhtError) -> Self {
        use dna_dht::DhtError::*;
        match e {
            NotReady | Unavailable(_) => ErrorKind::DhtUnavailable,
            Timeout => ErrorKind::Timeout,
            BadSignature => ErrorKind::BadSignature,
        }
    }
}

impl From<dna_store::StoreError> for ErrorKind {
    fn from(e: dna_store::StoreError) -> Self {
        use dna_store::StoreError::*;
        match e {
            Database(_) => ErrorKind::StoreBusy,
            NotFound(_) => ErrorKind::MessageNotFound,
            IllegalTransition { .. } => ErrorKind::InvalidArgument,
            Migration(_) | Serialisation(_) | Corrupt(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriability_is_resource_only() {
        assert!(ErrorKind::DhtUnavailable.is_retriable());
        assert!(ErrorKind::Timeout.is_retriable());
        assert!(!ErrorKind::BadSignature.is_retriable());
        assert!(!ErrorKind::DecryptFailure.is_retriable());
        assert!(!ErrorKind::NoIdentityLoaded.is_retriable());
    }

    #[test]
    fn taxonomy_names_are_bare() {
        assert_eq!(ErrorKind::NameTaken.to_string(), "NameTaken");
        assert_eq!(ErrorKind::Cancelled.to_string(), "Cancelled");
    }
}
