//! Identity lifecycle and the in-memory key vault.
//!
//! Key material is owned by the engine alone: it lives behind the vault's
//! read-mostly lock, is never handed to callbacks, and the keypairs
//! zeroize their secret bytes on drop when the vault locks.

use std::fs;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use zeroize::Zeroizing;

use dna_crypto::keyfile::{self, KeyFileAlg};
use dna_crypto::keys::{KemKeyPair, SigningKeyPair};
use dna_crypto::{CryptoError, Fingerprint, RecoveryPhrase};
use dna_proto::record::{IdentityRecord, Profile};

use crate::error::ErrorKind;
use crate::keyserver;
use crate::services::{now_secs, Services};

/// The loaded identity: both keypairs. Fingerprint is derived, never stored.
pub struct IdentityKeys {
    pub signing: SigningKeyPair,
    pub kem: KemKeyPair,
}

impl IdentityKeys {
    pub fn fingerprint(&self) -> Fingerprint {
        self.signing.fingerprint()
    }
}

/// Read-mostly holder of the loaded identity. Locking drops the keys,
/// which zeroizes their secret bytes.
#[derive(Clone)]
pub struct KeyVault {
    inner: Arc<RwLock<Option<Arc<IdentityKeys>>>>,
}

impl Default for KeyVault {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyVault {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn unlock(&self, keys: IdentityKeys) {
        *self.inner.write().await = Some(Arc::new(keys));
    }

    pub async fn lock(&self) {
        *self.inner.write().await = None;
    }

    pub async fn is_loaded(&self) -> bool {
        self.inner.read().await.is_some()
    }

    /// The loaded identity, or `NoIdentityLoaded`.
    pub async fn get(&self) -> Result<Arc<IdentityKeys>, ErrorKind> {
        self.inner
            .read()
            .await
            .clone()
            .ok_or(ErrorKind::NoIdentityLoaded)
    }
}

fn derive_keys(
    phrase: &RecoveryPhrase,
    passphrase: &str,
) -> Result<IdentityKeys, ErrorKind> {
    let seed = phrase.derive_seed(passphrase);
    let signing = SigningKeyPair::from_seed(&*seed.signing_seed()?)?;
    let kem = KemKeyPair::from_seed(&*seed.encryption_seed()?)?;
    Ok(IdentityKeys { signing, kem })
}

fn write_key_files(
    svc: &Services,
    keys: &IdentityKeys,
    phrase: &RecoveryPhrase,
    password: Option<&str>,
) -> Result<(), ErrorKind> {
    fs::create_dir_all(svc.config.keys_dir()).map_err(|_| ErrorKind::Internal)?;
    keyfile::seal(
        &svc.config.signing_key_path(),
        KeyFileAlg::MlDsa87,
        keys.signing.public().as_bytes(),
        keys.signing.secret_bytes(),
        password,
    )?;
    keyfile::seal(
        &svc.config.kem_key_path(),
        KeyFileAlg::MlKem1024,
        keys.kem.public().as_bytes(),
        keys.kem.secret_bytes(),
        password,
    )?;
    keyfile::seal(
        &svc.config.mnemonic_path(),
        KeyFileAlg::Mnemonic,
        &[],
        phrase.phrase().as_bytes(),
        password,
    )?;
    Ok(())
}

fn check_password_policy(svc: &Services, password: Option<&str>) -> Result<(), ErrorKind> {
    match password {
        Some(p) if !p.is_empty() => Ok(()),
        _ if svc.config.allow_unencrypted_keys => Ok(()),
        _ => Err(ErrorKind::PasswordTooWeak),
    }
}

fn effective_password(password: Option<&str>) -> Option<&str> {
    match password {
        Some("") | None => None,
        other => other,
    }
}

/// Create a fresh identity: new phrase, deterministic keys, sealed files,
/// version-1 record on the DHT. Returns the fingerprint and the phrase
/// (shown once; afterwards it exists only inside `identity.mnem`).
pub(crate) async fn create(
    svc: &Services,
    name: Option<String>,
    password: Option<&str>,
    profile: Profile,
) -> Result<(Fingerprint, Zeroizing<String>), ErrorKind> {
    if svc.config.signing_key_path().exists() {
        return Err(ErrorKind::IdentityExists);
    }
    check_password_policy(svc, password)?;
    let password = effective_password(password);

    let phrase = RecoveryPhrase::generate()?;
    let keys = derive_keys(&phrase, "")?;
    let fp = keys.fingerprint();

    // Name availability first; no files are written for a lost race.
    if let Some(name) = &name {
        keyserver::ensure_name_available(svc, name, &fp).await?;
    }

    write_key_files(svc, &keys, &phrase, password)?;
    let words = phrase.phrase();
    svc.vault.unlock(keys).await;

    keyserver::publish_fresh(svc, name, profile).await?;
    info!(fingerprint = %fp.abbrev(), "identity created");
    Ok((fp, words))
}

/// Rebuild an identity from its recovery phrase. The DHT may already hold
/// a record for it; if so the identity is adopted as-is, otherwise a
/// version-1 record is published.
pub(crate) async fn restore(
    svc: &Services,
    phrase_text: &str,
    passphrase: &str,
    password: Option<&str>,
) -> Result<Fingerprint, ErrorKind> {
    check_password_policy(svc, password)?;
    let password = effective_password(password);

    let phrase = RecoveryPhrase::parse(phrase_text)?;
    let keys = derive_keys(&phrase, passphrase)?;
    let fp = keys.fingerprint();

    write_key_files(svc, &keys, &phrase, password)?;
    svc.vault.unlock(keys).await;

    match keyserver::lookup_by_fingerprint(svc, &fp).await {
        Ok(_) => {}
        Err(ErrorKind::IdentityNotFound) => {
            keyserver::publish_fresh(svc, None, Profile::default()).await?;
        }
        Err(other) => return Err(other),
    }
    info!(fingerprint = %fp.abbrev(), "identity restored");
    Ok(fp)
}

/// Load the sealed key files into the vault.
pub(crate) async fn load(svc: &Services, password: Option<&str>) -> Result<Fingerprint, ErrorKind> {
    let password = effective_password(password);
    let dsa = keyfile::load(&svc.config.signing_key_path(), password).map_err(map_load_err)?;
    let kem = keyfile::load(&svc.config.kem_key_path(), password).map_err(map_load_err)?;

    let signing = SigningKeyPair::from_parts(&dsa.public, &dsa.secret)?;
    let kem = KemKeyPair::from_parts(&kem.public, &kem.secret)?;
    let keys = IdentityKeys { signing, kem };
    let fp = keys.fingerprint();
    svc.vault.unlock(keys).await;
    Ok(fp)
}

fn map_load_err(e: CryptoError) -> ErrorKind {
    match e {
        CryptoError::WrongPassword => ErrorKind::WrongPassword,
        CryptoError::Io(_) => ErrorKind::IdentityNotFound,
        other => other.into(),
    }
}

/// Remove the sealed key files after verifying the password, then lock
/// the vault. Message history stays on disk.
pub(crate) async fn delete(svc: &Services, password: Option<&str>) -> Result<(), ErrorKind> {
    let password = effective_password(password);
    keyfile::load(&svc.config.signing_key_path(), password).map_err(map_load_err)?;

    for path in [
        svc.config.signing_key_path(),
        svc.config.kem_key_path(),
        svc.config.mnemonic_path(),
    ] {
        if path.exists() {
            fs::remove_file(&path).map_err(|_| ErrorKind::Internal)?;
        }
    }
    svc.vault.lock().await;
    info!("identity deleted");
    Ok(())
}

/// Detached signature over caller-supplied bytes; key material stays inside.
pub(crate) async fn sign_data(svc: &Services, data: &[u8]) -> Result<Vec<u8>, ErrorKind> {
    let keys = svc.vault.get().await?;
    Ok(keys.signing.sign(data)?)
}

pub(crate) async fn current_record_for_update(
    svc: &Services,
) -> Result<Option<IdentityRecord>, ErrorKind> {
    let keys = svc.vault.get().await?;
    match keyserver::lookup_by_fingerprint(svc, &keys.fingerprint()).await {
        Ok(record) => Ok(Some(record)),
        Err(ErrorKind::IdentityNotFound) => Ok(None),
        Err(other) => Err(other),
    }
}

pub(crate) fn registered_name_tuple(record: &IdentityRecord) -> Option<(String, i64)> {
    match (&record.registered_name, record.name_registered_at) {
        (Some(name), Some(at)) if record.name_valid_at(now_secs()) => Some((name.clone(), at)),
        _ => None,
    }
}
