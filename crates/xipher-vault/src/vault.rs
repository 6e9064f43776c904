//! The key vault: encrypted records over a [`KvStore`] plus an in-process cache.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::{debug, warn};
use xipher_core::XipherError;
use xipher_engine::EngineError;
use zeroize::Zeroize;

use crate::record::{VaultRecord, VaultScheme};
use crate::store::KvStore;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted record could not be decoded or decrypted.
    #[error("corrupt vault record: {0}")]
    Corrupt(String),

    #[error("sealing failed: {0}")]
    Seal(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("no secret stored under '{0}'")]
    MissingSecret(String),

    /// The sealed master key does not open what is stored.
    #[error("wrong vault passphrase for '{0}'")]
    WrongPassphrase(String),
}

impl From<VaultError> for XipherError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::Engine(e) => e.into(),
            other => XipherError::Vault(other.to_string()),
        }
    }
}

/// Encrypted-at-rest storage for named secrets.
///
/// Every `store` overwrites the record and the cache entry together, so a
/// `retrieve` after an overwrite never sees the old value. Corrupt records
/// read as absent, which lets callers regenerate.
pub struct KeyVault<S> {
    store: S,
    scheme: VaultScheme,
    cache: Mutex<HashMap<String, SecretString>>,
}

impl<S: KvStore> KeyVault<S> {
    pub fn new(store: S, scheme: VaultScheme) -> Self {
        Self {
            store,
            scheme,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn scheme(&self) -> &VaultScheme {
        &self.scheme
    }

    pub fn store_backend(&self) -> &S {
        &self.store
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, SecretString>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seal `plaintext`, persist it under `id` and cache it.
    pub fn store(&self, id: &str, plaintext: &SecretString) -> Result<(), VaultError> {
        let record = self.scheme.seal(plaintext.expose_secret().as_bytes())?;
        self.store.set(id, &record.encode())?;
        self.cache().insert(
            id.to_string(),
            SecretString::from(plaintext.expose_secret().to_string()),
        );
        debug!(id, scheme = self.scheme.name(), "secret stored");
        Ok(())
    }

    /// Cached or persisted secret under `id`.
    ///
    /// `Ok(None)` when nothing is stored or the record is unreadable. Storage
    /// failures still propagate.
    pub fn retrieve(&self, id: &str) -> Result<Option<SecretString>, VaultError> {
        if let Some(hit) = self.cache().get(id) {
            return Ok(Some(SecretString::from(hit.expose_secret().to_string())));
        }

        let blob = match self.store.get(id) {
            Ok(Some(blob)) => blob,
            Ok(None) => return Ok(None),
            Err(VaultError::Corrupt(reason)) => {
                warn!(id, "ignoring unreadable vault record: {reason}");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match self.open_blob(&blob) {
            Ok(plaintext) => {
                self.cache().insert(
                    id.to_string(),
                    SecretString::from(plaintext.expose_secret().to_string()),
                );
                Ok(Some(plaintext))
            }
            Err(e) => {
                warn!(id, "failed to open vault record: {e}");
                Ok(None)
            }
        }
    }

    fn open_blob(&self, blob: &[u8]) -> Result<SecretString, VaultError> {
        let record = VaultRecord::decode(blob)?;
        let plaintext = self.scheme.open(&record)?;
        match String::from_utf8(plaintext) {
            Ok(text) => Ok(SecretString::from(text)),
            Err(e) => {
                let mut bytes = e.into_bytes();
                bytes.zeroize();
                Err(VaultError::Corrupt("record plaintext is not UTF-8".into()))
            }
        }
    }

    /// The secret under `id`, generating and storing one when absent.
    ///
    /// Legacy records that do not open are regenerated. Sealed ones fail with
    /// [`VaultError::WrongPassphrase`] and stay on disk.
    pub fn get_or_create_secret<F>(&self, id: &str, generate: F) -> Result<SecretString, VaultError>
    where
        F: FnOnce() -> Result<SecretString, EngineError>,
    {
        if let Some(secret) = self.retrieve(id)? {
            return Ok(secret);
        }
        // A sealed record that does not open is most likely under another
        // passphrase. Regenerating would destroy it.
        if let VaultScheme::Sealed(_) = self.scheme {
            if self.store.get(id)?.is_some() {
                return Err(VaultError::WrongPassphrase(id.to_string()));
            }
        }
        let secret = generate()?;
        self.store(id, &secret)?;
        debug!(id, "generated new secret");
        Ok(secret)
    }

    /// A value derived from the secret under `secret_id`, cached in plain
    /// storage under `derived_id`.
    pub fn get_or_create_derived<F>(
        &self,
        secret_id: &str,
        derived_id: &str,
        derive: F,
    ) -> Result<String, VaultError>
    where
        F: FnOnce(&SecretString) -> Result<String, EngineError>,
    {
        if let Some(bytes) = self.store.get(derived_id)? {
            match String::from_utf8(bytes) {
                Ok(value) if !value.is_empty() => return Ok(value),
                _ => warn!(derived_id, "discarding unreadable derived value"),
            }
        }

        let secret = self
            .retrieve(secret_id)?
            .ok_or_else(|| VaultError::MissingSecret(secret_id.to_string()))?;
        let value = derive(&secret)?;
        self.store.set(derived_id, value.as_bytes())?;
        debug!(derived_id, "derived value cached");
        Ok(value)
    }

    /// Replace the secret under `secret_id` and drop the derived value.
    ///
    /// Returns `false` without touching storage when `value` equals the
    /// current secret.
    pub fn replace_secret(
        &self,
        secret_id: &str,
        derived_id: &str,
        value: &SecretString,
    ) -> Result<bool, VaultError> {
        if let Some(current) = self.retrieve(secret_id)? {
            if current.expose_secret() == value.expose_secret() {
                return Ok(false);
            }
        }
        self.store(secret_id, value)?;
        self.store.remove(derived_id)?;
        Ok(true)
    }

    /// Check a sealed vault's master key against the verifier stored under
    /// `check_id`, recording one on first use. Legacy vaults always pass.
    pub fn verify_master(&self, check_id: &str) -> Result<(), VaultError> {
        let VaultScheme::Sealed(master) = &self.scheme else {
            return Ok(());
        };
        let expected = master.verifier()?;
        match self.store.get(check_id)? {
            Some(stored) if stored == expected => Ok(()),
            Some(_) => Err(VaultError::WrongPassphrase(check_id.to_string())),
            None => {
                self.store.set(check_id, &expected)?;
                debug!(check_id, "vault passphrase verifier recorded");
                Ok(())
            }
        }
    }

    /// Remove `id` from storage and cache.
    pub fn forget(&self, id: &str) -> Result<(), VaultError> {
        self.cache().remove(id);
        self.store.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::VaultMasterKey;
    use crate::store::MemoryStore;
    use crate::{BINDING_SIZE, IV_SIZE};
    use std::cell::Cell;
    use std::sync::Arc;

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    fn legacy() -> (Arc<MemoryStore>, KeyVault<Arc<MemoryStore>>) {
        let store = Arc::new(MemoryStore::new());
        let vault = KeyVault::new(Arc::clone(&store), VaultScheme::Legacy);
        (store, vault)
    }

    #[test]
    fn test_store_retrieve_roundtrip() {
        let (_, vault) = legacy();
        vault.store("id", &secret("secret-A")).unwrap();
        assert_eq!(
            vault.retrieve("id").unwrap().unwrap().expose_secret(),
            "secret-A"
        );
    }

    #[test]
    fn test_overwrite_has_no_stale_cache() {
        let (_, vault) = legacy();
        vault.store("id", &secret("secret-A")).unwrap();
        assert!(vault.retrieve("id").unwrap().is_some());
        vault.store("id", &secret("secret-B")).unwrap();
        assert_eq!(
            vault.retrieve("id").unwrap().unwrap().expose_secret(),
            "secret-B"
        );
    }

    #[test]
    fn test_retrieve_reads_persisted_record() {
        let store = Arc::new(MemoryStore::new());
        KeyVault::new(Arc::clone(&store), VaultScheme::Legacy)
            .store("id", &secret("persisted"))
            .unwrap();

        // Fresh vault, empty cache
        let vault = KeyVault::new(Arc::clone(&store), VaultScheme::Legacy);
        assert_eq!(
            vault.retrieve("id").unwrap().unwrap().expose_secret(),
            "persisted"
        );
    }

    #[test]
    fn test_retrieve_missing_is_none() {
        let (_, vault) = legacy();
        assert!(vault.retrieve("nothing").unwrap().is_none());
    }

    #[test]
    fn test_truncated_record_reads_as_absent() {
        let (store, vault) = legacy();
        vault.store("id", &secret("secret-A")).unwrap();

        let mut blob = store.get("id").unwrap().unwrap();
        blob.truncate(blob.len() - 4);
        store.set("id", &blob).unwrap();

        let fresh = KeyVault::new(Arc::clone(&store), VaultScheme::Legacy);
        assert!(fresh.retrieve("id").unwrap().is_none());

        blob.truncate(IV_SIZE + BINDING_SIZE);
        store.set("id", &blob).unwrap();
        assert!(fresh.retrieve("id").unwrap().is_none());
    }

    #[test]
    fn test_sealed_record_unreadable_without_master() {
        let store = Arc::new(MemoryStore::new());
        let sealed = VaultScheme::Sealed(VaultMasterKey::from_bytes([1u8; 32]));
        KeyVault::new(Arc::clone(&store), sealed)
            .store("id", &secret("secret-A"))
            .unwrap();

        let legacy = KeyVault::new(Arc::clone(&store), VaultScheme::Legacy);
        assert!(legacy.retrieve("id").unwrap().is_none());

        let resealed = VaultScheme::Sealed(VaultMasterKey::from_bytes([1u8; 32]));
        let vault = KeyVault::new(Arc::clone(&store), resealed);
        assert_eq!(
            vault.retrieve("id").unwrap().unwrap().expose_secret(),
            "secret-A"
        );
    }

    #[test]
    fn test_get_or_create_generates_once() {
        let (_, vault) = legacy();
        let calls = Cell::new(0);
        let generate = || {
            calls.set(calls.get() + 1);
            Ok(secret("XSK_GENERATED"))
        };

        let first = vault.get_or_create_secret("id", generate).unwrap();
        let second = vault
            .get_or_create_secret("id", || Ok(secret("XSK_OTHER")))
            .unwrap();

        assert_eq!(calls.get(), 1);
        assert_eq!(first.expose_secret(), "XSK_GENERATED");
        assert_eq!(second.expose_secret(), "XSK_GENERATED");
    }

    #[test]
    fn test_generator_failure_propagates() {
        let (store, vault) = legacy();
        let err = vault
            .get_or_create_secret("id", || Err(EngineError::Engine("engine down".into())))
            .unwrap_err();
        assert_eq!(err.to_string(), "engine down");
        assert!(store.get("id").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_record_is_regenerated() {
        let (store, vault) = legacy();
        store.set("id", b"garbage").unwrap();
        let value = vault
            .get_or_create_secret("id", || Ok(secret("XSK_FRESH")))
            .unwrap();
        assert_eq!(value.expose_secret(), "XSK_FRESH");
    }

    #[test]
    fn test_sealed_record_is_not_regenerated_under_wrong_master() {
        let store = Arc::new(MemoryStore::new());
        let right = || VaultScheme::Sealed(VaultMasterKey::from_bytes([1u8; 32]));
        KeyVault::new(Arc::clone(&store), right())
            .store("id", &secret("XSK_ORIGINAL"))
            .unwrap();
        let before = store.get("id").unwrap();

        let wrong = KeyVault::new(
            Arc::clone(&store),
            VaultScheme::Sealed(VaultMasterKey::from_bytes([2u8; 32])),
        );
        let err = wrong
            .get_or_create_secret("id", || Ok(secret("XSK_FRESH")))
            .unwrap_err();
        assert!(matches!(err, VaultError::WrongPassphrase(ref id) if id == "id"));
        assert_eq!(store.get("id").unwrap(), before);

        let vault = KeyVault::new(Arc::clone(&store), right());
        assert_eq!(
            vault.retrieve("id").unwrap().unwrap().expose_secret(),
            "XSK_ORIGINAL"
        );
    }

    #[test]
    fn test_verify_master() {
        let store = Arc::new(MemoryStore::new());
        let sealed = |b: u8| {
            KeyVault::new(
                Arc::clone(&store),
                VaultScheme::Sealed(VaultMasterKey::from_bytes([b; 32])),
            )
        };

        sealed(1).verify_master("check").unwrap();
        assert!(store.get("check").unwrap().is_some());
        sealed(1).verify_master("check").unwrap();
        assert!(matches!(
            sealed(2).verify_master("check"),
            Err(VaultError::WrongPassphrase(_))
        ));

        let legacy = KeyVault::new(Arc::clone(&store), VaultScheme::Legacy);
        legacy.verify_master("check").unwrap();
    }

    #[test]
    fn test_derived_is_cached_in_plain_storage() {
        let (store, vault) = legacy();
        vault.store("secret", &secret("XSK_A")).unwrap();

        let derived = vault
            .get_or_create_derived("secret", "public", |s| {
                Ok(s.expose_secret().replace("XSK_", "XPK_"))
            })
            .unwrap();
        assert_eq!(derived, "XPK_A");
        assert_eq!(store.get("public").unwrap(), Some(b"XPK_A".to_vec()));

        let again = vault
            .get_or_create_derived("secret", "public", |_| panic!("must hit the cache"))
            .unwrap();
        assert_eq!(again, "XPK_A");
    }

    #[test]
    fn test_derived_without_secret_fails() {
        let (_, vault) = legacy();
        let err = vault
            .get_or_create_derived("secret", "public", |_| Ok("XPK_A".into()))
            .unwrap_err();
        assert!(matches!(err, VaultError::MissingSecret(_)));
    }

    #[test]
    fn test_replace_secret_invalidates_derived() {
        let (store, vault) = legacy();
        vault.store("secret", &secret("XSK_A")).unwrap();
        store.set("public", b"XPK_A").unwrap();

        assert!(!vault
            .replace_secret("secret", "public", &secret("XSK_A"))
            .unwrap());
        assert!(store.get("public").unwrap().is_some());

        assert!(vault
            .replace_secret("secret", "public", &secret("XSK_B"))
            .unwrap());
        assert!(store.get("public").unwrap().is_none());
        assert_eq!(
            vault.retrieve("secret").unwrap().unwrap().expose_secret(),
            "XSK_B"
        );
    }

    #[test]
    fn test_forget() {
        let (store, vault) = legacy();
        vault.store("id", &secret("secret-A")).unwrap();
        vault.forget("id").unwrap();
        assert!(vault.retrieve("id").unwrap().is_none());
        assert!(store.get("id").unwrap().is_none());
    }
}
