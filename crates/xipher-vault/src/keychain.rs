//! Platform keychain backend for vault records.
//!
//! Uses the `keyring` crate for cross-platform access:
//! - macOS: Keychain Services
//! - Linux: GNOME Keyring / Secret Service (D-Bus)
//! - Windows: Credential Manager (DPAPI)
//!
//! Keychains store strings, so record bytes are base64-encoded.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use zeroize::Zeroize;

use crate::store::KvStore;
use crate::vault::VaultError;

pub struct KeychainStore {
    service: String,
}

impl KeychainStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    /// Check if the platform keychain is available.
    pub fn is_available(&self) -> bool {
        keyring::Entry::new(&self.service, "__xipher_availability__").is_ok()
    }

    fn entry(&self, id: &str) -> Result<keyring::Entry, VaultError> {
        keyring::Entry::new(&self.service, id)
            .map_err(|e| VaultError::Storage(format!("keychain entry creation: {e}")))
    }
}

impl KvStore for KeychainStore {
    fn get(&self, id: &str) -> Result<Option<Vec<u8>>, VaultError> {
        match self.entry(id)?.get_password() {
            Ok(mut encoded) => {
                let decoded = BASE64.decode(encoded.as_bytes());
                encoded.zeroize();
                decoded
                    .map(Some)
                    .map_err(|e| VaultError::Corrupt(format!("keychain payload for '{id}': {e}")))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(VaultError::Storage(format!("keychain get for '{id}': {e}"))),
        }
    }

    fn set(&self, id: &str, value: &[u8]) -> Result<(), VaultError> {
        let mut encoded = BASE64.encode(value);
        let result = self
            .entry(id)?
            .set_password(&encoded)
            .map_err(|e| VaultError::Storage(format!("keychain store for '{id}': {e}")));
        encoded.zeroize();
        result?;
        tracing::debug!(id, service = %self.service, "stored record in platform keychain");
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), VaultError> {
        match self.entry(id)?.delete_credential() {
            Ok(()) => {
                tracing::debug!(id, "deleted record from platform keychain");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()), // already deleted
            Err(e) => Err(VaultError::Storage(format!("keychain delete for '{id}': {e}"))),
        }
    }
}
