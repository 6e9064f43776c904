//! The user's key pair, kept in a [`KeyVault`].

use std::cell::Cell;

use secrecy::{ExposeSecret, SecretString};
use xipher_engine::{Engine, PublicKey, RawEngine, SecretKey};

use crate::store::KvStore;
use crate::vault::{KeyVault, VaultError};

/// Lazily generated secret key plus its cached public key.
pub struct Keystore<R, S> {
    engine: Engine<R>,
    vault: KeyVault<S>,
    secret_id: String,
    public_key_id: String,
}

impl<R: RawEngine, S: KvStore> Keystore<R, S> {
    pub fn new(
        engine: Engine<R>,
        vault: KeyVault<S>,
        secret_id: impl Into<String>,
        public_key_id: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            vault,
            secret_id: secret_id.into(),
            public_key_id: public_key_id.into(),
        }
    }

    pub fn vault(&self) -> &KeyVault<S> {
        &self.vault
    }

    /// The stored secret key, generated through the engine on first use.
    ///
    /// A newly generated key drops the cached public key, which may belong
    /// to an earlier secret whose record became unreadable.
    pub fn secret_key(&self) -> Result<SecretKey, VaultError> {
        let engine = &self.engine;
        let generated = Cell::new(false);
        let secret = self.vault.get_or_create_secret(&self.secret_id, || {
            generated.set(true);
            engine.generate_secret_key().map(SecretKey::into_secret)
        })?;
        if generated.get() {
            self.vault.forget(&self.public_key_id)?;
        }
        Ok(SecretKey::parse(secret.expose_secret())?)
    }

    /// The public key of [`secret_key`](Self::secret_key), derived once and cached.
    pub fn public_key(&self) -> Result<PublicKey, VaultError> {
        self.secret_key()?;
        let engine = &self.engine;
        let public = self
            .vault
            .get_or_create_derived(&self.secret_id, &self.public_key_id, |secret| {
                let secret = SecretKey::parse(secret.expose_secret())?;
                Ok(engine
                    .derive_public_key(&secret.into(), false)?
                    .as_str()
                    .to_string())
            })?;
        Ok(PublicKey::parse(&public)?)
    }

    /// Replace the secret key. Returns `false` if it was already stored.
    pub fn set_secret_key(&self, input: &str) -> Result<bool, VaultError> {
        let key = SecretKey::parse(input)?;
        let changed = self.vault.replace_secret(
            &self.secret_id,
            &self.public_key_id,
            &SecretString::from(key.expose().to_string()),
        )?;
        if changed {
            tracing::info!("secret key replaced, cached public key dropped");
        }
        Ok(changed)
    }

    /// Forget both keys. The next access generates a fresh pair.
    pub fn reset(&self) -> Result<(), VaultError> {
        self.vault.forget(&self.public_key_id)?;
        self.vault.forget(&self.secret_id)?;
        tracing::info!("vault reset");
        Ok(())
    }
}
