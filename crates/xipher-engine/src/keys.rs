//! Typed wrappers around the engine's string tokens.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use xipher_core::types::{CIPHERTEXT_PREFIX, PUBLIC_KEY_PREFIX, SECRET_KEY_PREFIX};
use xipher_core::TokenKind;

use crate::adapter::EngineError;

/// A string-encoded secret key (`XSK_…`). Never printed by `Debug`.
pub struct SecretKey(SecretString);

impl SecretKey {
    pub fn parse(input: &str) -> Result<Self, EngineError> {
        let input = input.trim();
        if !input.starts_with(SECRET_KEY_PREFIX) || input.len() == SECRET_KEY_PREFIX.len() {
            return Err(EngineError::InvalidKey(format!(
                "secret key must start with {SECRET_KEY_PREFIX}"
            )));
        }
        Ok(Self(SecretString::from(input.to_string())))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn into_secret(self) -> SecretString {
        self.0
    }
}

impl Clone for SecretKey {
    fn clone(&self) -> Self {
        Self(SecretString::from(self.expose().to_string()))
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SecretKey").field(&"[REDACTED]").finish()
    }
}

/// A string-encoded public key (`XPK_…`). Safe to share and to log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicKey(String);

impl PublicKey {
    pub fn parse(input: &str) -> Result<Self, EngineError> {
        let input = input.trim();
        if !input.starts_with(PUBLIC_KEY_PREFIX) || input.len() == PUBLIC_KEY_PREFIX.len() {
            return Err(EngineError::InvalidKey(format!(
                "public key must start with {PUBLIC_KEY_PREFIX}"
            )));
        }
        Ok(Self(input.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A string-encoded ciphertext token (`XCT_…`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CipherText(String);

impl CipherText {
    pub fn parse(input: &str) -> Result<Self, EngineError> {
        let input = input.trim();
        if !input.starts_with(CIPHERTEXT_PREFIX) {
            return Err(EngineError::InvalidCipherText);
        }
        Ok(Self(input.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CipherText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whatever a user handed us to encrypt or decrypt with.
#[derive(Clone)]
pub enum KeyOrPassword {
    Secret(SecretKey),
    Public(PublicKey),
    Password(Password),
}

/// Password material, redacted like a secret key.
pub struct Password(SecretString);

impl Clone for Password {
    fn clone(&self) -> Self {
        Self(SecretString::from(self.0.expose_secret().to_string()))
    }
}

impl KeyOrPassword {
    /// Classify `input` by its prefix. Anything that is not a key is a password.
    pub fn classify(input: &str) -> Self {
        match TokenKind::detect(input) {
            TokenKind::SecretKey => match SecretKey::parse(input) {
                Ok(key) => KeyOrPassword::Secret(key),
                Err(_) => Self::password(input),
            },
            TokenKind::PublicKey => match PublicKey::parse(input) {
                Ok(key) => KeyOrPassword::Public(key),
                Err(_) => Self::password(input),
            },
            TokenKind::CipherText | TokenKind::Plain => Self::password(input),
        }
    }

    pub fn password(input: &str) -> Self {
        KeyOrPassword::Password(Password(SecretString::from(input.to_string())))
    }

    /// Public keys can only encrypt.
    pub fn can_decrypt(&self) -> bool {
        !matches!(self, KeyOrPassword::Public(_))
    }

    pub(crate) fn expose(&self) -> &str {
        match self {
            KeyOrPassword::Secret(key) => key.expose(),
            KeyOrPassword::Public(key) => key.as_str(),
            KeyOrPassword::Password(password) => password.0.expose_secret(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            KeyOrPassword::Secret(_) => "secret-key",
            KeyOrPassword::Public(_) => "public-key",
            KeyOrPassword::Password(_) => "password",
        }
    }
}

impl From<SecretKey> for KeyOrPassword {
    fn from(key: SecretKey) -> Self {
        KeyOrPassword::Secret(key)
    }
}

impl From<PublicKey> for KeyOrPassword {
    fn from(key: PublicKey) -> Self {
        KeyOrPassword::Public(key)
    }
}

impl fmt::Debug for KeyOrPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyOrPassword::Public(key) => f.debug_tuple("Public").field(key).finish(),
            other => f.debug_tuple(other.kind()).field(&"[REDACTED]").finish(),
        }
    }
}
