//! Typed adapter over a [`RawEngine`].
//!
//! This is the only place that looks at [`EngineReply`]. An `Err` reply becomes
//! [`EngineError::Engine`] carrying the engine's message verbatim. An `Ok` reply
//! with no value (empty string, zero transformer id) becomes
//! [`EngineError::EmptyResult`], except for transformer output where empty
//! means "buffered, nothing to emit yet".

use std::sync::Arc;

use secrecy::SecretString;
use thiserror::Error;
use tracing::debug;
use xipher_core::{Mode, XipherError};

use crate::keys::{CipherText, KeyOrPassword, PublicKey, SecretKey};
use crate::reply::{EngineReply, RawEngine, TransformerId};

#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine reported a failure.
    #[error("{0}")]
    Engine(String),

    /// The engine answered without a value.
    #[error("failed to {0}")]
    EmptyResult(&'static str),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("not a xipher ciphertext")]
    InvalidCipherText,

    /// The transformer was already closed.
    #[error("{0} is closed")]
    Closed(TransformerId),
}

impl From<EngineError> for XipherError {
    fn from(e: EngineError) -> Self {
        XipherError::Engine(e.to_string())
    }
}

/// A reply value that can be "absent" even though the engine did not error.
trait Present {
    fn is_present(&self) -> bool;
}

impl Present for String {
    fn is_present(&self) -> bool {
        !self.is_empty()
    }
}

impl Present for TransformerId {
    fn is_present(&self) -> bool {
        self.0 != 0
    }
}

fn required<T: Present>(reply: EngineReply<T>, op: &'static str) -> Result<T, EngineError> {
    match reply {
        EngineReply::Err(message) => Err(EngineError::Engine(message)),
        EngineReply::Ok(value) if value.is_present() => Ok(value),
        EngineReply::Ok(_) => Err(EngineError::EmptyResult(op)),
    }
}

fn bytes(reply: EngineReply<Vec<u8>>) -> Result<Vec<u8>, EngineError> {
    reply.into_result().map_err(EngineError::Engine)
}

/// Cheaply cloneable handle to an engine.
pub struct Engine<R> {
    raw: Arc<R>,
}

impl<R> Clone for Engine<R> {
    fn clone(&self) -> Self {
        Self {
            raw: Arc::clone(&self.raw),
        }
    }
}

impl<R: RawEngine> Engine<R> {
    pub fn new(raw: R) -> Self {
        Self { raw: Arc::new(raw) }
    }

    pub fn from_arc(raw: Arc<R>) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &R {
        &self.raw
    }

    pub fn generate_secret_key(&self) -> Result<SecretKey, EngineError> {
        let key = required(self.raw.new_secret_key(), "generate secret key")?;
        SecretKey::parse(&key)
    }

    /// Public key of a secret key or a password. A public key has none.
    pub fn derive_public_key(
        &self,
        key: &KeyOrPassword,
        quantum_safe: bool,
    ) -> Result<PublicKey, EngineError> {
        if let KeyOrPassword::Public(_) = key {
            return Err(EngineError::InvalidKey(
                "expected a secret key or password".to_string(),
            ));
        }
        let public = required(
            self.raw.public_key(key.expose(), quantum_safe),
            "derive public key",
        )?;
        PublicKey::parse(&public)
    }

    pub fn encrypt_text(
        &self,
        key: &KeyOrPassword,
        plaintext: &str,
        compress: bool,
    ) -> Result<CipherText, EngineError> {
        let ct = required(
            self.raw.encrypt_text(key.expose(), plaintext, compress),
            "encrypt string",
        )?;
        CipherText::parse(&ct)
    }

    pub fn decrypt_text(
        &self,
        key: &KeyOrPassword,
        ciphertext: &CipherText,
    ) -> Result<SecretString, EngineError> {
        if !key.can_decrypt() {
            return Err(EngineError::InvalidKey(
                "a public key cannot decrypt".to_string(),
            ));
        }
        let plaintext = required(
            self.raw.decrypt_text(key.expose(), ciphertext.as_str()),
            "decrypt string",
        )?;
        Ok(SecretString::from(plaintext))
    }

    /// Open a chunked transformer. `compress` is ignored for decryption.
    pub fn open(
        &self,
        mode: Mode,
        key: &KeyOrPassword,
        compress: bool,
    ) -> Result<Transformer<R>, EngineError> {
        let id = match mode {
            Mode::Encrypt => required(
                self.raw.open_encrypter(key.expose(), compress),
                "initialize encrypter",
            )?,
            Mode::Decrypt => {
                if !key.can_decrypt() {
                    return Err(EngineError::InvalidKey(
                        "a public key cannot decrypt".to_string(),
                    ));
                }
                required(self.raw.open_decrypter(key.expose()), "initialize decrypter")?
            }
        };
        debug!(%id, %mode, key = key.kind(), "transformer opened");
        Ok(Transformer {
            raw: Arc::clone(&self.raw),
            id,
            mode,
            closed: false,
        })
    }

    pub fn open_encrypter(
        &self,
        key: &KeyOrPassword,
        compress: bool,
    ) -> Result<Transformer<R>, EngineError> {
        self.open(Mode::Encrypt, key, compress)
    }

    pub fn open_decrypter(&self, key: &KeyOrPassword) -> Result<Transformer<R>, EngineError> {
        self.open(Mode::Decrypt, key, false)
    }
}

/// One open chunked transform inside the engine.
///
/// Dropping an unclosed transformer closes it and discards the residual, so
/// an abandoned job does not leak engine-side state.
pub struct Transformer<R: RawEngine> {
    raw: Arc<R>,
    id: TransformerId,
    mode: Mode,
    closed: bool,
}

impl<R: RawEngine> Transformer<R> {
    pub fn id(&self) -> TransformerId {
        self.id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Push one chunk through. May return nothing while the engine buffers.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<u8>, EngineError> {
        if self.closed {
            return Err(EngineError::Closed(self.id));
        }
        match self.mode {
            Mode::Encrypt => bytes(self.raw.feed_encrypter(self.id, chunk)),
            Mode::Decrypt => bytes(self.raw.feed_decrypter(self.id, chunk)),
        }
    }

    /// Flush and release the transformer, returning any buffered output.
    pub fn close(&mut self) -> Result<Vec<u8>, EngineError> {
        if self.closed {
            return Err(EngineError::Closed(self.id));
        }
        self.closed = true;
        let residual = match self.mode {
            Mode::Encrypt => bytes(self.raw.close_encrypter(self.id)),
            Mode::Decrypt => bytes(self.raw.close_decrypter(self.id)),
        }?;
        debug!(id = %self.id, residual = residual.len(), "transformer closed");
        Ok(residual)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<R: RawEngine> Drop for Transformer<R> {
    fn drop(&mut self) {
        if !self.closed {
            let reply = match self.mode {
                Mode::Encrypt => self.raw.close_encrypter(self.id),
                Mode::Decrypt => self.raw.close_decrypter(self.id),
            };
            if let EngineReply::Err(message) = reply {
                debug!(id = %self.id, "discarding abandoned transformer: {message}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEngine;
    use proptest::prelude::*;
    use secrecy::ExposeSecret;

    fn engine() -> Engine<MockEngine> {
        Engine::new(MockEngine::new())
    }

    #[test]
    fn test_generate_and_derive() {
        let engine = engine();
        let secret = engine.generate_secret_key().unwrap();
        let public = engine.derive_public_key(&secret.clone().into(), false).unwrap();

        assert!(secret.expose().starts_with("XSK_"));
        assert!(public.as_str().starts_with("XPK_"));
        assert_eq!(engine.derive_public_key(&secret.into(), false).unwrap(), public);
    }

    #[test]
    fn test_text_roundtrip_with_public_key() {
        let engine = engine();
        let secret = engine.generate_secret_key().unwrap();
        let public = engine.derive_public_key(&secret.clone().into(), false).unwrap();

        let ct = engine
            .encrypt_text(&public.into(), "attack at dawn", true)
            .unwrap();
        assert!(ct.as_str().starts_with("XCT_"));

        let pt = engine.decrypt_text(&secret.into(), &ct).unwrap();
        assert_eq!(pt.expose_secret(), "attack at dawn");
    }

    #[test]
    fn test_public_key_from_password() {
        let engine = engine();
        let password = KeyOrPassword::classify("correct horse battery staple");
        let public = engine.derive_public_key(&password, false).unwrap();
        let quantum = engine.derive_public_key(&password, true).unwrap();
        assert_ne!(public, quantum);

        for public in [public, quantum] {
            let ct = engine.encrypt_text(&public.into(), "for the password", true).unwrap();
            let pt = engine.decrypt_text(&password, &ct).unwrap();
            assert_eq!(pt.expose_secret(), "for the password");
        }
    }

    #[test]
    fn test_public_key_has_no_public_key() {
        let engine = engine();
        let key = KeyOrPassword::classify("XPK_ABC");
        let err = engine.derive_public_key(&key, false).unwrap_err();
        assert!(matches!(err, EngineError::InvalidKey(_)));
    }

    #[test]
    fn test_text_roundtrip_with_password() {
        let engine = engine();
        let key = KeyOrPassword::classify("correct horse battery staple");

        let ct = engine.encrypt_text(&key, "hello", false).unwrap();
        let pt = engine.decrypt_text(&key, &ct).unwrap();
        assert_eq!(pt.expose_secret(), "hello");
    }

    #[test]
    fn test_public_key_cannot_decrypt_text() {
        let engine = engine();
        let secret = engine.generate_secret_key().unwrap();
        let public = KeyOrPassword::from(engine.derive_public_key(&secret.into(), false).unwrap());

        let ct = engine.encrypt_text(&public, "x", false).unwrap();
        assert!(matches!(
            engine.decrypt_text(&public, &ct),
            Err(EngineError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_engine_error_is_verbatim() {
        let engine = Engine::new(MockEngine::new().fail_open("bad key"));
        let key = KeyOrPassword::classify("pw");

        let err = engine.open(Mode::Encrypt, &key, false).err().unwrap();
        assert!(matches!(&err, EngineError::Engine(m) if m == "bad key"));
        assert_eq!(err.to_string(), "bad key");
    }

    #[test]
    fn test_empty_result_is_an_error() {
        let engine = Engine::new(MockEngine::new().empty_replies());
        let err = engine.generate_secret_key().unwrap_err();
        assert!(matches!(err, EngineError::EmptyResult(_)));
        assert_eq!(err.to_string(), "failed to generate secret key");

        let key = KeyOrPassword::classify("pw");
        assert!(matches!(
            engine.open(Mode::Decrypt, &key, false),
            Err(EngineError::EmptyResult(_))
        ));
    }

    #[test]
    fn test_transformer_close_twice() {
        let engine = engine();
        let key = KeyOrPassword::classify("pw");
        let mut t = engine.open(Mode::Encrypt, &key, true).unwrap();

        t.feed(b"abc").unwrap();
        t.close().unwrap();
        assert!(t.is_closed());
        assert!(matches!(t.close(), Err(EngineError::Closed(_))));
        assert!(matches!(t.feed(b"x"), Err(EngineError::Closed(_))));
    }

    #[test]
    fn test_dropped_transformer_is_released() {
        let engine = engine();
        let key = KeyOrPassword::classify("pw");
        {
            let mut t = engine.open(Mode::Encrypt, &key, false).unwrap();
            t.feed(b"abandoned").unwrap();
        }
        assert_eq!(engine.raw().open_transformers(), 0);
    }

    #[test]
    fn test_chunked_roundtrip() {
        let engine = engine();
        let key = KeyOrPassword::classify("pw");
        let data: Vec<u8> = (0u8..=255).cycle().take(1000).collect();

        let mut enc = engine.open_encrypter(&key, true).unwrap();
        let mut ct = Vec::new();
        for chunk in data.chunks(37) {
            ct.extend(enc.feed(chunk).unwrap());
        }
        ct.extend(enc.close().unwrap());

        let mut dec = engine.open_decrypter(&key).unwrap();
        let mut pt = Vec::new();
        for chunk in ct.chunks(101) {
            pt.extend(dec.feed(chunk).unwrap());
        }
        pt.extend(dec.close().unwrap());

        assert_eq!(pt, data);
    }

    fn run(transformer: &mut Transformer<MockEngine>, data: &[u8], cuts: &[usize]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut at = 0;
        for &len in cuts {
            let end = (at + len).min(data.len());
            out.extend(transformer.feed(&data[at..end]).unwrap());
            at = end;
        }
        out.extend(transformer.feed(&data[at..]).unwrap());
        out.extend(transformer.close().unwrap());
        out
    }

    proptest! {
        #[test]
        fn chunked_roundtrip_any_cuts(
            data in proptest::collection::vec(any::<u8>(), 0..1024),
            enc_cuts in proptest::collection::vec(0usize..200, 0..10),
            dec_cuts in proptest::collection::vec(0usize..200, 0..10),
            compress in any::<bool>(),
        ) {
            let engine = engine();
            let key = KeyOrPassword::classify("XSK_PROP");

            let mut enc = engine.open_encrypter(&key, compress).unwrap();
            let ct = run(&mut enc, &data, &enc_cuts);
            let mut dec = engine.open_decrypter(&key).unwrap();
            let pt = run(&mut dec, &ct, &dec_cuts);

            prop_assert_eq!(pt, data);
            prop_assert_eq!(engine.raw().open_transformers(), 0);
        }
    }
}
