//! The engine's call interface and its response envelope.

use std::fmt;

/// One engine response: a value or the engine's error message, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineReply<T> {
    Ok(T),
    Err(String),
}

impl<T> EngineReply<T> {
    pub fn into_result(self) -> Result<T, String> {
        match self {
            EngineReply::Ok(value) => Ok(value),
            EngineReply::Err(message) => Err(message),
        }
    }

    pub fn is_err(&self) -> bool {
        matches!(self, EngineReply::Err(_))
    }
}

impl<T> From<Result<T, String>> for EngineReply<T> {
    fn from(result: Result<T, String>) -> Self {
        match result {
            Ok(value) => EngineReply::Ok(value),
            Err(message) => EngineReply::Err(message),
        }
    }
}

/// Opaque identifier of one open chunked transformer inside the engine.
///
/// Id 0 is never handed out; a zero id in a reply counts as "no result".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TransformerId(pub u64);

impl fmt::Display for TransformerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transformer#{}", self.0)
    }
}

/// The narrow call interface of the external engine.
///
/// Keys and passwords cross this boundary as plain strings; typing happens in
/// the adapter. Implementations must be callable from any thread, but a single
/// transformer is never fed concurrently.
pub trait RawEngine: Send + Sync + 'static {
    fn new_secret_key(&self) -> EngineReply<String>;
    /// Public key of a secret key or of a password. `quantum_safe` selects
    /// the post-quantum key encapsulation.
    fn public_key(&self, secret_or_password: &str, quantum_safe: bool) -> EngineReply<String>;

    fn encrypt_text(&self, key: &str, plaintext: &str, compress: bool) -> EngineReply<String>;
    fn decrypt_text(&self, key: &str, ciphertext: &str) -> EngineReply<String>;

    fn open_encrypter(&self, key: &str, compress: bool) -> EngineReply<TransformerId>;
    fn feed_encrypter(&self, id: TransformerId, chunk: &[u8]) -> EngineReply<Vec<u8>>;
    fn close_encrypter(&self, id: TransformerId) -> EngineReply<Vec<u8>>;

    fn open_decrypter(&self, key: &str) -> EngineReply<TransformerId>;
    fn feed_decrypter(&self, id: TransformerId, chunk: &[u8]) -> EngineReply<Vec<u8>>;
    fn close_decrypter(&self, id: TransformerId) -> EngineReply<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_from_result() {
        let ok: EngineReply<u8> = Ok(7).into();
        let err: EngineReply<u8> = Err("bad key".to_string()).into();

        assert_eq!(ok.into_result(), Ok(7));
        assert!(err.is_err());
        assert_eq!(err.into_result(), Err("bad key".to_string()));
    }

    #[test]
    fn test_transformer_id_display() {
        assert_eq!(TransformerId(3).to_string(), "transformer#3");
    }
}
