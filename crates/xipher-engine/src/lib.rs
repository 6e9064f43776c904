//! xipher-engine: the boundary to the external cryptographic engine
//!
//! The engine is opaque. It generates keys, encrypts and decrypts short text
//! tokens, and exposes a chunked transformer (open → feed* → close) for
//! arbitrarily large streams. Every engine call answers with either a value or
//! an error message; that envelope is decoded once, in [`adapter::Engine`], and
//! the rest of the workspace only sees `Result<_, EngineError>`.
//!
//! ```text
//! RawEngine (EngineReply<T>)  ──►  Engine<R> (Result<T, EngineError>)  ──►  vault / stream
//! ```

pub mod adapter;
pub mod keys;
#[cfg(any(test, feature = "testing"))]
pub mod mock;
pub mod process;
pub mod reply;

pub use adapter::{Engine, EngineError, Transformer};
pub use keys::{CipherText, KeyOrPassword, PublicKey, SecretKey};
pub use process::ProcessEngine;
pub use reply::{EngineReply, RawEngine, TransformerId};
