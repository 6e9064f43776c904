//! xipher-vault: local encrypted-at-rest storage for the user's secret key
//!
//! Record layout (binary, one record per id):
//! ```text
//! [12 bytes: AES-GCM IV][32 bytes: binding][N bytes: ciphertext + 16-byte tag]
//! ```
//!
//! Two schemes share that layout:
//! - `Legacy`: binding = SHA-256(plaintext), which is also the AES-256-GCM key.
//!   Anyone who can read the record can decrypt it; the scheme only binds the
//!   ciphertext to its plaintext and hides it from casual inspection.
//! - `Sealed`: binding = random salt, AES key = HKDF-SHA256(master, salt).
//!   The master key is never written next to the record.
//!
//! The derived public key is cached next to the secret in plain storage.

pub mod keychain;
pub mod keystore;
pub mod record;
pub mod store;
pub mod vault;

pub use keychain::KeychainStore;
pub use keystore::Keystore;
pub use record::{KdfParams, VaultMasterKey, VaultRecord, VaultScheme};
pub use store::{FileStore, KvStore, MemoryStore};
pub use vault::{KeyVault, VaultError};

/// Size of the AES-GCM IV stored at the front of a record
pub const IV_SIZE: usize = 12;

/// Size of the binding field (digest or salt) after the IV
pub const BINDING_SIZE: usize = 32;

/// Size of the AES-GCM authentication tag
pub const TAG_SIZE: usize = 16;
