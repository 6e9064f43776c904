//! Vault record codec and the two at-rest keying schemes.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::vault::VaultError;
use crate::{BINDING_SIZE, IV_SIZE, TAG_SIZE};

/// Persisted form of one secret: `iv || binding || ciphertext`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultRecord {
    pub iv: [u8; IV_SIZE],
    /// Legacy: SHA-256 of the plaintext (also the AES key). Sealed: HKDF salt.
    pub binding: [u8; BINDING_SIZE],
    pub ciphertext: Vec<u8>,
}

impl VaultRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IV_SIZE + BINDING_SIZE + self.ciphertext.len());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.binding);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn decode(blob: &[u8]) -> Result<Self, VaultError> {
        if blob.len() < IV_SIZE + BINDING_SIZE + TAG_SIZE {
            return Err(VaultError::Corrupt(format!(
                "record too short: {} bytes (minimum {})",
                blob.len(),
                IV_SIZE + BINDING_SIZE + TAG_SIZE
            )));
        }
        let (iv, rest) = blob.split_at(IV_SIZE);
        let (binding, ciphertext) = rest.split_at(BINDING_SIZE);

        let mut record = VaultRecord {
            iv: [0u8; IV_SIZE],
            binding: [0u8; BINDING_SIZE],
            ciphertext: ciphertext.to_vec(),
        };
        record.iv.copy_from_slice(iv);
        record.binding.copy_from_slice(binding);
        Ok(record)
    }
}

/// A 256-bit key that seals vault records. Never persisted. Zeroized on drop.
#[derive(Clone)]
pub struct VaultMasterKey {
    bytes: [u8; 32],
}

impl VaultMasterKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Derive a master key from a passphrase with Argon2id.
    ///
    /// The salt does not need to be secret but must be stable for a vault;
    /// callers typically persist it next to the vault in plain storage.
    pub fn from_passphrase(
        passphrase: &SecretString,
        salt: &[u8; 16],
        params: &KdfParams,
    ) -> Result<Self, VaultError> {
        let argon2_params = Params::new(
            params.mem_cost_kib,
            params.time_cost,
            params.parallelism,
            Some(32),
        )
        .map_err(|e| VaultError::Kdf(format!("invalid Argon2id params: {e}")))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

        let mut key = [0u8; 32];
        argon2
            .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
            .map_err(|e| VaultError::Kdf(format!("Argon2id KDF failed: {e}")))?;

        Ok(Self::from_bytes(key))
    }

    /// A check value that identifies this key without revealing it. Stored
    /// next to a sealed vault so a wrong passphrase is caught before any
    /// record is touched.
    pub fn verifier(&self) -> Result<[u8; 32], VaultError> {
        let hkdf = Hkdf::<Sha256>::new(None, &self.bytes);
        let mut check = [0u8; 32];
        hkdf.expand(b"xipher-vault-verifier", &mut check)
            .map_err(|e| VaultError::Kdf(format!("HKDF expand failed: {e}")))?;
        Ok(check)
    }
}

impl Drop for VaultMasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for VaultMasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultMasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id parameters for passphrase-derived master keys
#[derive(Debug, Clone)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

/// How a record's AES-256-GCM key is obtained.
#[derive(Debug, Clone)]
pub enum VaultScheme {
    /// key = binding = SHA-256(plaintext). Interoperable with existing records.
    Legacy,
    /// key = HKDF-SHA256(master, salt = binding).
    Sealed(VaultMasterKey),
}

impl VaultScheme {
    pub fn name(&self) -> &'static str {
        match self {
            VaultScheme::Legacy => "legacy",
            VaultScheme::Sealed(_) => "sealed",
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<VaultRecord, VaultError> {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let (binding, mut key) = match self {
            VaultScheme::Legacy => {
                let digest: [u8; 32] = Sha256::digest(plaintext).into();
                (digest, digest)
            }
            VaultScheme::Sealed(master) => {
                let mut salt = [0u8; BINDING_SIZE];
                rand::thread_rng().fill_bytes(&mut salt);
                let key = sealed_key(master, &salt)?;
                (salt, key)
            }
        };

        let cipher = Aes256Gcm::new((&key).into());
        key.zeroize();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|e| VaultError::Seal(format!("record encryption failed: {e}")))?;

        Ok(VaultRecord {
            iv,
            binding,
            ciphertext,
        })
    }

    pub fn open(&self, record: &VaultRecord) -> Result<Vec<u8>, VaultError> {
        let mut key = match self {
            VaultScheme::Legacy => record.binding,
            VaultScheme::Sealed(master) => sealed_key(master, &record.binding)?,
        };
        let cipher = Aes256Gcm::new((&key).into());
        key.zeroize();

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&record.iv), record.ciphertext.as_ref())
            .map_err(|_| {
                VaultError::Corrupt("record decryption failed: wrong key or tampered data".into())
            })?;

        if let VaultScheme::Legacy = self {
            let digest: [u8; 32] = Sha256::digest(&plaintext).into();
            if digest != record.binding {
                return Err(VaultError::Corrupt(
                    "record digest does not match its plaintext".into(),
                ));
            }
        }
        Ok(plaintext)
    }
}

fn sealed_key(master: &VaultMasterKey, salt: &[u8; BINDING_SIZE]) -> Result<[u8; 32], VaultError> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), master.as_bytes());
    let mut okm = [0u8; 32];
    hkdf.expand(b"xipher-vault-record", &mut okm)
        .map_err(|e| VaultError::Kdf(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}
