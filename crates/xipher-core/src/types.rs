//! Token prefixes and file naming shared by every xipher surface.
//!
//! The engine encodes its artifacts as prefixed strings. Callers branch on the
//! prefix (and on the `.xipher` extension for files) to decide whether an input
//! should be encrypted or decrypted.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Prefix of a string-encoded secret key.
pub const SECRET_KEY_PREFIX: &str = "XSK_";

/// Prefix of a string-encoded public key.
pub const PUBLIC_KEY_PREFIX: &str = "XPK_";

/// Prefix of a string-encoded ciphertext token.
pub const CIPHERTEXT_PREFIX: &str = "XCT_";

/// Extension (without the dot) of files produced by stream encryption.
pub const ENCRYPTED_FILE_EXT: &str = "xipher";

/// Direction of a transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Encrypt,
    Decrypt,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Encrypt => f.write_str("encrypt"),
            Mode::Decrypt => f.write_str("decrypt"),
        }
    }
}

/// What a user-supplied string looks like, judged by its prefix alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    SecretKey,
    PublicKey,
    CipherText,
    /// Anything without a known prefix (a password or plain text).
    Plain,
}

impl TokenKind {
    pub fn detect(input: &str) -> Self {
        let input = input.trim();
        if input.starts_with(SECRET_KEY_PREFIX) {
            TokenKind::SecretKey
        } else if input.starts_with(PUBLIC_KEY_PREFIX) {
            TokenKind::PublicKey
        } else if input.starts_with(CIPHERTEXT_PREFIX) {
            TokenKind::CipherText
        } else {
            TokenKind::Plain
        }
    }
}

/// True if `path` carries the `.xipher` extension.
pub fn is_encrypted_path(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(ENCRYPTED_FILE_EXT))
}

/// Output path for encrypting `path`: `report.pdf` → `report.pdf.xipher`.
pub fn encrypted_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(ENCRYPTED_FILE_EXT);
    PathBuf::from(name)
}

/// Output path for decrypting `path`: `report.pdf.xipher` → `report.pdf`.
///
/// Returns `None` when `path` does not end in `.xipher` or when stripping the
/// extension would leave an empty file name.
pub fn decrypted_path(path: &Path) -> Option<PathBuf> {
    if !is_encrypted_path(path) {
        return None;
    }
    let stem = path.file_stem()?;
    if stem.is_empty() {
        return None;
    }
    Some(path.with_file_name(stem))
}

/// Choose the direction for a file by its name.
pub fn mode_for_path(path: &Path) -> Mode {
    if is_encrypted_path(path) {
        Mode::Decrypt
    } else {
        Mode::Encrypt
    }
}
