use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{XipherError, XipherResult};

/// Top-level configuration (loaded from xipher.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct XipherConfig {
    pub stream: StreamConfig,
    pub vault: VaultConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Bytes pulled from a file source per chunk (default: 64 KiB)
    pub chunk_size: usize,
    /// Compress before encrypting unless told otherwise (default: true)
    pub compress: bool,
}

/// Where the vault keeps its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultBackend {
    /// One file per record under `vault.dir`
    File,
    /// Platform keychain (macOS Keychain, Secret Service, Credential Manager)
    Keychain,
    /// Process memory only; nothing survives a restart
    Memory,
}

/// How vault records are keyed at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultSchemeKind {
    /// Record key is SHA-256 of the plaintext, stored in the record itself.
    /// Readable by anything that can read the record; kept for interoperability.
    Legacy,
    /// Record key is derived from a passphrase that is never persisted.
    Sealed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Record directory for the file backend
    pub dir: PathBuf,
    pub backend: VaultBackend,
    pub scheme: VaultSchemeKind,
    /// Record id of the secret key
    pub secret_id: String,
    /// Record id of the cached public key
    pub public_key_id: String,
    /// Keychain service name for the keychain backend
    pub keychain_service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// External engine executable
    pub command: PathBuf,
    /// Extra arguments passed to the engine
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            compress: true,
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("~/.config/xipher/vault"),
            backend: VaultBackend::File,
            scheme: VaultSchemeKind::Legacy,
            secret_id: "xipherSecret".into(),
            public_key_id: "xipherPublicKey".into(),
            keychain_service: "xipher".into(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from("xipher-engine"),
            args: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl XipherConfig {
    /// Read a config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> XipherResult<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| XipherError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> XipherResult<()> {
        if self.stream.chunk_size == 0 {
            return Err(XipherError::Config("stream.chunk_size must be > 0".into()));
        }
        if self.vault.secret_id.is_empty() || self.vault.public_key_id.is_empty() {
            return Err(XipherError::Config("vault record ids must not be empty".into()));
        }
        if self.vault.secret_id == self.vault.public_key_id {
            return Err(XipherError::Config(
                "vault.secret_id and vault.public_key_id must differ".into(),
            ));
        }
        Ok(())
    }
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[stream]
chunk_size = 1048576
compress = false

[vault]
dir = "/var/lib/xipher"
backend = "keychain"
scheme = "sealed"
secret_id = "mySecret"
public_key_id = "myPublic"

[engine]
command = "/usr/local/bin/xipher-engine"
args = ["--serve"]

[logging]
level = "debug"
format = "json"
"#;
        let config: XipherConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.stream.chunk_size, 1048576);
        assert!(!config.stream.compress);
        assert_eq!(config.vault.dir, PathBuf::from("/var/lib/xipher"));
        assert_eq!(config.vault.backend, VaultBackend::Keychain);
        assert_eq!(config.vault.scheme, VaultSchemeKind::Sealed);
        assert_eq!(config.vault.secret_id, "mySecret");
        assert_eq!(config.engine.args, vec!["--serve".to_string()]);
        assert_eq!(config.logging.format, "json");
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_defaults() {
        let config: XipherConfig = toml::from_str("").unwrap();

        assert_eq!(config.stream.chunk_size, 64 * 1024);
        assert!(config.stream.compress);
        assert_eq!(config.vault.backend, VaultBackend::File);
        assert_eq!(config.vault.scheme, VaultSchemeKind::Legacy);
        assert_eq!(config.vault.secret_id, "xipherSecret");
        assert_eq!(config.vault.public_key_id, "xipherPublicKey");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[stream]
chunk_size = 4096
"#;
        let config: XipherConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.stream.chunk_size, 4096);
        // Defaults
        assert!(config.stream.compress);
        assert_eq!(config.engine.command, PathBuf::from("xipher-engine"));
    }

    #[test]
    fn test_validate_rejects_zero_chunk() {
        let mut config = XipherConfig::default();
        config.stream.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_shared_ids() {
        let mut config = XipherConfig::default();
        config.vault.public_key_id = config.vault.secret_id.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = XipherConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.stream.chunk_size, 64 * 1024);
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("xipher.toml");
        std::fs::write(&path, "[stream\nchunk_size = ").unwrap();
        assert!(matches!(
            XipherConfig::load(&path),
            Err(XipherError::Config(_))
        ));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = XipherConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: XipherConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.vault.dir, parsed.vault.dir);
        assert_eq!(config.stream.chunk_size, parsed.stream.chunk_size);
        assert_eq!(config.vault.scheme, parsed.vault.scheme);
    }

    #[test]
    fn test_expand_home_leaves_absolute_paths() {
        assert_eq!(
            expand_home(Path::new("/etc/xipher")),
            PathBuf::from("/etc/xipher")
        );
    }
}
