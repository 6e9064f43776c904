//! xipher: encrypt text and files through the xipher engine
//!
//! Key commands:
//!   keygen / pubkey          - show the vault's key pair (created on first use)
//!   vault show|set|reset     - inspect, import or discard the stored secret key
//!
//! Transform commands:
//!   encrypt-text / decrypt-text  - short XCT_ tokens
//!   encrypt / decrypt            - streamed files (`name` ↔ `name.xipher`)
//!
//! Without `--key`, encryption uses the vault's public key and decryption its
//! secret key.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use xipher_core::config::{expand_home, VaultBackend, VaultSchemeKind, XipherConfig};
use xipher_engine::{CipherText, Engine, KeyOrPassword, ProcessEngine};
use xipher_stream::{FileTransfer, ProgressReporter, Session, StreamJob, StreamStatus};
use xipher_vault::{
    FileStore, KdfParams, KeyVault, KeychainStore, Keystore, KvStore, MemoryStore,
    VaultMasterKey, VaultScheme,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "xipher",
    version,
    about = "Client-side encryption for text and files",
    long_about = "xipher: encrypt and decrypt text and files with keys or passwords, \
                  keeping your secret key in a local vault"
)]
struct Cli {
    /// Path to xipher.toml configuration file
    #[arg(long, short = 'c', env = "XIPHER_CONFIG", default_value = "~/.config/xipher/xipher.toml")]
    config: PathBuf,

    /// Log level (overrides config)
    #[arg(long, env = "XIPHER_LOG")]
    log: Option<String>,

    /// Log format (overrides config)
    #[arg(long, env = "XIPHER_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the vault's secret key, generating one if none is stored
    Keygen {
        /// Derive a public key from a password instead
        #[arg(long, short = 'p')]
        password: bool,
        /// Derive a quantum-safe public key
        #[arg(long, short = 'q', requires = "password")]
        quantum_safe: bool,
    },

    /// Print the public key of the vault's secret key
    Pubkey {
        /// Derive from a password instead of the vault's secret key
        #[arg(long, short = 'p')]
        password: bool,
        /// Derive a quantum-safe public key
        #[arg(long, short = 'q')]
        quantum_safe: bool,
    },

    /// Encrypt a short text into an XCT_ token
    #[command(name = "encrypt-text")]
    EncryptText {
        /// Text to encrypt
        text: String,
        #[command(flatten)]
        key: KeyArgs,
        /// Skip compression
        #[arg(long)]
        no_compress: bool,
    },

    /// Decrypt an XCT_ token
    #[command(name = "decrypt-text")]
    DecryptText {
        /// Ciphertext token (XCT_...)
        ciphertext: String,
        #[command(flatten)]
        key: KeyArgs,
    },

    /// Encrypt a file into FILE.xipher
    Encrypt {
        file: PathBuf,
        #[command(flatten)]
        key: KeyArgs,
        /// Skip compression
        #[arg(long)]
        no_compress: bool,
        /// Output path (default: FILE.xipher)
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
        /// Replace an existing output file
        #[arg(long, short = 'f')]
        force: bool,
    },

    /// Decrypt FILE.xipher into FILE
    Decrypt {
        file: PathBuf,
        #[command(flatten)]
        key: KeyArgs,
        /// Output path (default: FILE without .xipher)
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
        /// Replace an existing output file
        #[arg(long, short = 'f')]
        force: bool,
    },

    /// Local key vault management
    Vault {
        #[command(subcommand)]
        action: VaultAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug)]
struct KeyArgs {
    /// Key (XSK_/XPK_) or password; defaults to the vault's keys
    #[arg(long, short = 'k', env = "XIPHER_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Prompt for a password instead
    #[arg(long, short = 'p', conflicts_with = "key")]
    password: bool,
}

#[derive(Subcommand, Debug)]
enum VaultAction {
    /// Show vault location, scheme and public key
    Show {
        /// Also print the secret key
        #[arg(long)]
        reveal: bool,
    },
    /// Replace the stored secret key
    Set {
        /// Secret key (XSK_...); prompted for when omitted
        secret: Option<String>,
    },
    /// Delete the stored key pair
    Reset,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_home(&cli.config);
    let config = XipherConfig::load(&config_path)
        .with_context(|| format!("loading config: {}", config_path.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.logging.level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.logging.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);

    match cli.command {
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &config_path),
        Commands::Keygen { password: true, quantum_safe } => {
            let app = App::open(&config)?;
            cmd_public_key(&app, true, quantum_safe)
        }
        Commands::Keygen { password: false, .. } => {
            let app = App::open(&config)?;
            let secret = app.keystore.secret_key()?;
            println!("{}", secret.expose());
            Ok(())
        }
        Commands::Pubkey { password, quantum_safe } => {
            let app = App::open(&config)?;
            cmd_public_key(&app, password, quantum_safe)
        }
        Commands::EncryptText { text, key, no_compress } => {
            let app = App::open(&config)?;
            let key = app.encryption_key(&key)?;
            let ct = app
                .engine
                .encrypt_text(&key, &text, config.stream.compress && !no_compress)?;
            println!("{ct}");
            Ok(())
        }
        Commands::DecryptText { ciphertext, key } => {
            let app = App::open(&config)?;
            let key = app.decryption_key(&key)?;
            let ct = CipherText::parse(&ciphertext)?;
            let plaintext = app.engine.decrypt_text(&key, &ct)?;
            println!("{}", plaintext.expose_secret());
            Ok(())
        }
        Commands::Encrypt { file, key, no_compress, out, force } => {
            let app = App::open(&config)?;
            let key = app.encryption_key(&key)?;
            let mut transfer = FileTransfer::for_encrypt(&file);
            if let Some(out) = out {
                transfer = transfer.with_output(out);
            }
            let transfer = transfer
                .with_chunk_size(config.stream.chunk_size)
                .with_overwrite(force);
            let compress = config.stream.compress && !no_compress;
            let pb = make_progress_bar(&transfer, "encrypt").await?;
            let job = StreamJob::encrypt(app.engine.clone(), key, compress, progress_reporter(&pb));
            run_file_job(&transfer, job, pb).await
        }
        Commands::Decrypt { file, key, out, force } => {
            let app = App::open(&config)?;
            let key = app.decryption_key(&key)?;
            let mut transfer = match out {
                Some(out) => FileTransfer::new(&file, out),
                None => FileTransfer::for_decrypt(&file)?,
            };
            transfer = transfer
                .with_chunk_size(config.stream.chunk_size)
                .with_overwrite(force);
            let pb = make_progress_bar(&transfer, "decrypt").await?;
            let job = StreamJob::decrypt(app.engine.clone(), key, progress_reporter(&pb));
            run_file_job(&transfer, job, pb).await
        }
        Commands::Vault { action } => {
            let app = App::open(&config)?;
            match action {
                VaultAction::Show { reveal } => cmd_vault_show(&app, &config, reveal),
                VaultAction::Set { secret } => cmd_vault_set(&app, secret),
                VaultAction::Reset => {
                    app.keystore.reset()?;
                    println!("Vault reset. A new key pair is generated on next use.");
                    Ok(())
                }
            }
        }
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries keys and ciphertext; logs go to stderr
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Engine + vault wiring ─────────────────────────────────────────────────────

type Store = Box<dyn KvStore>;

struct App {
    engine: Engine<ProcessEngine>,
    keystore: Keystore<ProcessEngine, Store>,
}

impl App {
    fn open(config: &XipherConfig) -> Result<Self> {
        let command = expand_home(&config.engine.command);
        let raw = ProcessEngine::spawn(&command, &config.engine.args)
            .with_context(|| format!("starting engine: {}", command.display()))?;
        let engine = Engine::new(raw);

        let store = open_store(config)?;
        let scheme = open_scheme(config, store.as_ref())?;
        debug!(backend = ?config.vault.backend, scheme = scheme.name(), "vault opened");
        let vault = KeyVault::new(store, scheme);
        vault
            .verify_master(&format!("{}Check", config.vault.secret_id))
            .context("wrong vault passphrase")?;
        let keystore = Keystore::new(
            engine.clone(),
            vault,
            config.vault.secret_id.clone(),
            config.vault.public_key_id.clone(),
        );
        Ok(Self { engine, keystore })
    }

    fn encryption_key(&self, args: &KeyArgs) -> Result<KeyOrPassword> {
        match explicit_key(args)? {
            Some(key) => Ok(key),
            None => Ok(self.keystore.public_key()?.into()),
        }
    }

    fn decryption_key(&self, args: &KeyArgs) -> Result<KeyOrPassword> {
        let key = match explicit_key(args)? {
            Some(key) => key,
            None => self.keystore.secret_key()?.into(),
        };
        if !key.can_decrypt() {
            anyhow::bail!("a public key can only encrypt; pass a secret key or password");
        }
        Ok(key)
    }
}

fn explicit_key(args: &KeyArgs) -> Result<Option<KeyOrPassword>> {
    if args.password {
        return Ok(Some(read_password(false)?));
    }
    Ok(args.key.as_deref().map(KeyOrPassword::classify))
}

fn read_password(confirm: bool) -> Result<KeyOrPassword> {
    let password = rpassword::prompt_password("Password: ").context("reading password")?;
    if password.is_empty() {
        anyhow::bail!("password must not be empty");
    }
    if confirm {
        let again =
            rpassword::prompt_password("Confirm password: ").context("reading password")?;
        if again != password {
            anyhow::bail!("passwords do not match");
        }
    }
    Ok(KeyOrPassword::password(&password))
}

/// The vault's cached public key, unless a password or a quantum-safe key
/// is asked for; those are derived fresh and never stored.
fn cmd_public_key(app: &App, password: bool, quantum_safe: bool) -> Result<()> {
    let public = if password {
        let key = read_password(true)?;
        app.engine.derive_public_key(&key, quantum_safe)?
    } else if quantum_safe {
        let secret = app.keystore.secret_key()?;
        app.engine.derive_public_key(&secret.into(), true)?
    } else {
        app.keystore.public_key()?
    };
    println!("{public}");
    Ok(())
}

fn open_store(config: &XipherConfig) -> Result<Store> {
    match config.vault.backend {
        VaultBackend::File => {
            let dir = expand_home(&config.vault.dir);
            let store = FileStore::open(&dir)
                .with_context(|| format!("opening vault dir: {}", dir.display()))?;
            Ok(Box::new(store))
        }
        VaultBackend::Keychain => {
            let store = KeychainStore::new(config.vault.keychain_service.clone());
            if !store.is_available() {
                anyhow::bail!("platform keychain is not available; set vault.backend = \"file\"");
            }
            Ok(Box::new(store))
        }
        VaultBackend::Memory => Ok(Box::new(MemoryStore::new())),
    }
}

/// Sealed vaults derive their master key from a passphrase and a salt kept in
/// plain storage next to the records.
fn open_scheme(config: &XipherConfig, store: &dyn KvStore) -> Result<VaultScheme> {
    match config.vault.scheme {
        VaultSchemeKind::Legacy => Ok(VaultScheme::Legacy),
        VaultSchemeKind::Sealed => {
            let salt_id = format!("{}Salt", config.vault.secret_id);
            let salt: [u8; 16] = match store.get(&salt_id)? {
                Some(bytes) => bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("vault salt '{salt_id}' is corrupt"))?,
                None => {
                    let mut salt = [0u8; 16];
                    rand::thread_rng().fill_bytes(&mut salt);
                    store.set(&salt_id, &salt)?;
                    info!("created vault salt");
                    salt
                }
            };
            let passphrase = match std::env::var("XIPHER_VAULT_PASSPHRASE") {
                Ok(value) => SecretString::from(value),
                Err(_) => SecretString::from(
                    rpassword::prompt_password("Vault passphrase: ")
                        .context("reading vault passphrase")?,
                ),
            };
            let master = VaultMasterKey::from_passphrase(&passphrase, &salt, &KdfParams::default())?;
            Ok(VaultScheme::Sealed(master))
        }
    }
}

// ── Progress display ──────────────────────────────────────────────────────────

async fn make_progress_bar(transfer: &FileTransfer, prefix: &str) -> Result<ProgressBar> {
    let total = transfer
        .input_len()
        .await
        .with_context(|| format!("reading {}", transfer.input.display()))?;
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=>-");
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn progress_reporter(pb: &ProgressBar) -> impl ProgressReporter + 'static {
    let pb = pb.clone();
    move |processed: u64, status: StreamStatus| {
        pb.set_position(processed);
        if status == StreamStatus::Cancelling {
            pb.set_message("cancelling…");
        }
    }
}

// ── `xipher encrypt` / `xipher decrypt` ───────────────────────────────────────

async fn run_file_job(
    transfer: &FileTransfer,
    job: StreamJob<ProcessEngine>,
    pb: ProgressBar,
) -> Result<()> {
    let session = Arc::new(Session::new());
    let interrupt = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() && session.cancel_current() {
                info!("interrupt received, cancelling");
                session.wait_idle().await;
            }
        })
    };

    let result = transfer.run_in(&session, job).await;
    interrupt.abort();
    let outcome = result.with_context(|| format!("processing {}", transfer.input.display()))?;

    match outcome.status {
        StreamStatus::Completed => {
            pb.finish_with_message("done");
            println!(
                "{} → {} ({})",
                transfer.input.display(),
                transfer.output.display(),
                fmt_bytes(outcome.processed_size)
            );
            Ok(())
        }
        StreamStatus::Cancelled => {
            pb.abandon_with_message("cancelled");
            anyhow::bail!(
                "cancelled after {}; remove the incomplete output: {}",
                fmt_bytes(outcome.processed_size),
                transfer.output.display()
            )
        }
        _ => {
            pb.abandon_with_message("failed");
            let reason = outcome
                .failure
                .map(|f| f.to_string())
                .unwrap_or_else(|| "unknown failure".to_string());
            anyhow::bail!(
                "{reason}; remove the incomplete output: {}",
                transfer.output.display()
            )
        }
    }
}

// ── `xipher vault` ────────────────────────────────────────────────────────────

fn cmd_vault_show(app: &App, config: &XipherConfig, reveal: bool) -> Result<()> {
    let backend = match config.vault.backend {
        VaultBackend::File => format!("file ({})", expand_home(&config.vault.dir).display()),
        VaultBackend::Keychain => format!("keychain (service {})", config.vault.keychain_service),
        VaultBackend::Memory => "memory".to_string(),
    };
    println!("backend:    {backend}");
    println!("scheme:     {}", app.keystore.vault().scheme().name());
    println!("public key: {}", app.keystore.public_key()?);
    if reveal {
        println!("secret key: {}", app.keystore.secret_key()?.expose());
    }
    Ok(())
}

fn cmd_vault_set(app: &App, secret: Option<String>) -> Result<()> {
    let secret = match secret {
        Some(secret) => secret,
        None => rpassword::prompt_password("Secret key: ").context("reading secret key")?,
    };
    if app.keystore.set_secret_key(&secret)? {
        println!("Secret key replaced.");
        println!("public key: {}", app.keystore.public_key()?);
    } else {
        println!("Secret key unchanged.");
    }
    Ok(())
}

// ── `xipher config show` ──────────────────────────────────────────────────────

fn cmd_config_show(config: &XipherConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
