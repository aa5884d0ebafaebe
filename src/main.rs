//! zkdocs - Zero-knowledge document vault
//!
//! Usage:
//!   zkdocs init                 - Write a configuration file
//!   zkdocs encrypt / decrypt    - Seal or open a standalone payload
//!   zkdocs put / get / list     - Store and read documents
//!   zkdocs rotate               - Change the passphrase
//!   zkdocs gc                   - Purge retired key versions
//!   zkdocs status               - Show key state

use clap::{Parser, Subcommand};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zkdocs::{
    config::Config,
    crypto::{EncryptedPayload, Passphrase},
    rotation::RotationState,
    store::{DocumentId, UserId},
    vault::{DocumentVault, SaveOutcome},
    Error, Result,
};

#[derive(Parser)]
#[command(name = "zkdocs")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Zero-knowledge encrypted document vault")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/zkdocs/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// User whose documents to operate on
    #[arg(short, long, default_value = "default")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file
    Init {
        /// PBKDF2 iterations for new key versions
        #[arg(long)]
        kdf_iterations: Option<u32>,

        /// Data directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Print the identity hash of a passphrase
    Identify {
        /// Read passphrase from file
        #[arg(long)]
        password_file: Option<PathBuf>,
    },

    /// Encrypt a file into a standalone JSON payload
    Encrypt {
        /// Input file (stdin if omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Read passphrase from file
        #[arg(long)]
        password_file: Option<PathBuf>,
    },

    /// Decrypt a standalone JSON payload
    Decrypt {
        /// Input file (stdin if omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Read passphrase from file
        #[arg(long)]
        password_file: Option<PathBuf>,
    },

    /// Store a document
    Put {
        /// Document ID (generated if omitted)
        document_id: Option<String>,

        /// Input file (stdin if omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Read passphrase from file
        #[arg(long)]
        password_file: Option<PathBuf>,
    },

    /// Read a document
    Get {
        /// Document ID
        document_id: String,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Read passphrase from file
        #[arg(long)]
        password_file: Option<PathBuf>,
    },

    /// List documents under the active key version
    List,

    /// Change the passphrase, re-encrypting every document
    Rotate {
        /// Read current passphrase from file
        #[arg(long)]
        old_password_file: Option<PathBuf>,

        /// Read new passphrase from file
        #[arg(long)]
        new_password_file: Option<PathBuf>,
    },

    /// Purge retired key versions past their grace period
    Gc,

    /// Show key versions and document counts
    Status,
}

fn main() {
    let cli = Cli::parse();

    // Expand ~ in config path
    let config_path = expand_tilde(&cli.config);

    // RUST_LOG wins, then --verbose, then the configured level
    let default_level = if cli.verbose {
        "debug".to_string()
    } else {
        Config::load_or_default(&config_path)
            .map(|c| c.logging.level)
            .unwrap_or_else(|_| "info".to_string())
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    let user = UserId::new(cli.user);
    if let Err(e) = run_command(cli.command, &config_path, &user) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path, user: &UserId) -> Result<()> {
    match command {
        Commands::Init {
            kdf_iterations,
            data_dir,
            force,
        } => cmd_init(config_path, kdf_iterations, data_dir, force),
        Commands::Identify { password_file } => cmd_identify(config_path, password_file),
        Commands::Encrypt {
            input,
            output,
            password_file,
        } => cmd_encrypt(config_path, input, output, password_file),
        Commands::Decrypt {
            input,
            output,
            password_file,
        } => cmd_decrypt(config_path, input, output, password_file),
        Commands::Put {
            document_id,
            input,
            password_file,
        } => cmd_put(config_path, user, document_id, input, password_file),
        Commands::Get {
            document_id,
            output,
            password_file,
        } => cmd_get(config_path, user, &document_id, output, password_file),
        Commands::List => cmd_list(config_path, user),
        Commands::Rotate {
            old_password_file,
            new_password_file,
        } => cmd_rotate(config_path, user, old_password_file, new_password_file),
        Commands::Gc => cmd_gc(config_path, user),
        Commands::Status => cmd_status(config_path, user),
    }
}

fn cmd_init(
    config_path: &Path,
    kdf_iterations: Option<u32>,
    data_dir: Option<PathBuf>,
    force: bool,
) -> Result<()> {
    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "{:?} already exists (use --force to overwrite)",
            config_path
        )));
    }

    info!("Initializing zkdocs...");

    let mut config = Config::default();
    config.apply_env_overrides();
    if let Some(iterations) = kdf_iterations {
        config.encryption.kdf_iterations = iterations;
    }
    if let Some(dir) = data_dir {
        config.store.data_dir = dir;
    }
    config.validate()?;

    config.save(config_path)?;
    config.ensure_directories()?;

    info!("Configuration saved to {:?}", config_path);
    info!("Data directory: {:?}", config.store.data_dir);
    info!("KDF iterations: {}", config.encryption.kdf_iterations);
    Ok(())
}

fn cmd_identify(config_path: &Path, password_file: Option<PathBuf>) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let vault = DocumentVault::open(&config)?;
    let passphrase = read_passphrase(password_file.as_deref(), "Passphrase: ")?;

    println!("{}", vault.identify(&passphrase));
    Ok(())
}

fn cmd_encrypt(
    config_path: &Path,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    password_file: Option<PathBuf>,
) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let vault = DocumentVault::open(&config)?;
    let plaintext = zeroize::Zeroizing::new(read_input(input.as_deref())?);
    let passphrase = read_passphrase(password_file.as_deref(), "Passphrase: ")?;

    let payload = vault.encrypt_document(&plaintext, &passphrase)?;
    write_output(output.as_deref(), payload.to_json()?.as_bytes())
}

fn cmd_decrypt(
    config_path: &Path,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    password_file: Option<PathBuf>,
) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let vault = DocumentVault::open(&config)?;
    let raw = read_input(input.as_deref())?;
    let json = String::from_utf8(raw)
        .map_err(|_| Error::MalformedInput("payload is not UTF-8".to_string()))?;
    let payload = EncryptedPayload::from_json(&json)?;
    let passphrase = read_passphrase(password_file.as_deref(), "Passphrase: ")?;

    let plaintext = zeroize::Zeroizing::new(vault.decrypt_document(&payload, &passphrase)?);
    write_output(output.as_deref(), &plaintext)
}

fn cmd_put(
    config_path: &Path,
    user: &UserId,
    document_id: Option<String>,
    input: Option<PathBuf>,
    password_file: Option<PathBuf>,
) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let vault = DocumentVault::open(&config)?;
    let document_id = document_id
        .map(DocumentId::new)
        .unwrap_or_else(DocumentId::generate);
    let plaintext = zeroize::Zeroizing::new(read_input(input.as_deref())?);
    let passphrase = read_passphrase(password_file.as_deref(), "Passphrase: ")?;

    match vault.save_document(user, &document_id, &plaintext, &passphrase)? {
        SaveOutcome::Stored(document) => {
            info!(
                "Stored {} under key version {}",
                document.document_id, document.key_version_id
            );
            println!("{}", document.document_id);
        }
        SaveOutcome::Queued => warn!("Rotation in progress; save of {} queued", document_id),
    }
    Ok(())
}

fn cmd_get(
    config_path: &Path,
    user: &UserId,
    document_id: &str,
    output: Option<PathBuf>,
    password_file: Option<PathBuf>,
) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let vault = DocumentVault::open(&config)?;
    let passphrase = read_passphrase(password_file.as_deref(), "Passphrase: ")?;

    let plaintext = zeroize::Zeroizing::new(vault.load_document(
        user,
        &DocumentId::new(document_id),
        &passphrase,
    )?);
    write_output(output.as_deref(), &plaintext)
}

fn cmd_list(config_path: &Path, user: &UserId) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let vault = DocumentVault::open(&config)?;

    for document in vault.list_documents(user)? {
        println!(
            "{}\tv{}\t{} bytes\t{}",
            document.document_id,
            document.key_version_id,
            document.payload.plaintext_len(),
            document.updated_at.to_rfc3339()
        );
    }
    Ok(())
}

fn cmd_rotate(
    config_path: &Path,
    user: &UserId,
    old_password_file: Option<PathBuf>,
    new_password_file: Option<PathBuf>,
) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let vault = DocumentVault::open(&config)?;

    let old = read_passphrase(old_password_file.as_deref(), "Current passphrase: ")?;
    let new = match new_password_file {
        Some(path) => read_passphrase(Some(path.as_path()), "")?,
        None => {
            let first = read_passphrase(None, "New passphrase: ")?;
            let second = read_passphrase(None, "Repeat new passphrase: ")?;
            if first.as_bytes() != second.as_bytes() {
                return Err(Error::MalformedInput("passphrases do not match".to_string()));
            }
            first
        }
    };

    let runtime = tokio::runtime::Runtime::new().map_err(|e| Error::Internal(e.to_string()))?;
    runtime.block_on(async {
        let handle = vault.start_rotation(user, old, new)?;

        let token = handle.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; cancelling rotation if it has not begun committing");
                token.cancel();
            }
        });

        let mut progress = handle.progress();
        tokio::spawn(async move {
            while progress.changed().await.is_ok() {
                let p = progress.borrow().clone();
                if p.state == RotationState::ReEncrypting {
                    info!("Re-encrypting: {}/{} ({} failed)", p.completed, p.total, p.failed);
                } else {
                    info!("Rotation {}", p.state);
                }
            }
        });

        let result = handle.wait().await?;
        if let RotationState::Failed(reason) = &result.state {
            error!("Rotation failed: {}", reason);
            if !result.saves_failed.is_empty() {
                error!("Queued saves not written: {:?}", result.saves_failed);
            }
        } else {
            println!(
                "Rotated to key version {} ({} re-encrypted, {} reused, {} restarts)",
                result.new_version.unwrap_or_default(),
                result.documents_reencrypted,
                result.documents_reused,
                result.restarts
            );
        }
        result.into_result().map(|_| ())
    })
}

fn cmd_gc(config_path: &Path, user: &UserId) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let vault = DocumentVault::open(&config)?;

    let purged = vault.collect_retired(user)?;
    if purged.is_empty() {
        println!("No retired key versions past the grace period");
    } else {
        println!("Purged key versions: {:?}", purged);
    }
    Ok(())
}

fn cmd_status(config_path: &Path, user: &UserId) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let vault = DocumentVault::open(&config)?;
    let status = vault.status(user)?;

    println!("zkdocs Status");
    println!("=============");
    println!();
    println!("Configuration: {:?}", config_path);
    println!("Data directory: {:?}", config.store.data_dir);
    println!("KDF iterations: {}", config.encryption.kdf_iterations);
    println!("Rotation workers: {}", config.rotation.workers);
    println!("User: {}", user);

    match &status.active_version {
        Some(version) => println!(
            "Active key version: {} (created {}, identity {})",
            version.version_id,
            version.created_at.to_rfc3339(),
            version.identity_hash
        ),
        None => println!("Active key version: none (created on first put)"),
    }
    for version in status.versions.iter().filter(|v| !v.is_active()) {
        if let Some(at) = version.retired_at() {
            println!("Retired key version: {} (retired {})", version.version_id, at.to_rfc3339());
        }
    }
    println!("Documents: {}", status.documents);
    if status.staged_documents > 0 {
        println!(
            "Staged from an unfinished rotation: {}",
            status.staged_documents
        );
    }

    Ok(())
}

fn read_passphrase(path: Option<&Path>, prompt: &str) -> Result<Passphrase> {
    let passphrase = match path {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| Error::Internal(format!("Failed to read password file: {}", e)))?
            .trim()
            .to_string(),
        None => rpassword::prompt_password(prompt).map_err(|e| Error::Internal(e.to_string()))?,
    };

    if passphrase.is_empty() {
        return Err(Error::MalformedInput("passphrase is empty".to_string()));
    }
    Ok(Passphrase::new(passphrase))
}

fn read_input(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(path) => Ok(std::fs::read(path)?),
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}

fn write_output(path: Option<&Path>, bytes: &[u8]) -> Result<()> {
    match path {
        Some(path) => std::fs::write(path, bytes)?,
        None => {
            let mut stdout = std::io::stdout();
            stdout.write_all(bytes)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
