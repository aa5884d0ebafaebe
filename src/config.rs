//! Configuration management for zkdocs

use crate::crypto::{DEFAULT_IDENTITY_SALT, MIN_KDF_ITERATIONS};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of re-encryption workers
pub const DEFAULT_ROTATION_WORKERS: usize = 4;

/// Default commit timeout (ms)
pub const DEFAULT_COMMIT_TIMEOUT_MS: u64 = 10_000;

/// Default grace period before retired key versions are purged: 7 days
pub const DEFAULT_RETIRED_GRACE_SECS: u64 = 7 * 24 * 60 * 60;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Encryption configuration
    pub encryption: EncryptionConfig,

    /// Key rotation configuration
    #[serde(default)]
    pub rotation: RotationConfig,

    /// Document store configuration
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// PBKDF2 iterations for newly derived keys
    pub kdf_iterations: u32,

    /// Application-wide salt for identity hashes
    #[serde(default = "default_identity_salt")]
    pub identity_salt: String,
}

/// Key rotation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Maximum documents re-encrypted concurrently
    pub workers: usize,

    /// Timeout for a single commit call (ms)
    pub commit_timeout_ms: u64,

    /// Retry attempts for transient commit failures
    pub retry_attempts: u32,

    /// Base delay for exponential backoff (ms)
    pub retry_base_delay_ms: u64,

    /// Restarts allowed after the store reports a conflicting writer
    pub max_conflict_restarts: u32,

    /// Seconds a retired key version is kept before it may be purged
    pub retired_grace_secs: u64,
}

/// Document store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the data directory
    pub data_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

fn default_identity_salt() -> String {
    DEFAULT_IDENTITY_SALT.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            encryption: EncryptionConfig::default(),
            rotation: RotationConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            kdf_iterations: MIN_KDF_ITERATIONS,
            identity_salt: default_identity_salt(),
        }
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        RotationConfig {
            workers: DEFAULT_ROTATION_WORKERS,
            commit_timeout_ms: DEFAULT_COMMIT_TIMEOUT_MS,
            retry_attempts: 3,
            retry_base_delay_ms: 500,
            max_conflict_restarts: 3,
            retired_grace_secs: DEFAULT_RETIRED_GRACE_SECS,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("zkdocs");

        StoreConfig { data_dir }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

impl RotationConfig {
    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn retired_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retired_grace_secs.min(i64::MAX as u64) as i64)
    }
}

impl StoreConfig {
    /// Path of the sled database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("documents.db")
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }

        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(iterations) = std::env::var("ZKDOCS_KDF_ITERATIONS") {
            if let Ok(n) = iterations.trim().parse::<u32>() {
                self.encryption.kdf_iterations = n;
            }
        }

        if let Ok(workers) = std::env::var("ZKDOCS_ROTATION_WORKERS") {
            if let Ok(n) = workers.trim().parse::<usize>() {
                self.rotation.workers = n;
            }
        }

        if let Ok(dir) = std::env::var("ZKDOCS_DATA_DIR") {
            let dir = dir.trim();
            if !dir.is_empty() {
                self.store.data_dir = PathBuf::from(dir);
            }
        }

        if let Ok(level) = std::env::var("ZKDOCS_LOG_LEVEL") {
            let level = level.trim().to_string();
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.encryption.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(Error::InvalidConfig(format!(
                "KDF iterations must be at least {} (got {})",
                MIN_KDF_ITERATIONS, self.encryption.kdf_iterations
            )));
        }

        if self.encryption.identity_salt.is_empty() {
            return Err(Error::InvalidConfig(
                "Identity salt cannot be empty".to_string(),
            ));
        }

        if self.rotation.workers == 0 {
            return Err(Error::InvalidConfig(
                "Rotation workers must be greater than 0".to_string(),
            ));
        }

        if self.rotation.commit_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "Commit timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.store.data_dir)?;
        Ok(())
    }
}
