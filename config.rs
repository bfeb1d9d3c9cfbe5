//! Configuration management with environment variable support.
//!
//! [`Config`] is read from a JSON file, overlaid with environment variables
//! and validated before use.
//!
//! ## Environment Variables
//!
//! - `SVFS_DB_PATH`: Override the database file path
//! - `SVFS_ENCRYPTION`: Override the cipher for new writes
//! - `SVFS_COMPRESSION`: Override the compression algorithm
//! - `SVFS_COMPRESSION_LEVEL`: Override the compression level
//! - `SVFS_CONFIG`: Override config file path

use crate::compression::CompressionAlgorithm;
use crate::encryptor::CipherAlgorithm;
use crate::vfs::PipelineSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Environment variable names for configuration overrides
pub const ENV_DB_PATH: &str = "SVFS_DB_PATH";
pub const ENV_ENCRYPTION: &str = "SVFS_ENCRYPTION";
pub const ENV_COMPRESSION: &str = "SVFS_COMPRESSION";
pub const ENV_COMPRESSION_LEVEL: &str = "SVFS_COMPRESSION_LEVEL";
pub const ENV_CONFIG_PATH: &str = "SVFS_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: String,
    pub encryption_algorithm: CipherAlgorithm,
    pub compression_algorithm: CompressionAlgorithm,
    pub compression_level: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "./securevfs.db".to_string(),
            encryption_algorithm: CipherAlgorithm::Aes256Gcm,
            compression_algorithm: CompressionAlgorithm::Zlib,
            compression_level: 6,
        }
    }
}

impl Config {
    /// Load config from file path
    pub fn load(path: &str) -> Result<Self> {
        let s =
            fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
        let mut config: Config =
            serde_json::from_str(&s).with_context(|| format!("parsing config file {}", path))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load config with environment variable overrides
    /// Priority: ENV vars > config file > defaults
    pub fn load_with_env(path: Option<&str>) -> Result<Self> {
        let config_path = path
            .map(String::from)
            .or_else(|| env::var(ENV_CONFIG_PATH).ok());

        let mut config = match config_path {
            Some(ref p) if Path::new(p).exists() => {
                info!(path = p, "loading config from file");
                let s = fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p))?;
                serde_json::from_str(&s).with_context(|| format!("parsing config file {}", p))?
            }
            _ => {
                debug!("using default configuration");
                Config::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty JSON.
    pub fn save(&self, path: &str) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("writing config file {}", path))?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(db_path) = env::var(ENV_DB_PATH) {
            debug!(database_path = %db_path, "overriding database_path from environment");
            self.database_path = db_path;
        }

        if let Ok(cipher) = env::var(ENV_ENCRYPTION) {
            self.encryption_algorithm = cipher
                .parse()
                .with_context(|| format!("invalid {} value", ENV_ENCRYPTION))?;
            debug!(encryption = %self.encryption_algorithm, "overriding encryption from environment");
        }

        if let Ok(compression) = env::var(ENV_COMPRESSION) {
            self.compression_algorithm = compression
                .parse()
                .with_context(|| format!("invalid {} value", ENV_COMPRESSION))?;
            debug!(compression = %self.compression_algorithm, "overriding compression from environment");
        }

        if let Ok(level) = env::var(ENV_COMPRESSION_LEVEL) {
            self.compression_level = level
                .trim()
                .parse()
                .with_context(|| format!("invalid {} value '{}'", ENV_COMPRESSION_LEVEL, level))?;
            debug!(level = self.compression_level, "overriding compression level from environment");
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.database_path.trim().is_empty() {
            anyhow::bail!("database_path cannot be empty");
        }

        let max = self.compression_algorithm.max_level();
        if !(1..=max).contains(&self.compression_level) {
            anyhow::bail!(
                "compression_level {} out of range 1..={} for {}",
                self.compression_level,
                max,
                self.compression_algorithm
            );
        }

        if self.encryption_algorithm == CipherAlgorithm::Aes256Cbc {
            warn!("aes-256-cbc frames are not authenticated; prefer aes-256-gcm or chacha20-poly1305");
        }

        let effective = self.compression_algorithm.effective();
        if effective != self.compression_algorithm {
            warn!(
                configured = %self.compression_algorithm,
                effective = %effective,
                "compression algorithm not compiled in, falling back"
            );
        }

        Ok(())
    }

    pub fn new(database_path: impl Into<String>) -> Self {
        Self {
            database_path: database_path.into(),
            ..Self::default()
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            encryption: self.encryption_algorithm,
            compression: self.compression_algorithm,
            compression_level: self.compression_level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard};

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.pipeline_settings(), PipelineSettings::default());
    }

    #[test]
    fn out_of_range_level_is_rejected() {
        let mut config = Config::new("db.sqlite");
        config.compression_level = 0;
        assert!(config.validate().is_err());
        config.compression_level = 10;
        assert!(config.validate().is_err());
        config.compression_algorithm = CompressionAlgorithm::Zstd;
        config.validate().unwrap();
    }

    #[test]
    fn empty_database_path_is_rejected() {
        assert!(Config::new("  ").validate().is_err());
    }

    /// Serializes tests that read or write process environment variables.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_guard() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_config(dir: &tempfile::TempDir, json: &str) -> String {
        let path = dir.path().join("config.json");
        std::fs::write(&path, json).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn load_fills_missing_fields_and_saves_back() {
        let _env = env_guard();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"{ "database_path": "x.db", "encryption_algorithm": "chacha20-poly1305" }"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.database_path, "x.db");
        assert_eq!(config.encryption_algorithm, CipherAlgorithm::ChaCha20Poly1305);
        assert_eq!(config.compression_algorithm, CompressionAlgorithm::Zlib);
        assert_eq!(config.compression_level, 6);

        let saved = dir.path().join("saved.json");
        let saved = saved.to_str().unwrap();
        config.save(saved).unwrap();
        assert_eq!(Config::load(saved).unwrap(), config);
    }

    #[test]
    fn load_validates_file_contents() {
        let _env = env_guard();
        let dir = tempfile::tempdir().unwrap();

        let path = write_config(&dir, r#"{ "compression_level": 12 }"#);
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("compression_level 12"), "{err:#}");
        assert!(Config::load_with_env(Some(path.as_str())).is_err());

        let path = write_config(&dir, r#"{ "database_path": "" }"#);
        assert!(Config::load(&path).is_err());

        let path = write_config(&dir, "not json");
        assert!(Config::load(&path).is_err());
        assert!(Config::load(dir.path().join("absent.json").to_str().unwrap()).is_err());
    }

    #[test]
    fn load_with_env_falls_back_to_defaults() {
        let _env = env_guard();
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        let config = Config::load_with_env(Some(missing.to_str().unwrap())).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn environment_overrides_file_values() {
        let _env = env_guard();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, r#"{ "database_path": "file.db", "compression_level": 3 }"#);

        env::set_var(ENV_DB_PATH, "env.db");
        env::set_var(ENV_COMPRESSION, "zstd");
        env::set_var(ENV_COMPRESSION_LEVEL, "15");
        let overridden = Config::load_with_env(Some(path.as_str()));

        env::set_var(ENV_COMPRESSION, "zlib");
        let out_of_range = Config::load(&path);

        env::set_var(ENV_COMPRESSION_LEVEL, "fast");
        let unparsable = Config::load(&path);

        for var in [ENV_DB_PATH, ENV_COMPRESSION, ENV_COMPRESSION_LEVEL] {
            env::remove_var(var);
        }

        let config = overridden.unwrap();
        assert_eq!(config.database_path, "env.db");
        assert_eq!(config.compression_algorithm, CompressionAlgorithm::Zstd);
        assert_eq!(config.compression_level, 15);
        assert!(out_of_range.is_err());
        assert!(unparsable.is_err());

        assert_eq!(Config::load(&path).unwrap().database_path, "file.db");
    }
}
