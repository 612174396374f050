//! Configuration: base directory resolution and server/context settings.

use kronk_api::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Address the web API binds to when nothing else is configured.
pub const DEFAULT_API_HOST: &str = "localhost:3000";

/// Env var overriding the libraries directory.
pub const ENV_LIB_PATH: &str = "KRONK_LIB_PATH";

/// Env var overriding the models directory.
pub const ENV_MODELS: &str = "KRONK_MODELS";

/// Env var overriding the web API host.
pub const ENV_API_HOST: &str = "KRONK_WEB_API_HOST";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-model execution context settings
    #[serde(default)]
    pub context: ContextConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host:port to bind to
    #[serde(default = "default_api_host")]
    pub api_host: String,

    /// Concurrent execution slots per model
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

/// Context parameters applied to every execution context of a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Context window in tokens (0 = model training window)
    #[serde(default)]
    pub context_window: u32,

    /// Batch size for prompt decoding
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Number of sequences
    #[serde(default = "default_seq_count")]
    pub seq_count: u32,

    /// Enable flash attention when the backend supports it
    #[serde(default)]
    pub flash_attention: bool,

    /// Worker threads for generation (0 = runtime default)
    #[serde(default)]
    pub threads: i32,

    /// Worker threads for batch decoding (0 = runtime default)
    #[serde(default)]
    pub threads_batch: i32,
}

fn default_api_host() -> String {
    std::env::var(ENV_API_HOST).unwrap_or_else(|_| DEFAULT_API_HOST.to_string())
}

fn default_concurrency() -> usize {
    1
}

fn default_batch_size() -> u32 {
    2048
}

fn default_seq_count() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            context: ContextConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_host: default_api_host(),
            concurrency: default_concurrency(),
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_window: 0,
            batch_size: default_batch_size(),
            seq_count: default_seq_count(),
            flash_attention: false,
            threads: 0,
            threads_batch: 0,
        }
    }
}

impl Config {
    /// Get the base directory: $HOME/kronk
    pub fn base_dir() -> PathBuf {
        match std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .map(PathBuf::from)
        {
            Ok(home) => home.join("kronk"),
            Err(_) => PathBuf::from("./kronk"),
        }
    }

    /// Get the libraries directory, honoring KRONK_LIB_PATH.
    pub fn libs_dir() -> PathBuf {
        if let Ok(v) = std::env::var(ENV_LIB_PATH) {
            if !v.is_empty() {
                return PathBuf::from(v);
            }
        }
        Self::base_dir().join("libraries")
    }

    /// Get the models directory, honoring KRONK_MODELS.
    pub fn models_dir() -> PathBuf {
        if let Ok(v) = std::env::var(ENV_MODELS) {
            if !v.is_empty() {
                return PathBuf::from(v);
            }
        }
        Self::base_dir().join("models")
    }

    /// Load config from the default location, falling back to defaults.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)
                .map_err(|e| Error::invalid(format!("config file: {e}")))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save config to the default location.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| Error::internal(e.to_string()))?;
        fs::write(&config_path, content)?;
        Ok(())
    }

    /// Get the config file path: $HOME/kronk/config.toml
    pub fn config_path() -> PathBuf {
        Self::base_dir().join("config.toml")
    }
}
