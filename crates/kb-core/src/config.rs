//! Configuration loading and validation.
//!
//! Configuration is resolved with the following precedence (highest wins):
//!
//! 1. Environment variables (`KB_*`)
//! 2. User config (`~/.config/localkb/config.toml`)
//! 3. Compiled-in defaults
//!
//! Bad types and out-of-range values fail fast at load time, never
//! mid-operation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KbError, KbResult};

/// Top-level configuration for LocalKB.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for all persistent data (store, model cache).
    pub data_root: PathBuf,

    /// Vector store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Embedding configuration.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Ingestion configuration.
    #[serde(default)]
    pub ingestion: IngestionConfig,

    /// Chunker configuration.
    #[serde(default)]
    pub chunker: ChunkerConfig,

    /// Search configuration.
    #[serde(default)]
    pub search: SearchConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Vector store settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the table database. Defaults to `<data_root>/store`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Embedding model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model identifier (see `embedder::model_manager` for known models).
    #[serde(default = "EmbeddingConfig::default_model")]
    pub model: String,

    /// Model download cache. Defaults to `<data_root>/models`.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,

    /// Output embedding dimensions.
    #[serde(default = "EmbeddingConfig::default_dimensions")]
    pub dimensions: usize,

    /// Batch size for embedding inference.
    #[serde(default = "EmbeddingConfig::default_batch_size")]
    pub batch_size: usize,

    /// Maximum sequence length for the tokenizer.
    #[serde(default = "EmbeddingConfig::default_max_seq_length")]
    pub max_seq_length: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: Self::default_model(),
            cache_path: None,
            dimensions: Self::default_dimensions(),
            batch_size: Self::default_batch_size(),
            max_seq_length: Self::default_max_seq_length(),
        }
    }
}

impl EmbeddingConfig {
    fn default_model() -> String {
        "all-MiniLM-L6-v2".into()
    }
    fn default_dimensions() -> usize {
        384
    }
    fn default_batch_size() -> usize {
        32
    }
    fn default_max_seq_length() -> usize {
        256
    }
}

/// Ingestion pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Files per processing batch.
    #[serde(default = "IngestionConfig::default_batch_size")]
    pub batch_size: usize,

    /// Scan-time file size cap in bytes. Larger files are skipped.
    #[serde(default = "IngestionConfig::default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// Per-file conversion deadline in milliseconds.
    #[serde(default = "IngestionConfig::default_converter_timeout_ms")]
    pub converter_timeout_ms: u64,

    /// Maximum in-flight converter calls per ingestion.
    #[serde(default = "IngestionConfig::default_max_concurrent_converts")]
    pub max_concurrent_converts: usize,

    /// Whether the scanner follows symbolic links.
    #[serde(default)]
    pub follow_symlinks: bool,

    /// External converter invocation for binary formats: the program
    /// and leading arguments; the file path is appended. When unset,
    /// binary formats fail per-file and ingestion continues.
    #[serde(default)]
    pub converter_command: Option<Vec<String>>,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            batch_size: Self::default_batch_size(),
            max_file_bytes: Self::default_max_file_bytes(),
            converter_timeout_ms: Self::default_converter_timeout_ms(),
            max_concurrent_converts: Self::default_max_concurrent_converts(),
            follow_symlinks: false,
            converter_command: None,
        }
    }
}

impl IngestionConfig {
    fn default_batch_size() -> usize {
        100
    }
    fn default_max_file_bytes() -> u64 {
        10 * 1024 * 1024 // 10MB
    }
    fn default_converter_timeout_ms() -> u64 {
        30_000
    }
    fn default_max_concurrent_converts() -> usize {
        4
    }
}

/// Chunker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Target chunk size in characters (~500 tokens).
    #[serde(default = "ChunkerConfig::default_max_chars")]
    pub max_chars: usize,

    /// Characters of overlap seeded between consecutive recursive chunks.
    #[serde(default = "ChunkerConfig::default_overlap_chars")]
    pub overlap_chars: usize,

    /// Token ceiling used for estimation.
    #[serde(default = "ChunkerConfig::default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chars: Self::default_max_chars(),
            overlap_chars: Self::default_overlap_chars(),
            max_tokens: Self::default_max_tokens(),
        }
    }
}

impl ChunkerConfig {
    fn default_max_chars() -> usize {
        2000
    }
    fn default_overlap_chars() -> usize {
        400
    }
    fn default_max_tokens() -> usize {
        512
    }
}

/// Search settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Default `max_results` when the caller does not set one.
    #[serde(default = "SearchConfig::default_max_results")]
    pub default_max_results: usize,

    /// Search-cache entry lifetime in milliseconds. Zero disables caching.
    #[serde(default = "SearchConfig::default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    /// URL of the management UI, reported by `open_knowledgebase_manager`.
    #[serde(default = "SearchConfig::default_manager_url")]
    pub manager_url: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_max_results: Self::default_max_results(),
            cache_ttl_ms: Self::default_cache_ttl_ms(),
            manager_url: Self::default_manager_url(),
        }
    }
}

impl SearchConfig {
    fn default_max_results() -> usize {
        50
    }
    fn default_cache_ttl_ms() -> u64 {
        60_000
    }
    fn default_manager_url() -> String {
        "http://127.0.0.1:7777".into()
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "trace").
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Whether to output logs as JSON.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".into()
    }
}

impl Config {
    /// Load configuration: defaults, then the user config file, then
    /// environment overrides. Validates before returning.
    pub fn load() -> KbResult<Self> {
        let mut config = Self::defaults();

        if let Some(user_config_dir) = dirs::config_dir() {
            let user_config_path = user_config_dir.join("localkb").join("config.toml");
            if user_config_path.exists() {
                config.merge_from_file(&user_config_path)?;
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Create the compiled-in default configuration.
    pub fn defaults() -> Self {
        let data_root = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("localkb");
        Self::defaults_at(&data_root)
    }

    /// Create a default configuration rooted at an explicit data directory
    /// (used by tests to avoid touching the real user directories).
    pub fn defaults_at(data_root: &Path) -> Self {
        Self {
            data_root: data_root.to_path_buf(),
            store: StoreConfig::default(),
            embedding: EmbeddingConfig::default(),
            ingestion: IngestionConfig::default(),
            chunker: ChunkerConfig::default(),
            search: SearchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Directory for vector store tables.
    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.data_root.join("store"))
    }

    /// Directory for the embedding model cache.
    pub fn model_cache_path(&self) -> PathBuf {
        self.embedding
            .cache_path
            .clone()
            .unwrap_or_else(|| self.data_root.join("models"))
    }

    /// Merge values from a TOML config file (non-destructive overlay).
    fn merge_from_file(&mut self, path: &Path) -> KbResult<()> {
        let content = std::fs::read_to_string(path)?;
        let overlay: toml::Value = toml::from_str(&content).map_err(|e| KbError::Config {
            details: format!("invalid TOML in {}: {e}", path.display()),
        })?;

        if let Some(data_root) = overlay.get("data_root").and_then(|v| v.as_str()) {
            self.data_root = PathBuf::from(data_root);
        }
        self.merge_section(&overlay, "store", |c, v| c.store = v)?;
        self.merge_section(&overlay, "embedding", |c, v| c.embedding = v)?;
        self.merge_section(&overlay, "ingestion", |c, v| c.ingestion = v)?;
        self.merge_section(&overlay, "chunker", |c, v| c.chunker = v)?;
        self.merge_section(&overlay, "search", |c, v| c.search = v)?;
        self.merge_section(&overlay, "logging", |c, v| c.logging = v)?;

        Ok(())
    }

    fn merge_section<T: serde::de::DeserializeOwned>(
        &mut self,
        overlay: &toml::Value,
        key: &str,
        apply: impl FnOnce(&mut Self, T),
    ) -> KbResult<()> {
        if let Some(section) = overlay.get(key) {
            let parsed = section
                .clone()
                .try_into::<T>()
                .map_err(|e| KbError::Config {
                    details: format!("invalid [{key}] section: {e}"),
                })?;
            apply(self, parsed);
        }
        Ok(())
    }

    /// Apply environment variable overrides (KB_* prefix).
    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("KB_DATA_ROOT") {
            self.data_root = PathBuf::from(root);
        }
        if let Ok(level) = std::env::var("KB_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(model) = std::env::var("KB_EMBEDDING_MODEL") {
            self.embedding.model = model;
        }
    }

    /// Reject configurations that cannot work before any operation runs.
    pub fn validate(&self) -> KbResult<()> {
        if self.ingestion.batch_size == 0 {
            return Err(KbError::Config {
                details: "ingestion.batch_size must be at least 1".into(),
            });
        }
        if self.ingestion.max_concurrent_converts == 0 {
            return Err(KbError::Config {
                details: "ingestion.max_concurrent_converts must be at least 1".into(),
            });
        }
        if self.chunker.max_chars == 0 {
            return Err(KbError::Config {
                details: "chunker.max_chars must be at least 1".into(),
            });
        }
        if self.chunker.overlap_chars >= self.chunker.max_chars {
            return Err(KbError::Config {
                details: format!(
                    "chunker.overlap_chars ({}) must be smaller than chunker.max_chars ({})",
                    self.chunker.overlap_chars, self.chunker.max_chars
                ),
            });
        }
        if self.embedding.dimensions == 0 {
            return Err(KbError::Config {
                details: "embedding.dimensions must be at least 1".into(),
            });
        }
        if self.search.default_max_results == 0 || self.search.default_max_results > 200 {
            return Err(KbError::Config {
                details: "search.default_max_results must be within 1..=200".into(),
            });
        }
        Ok(())
    }
}
