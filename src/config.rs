//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to the defaults
//! below. [`load_config`] validates the parsed values before returning.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl Config {
    /// A configuration with every section at its default, pointing at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            rate_limit: RateLimitConfig::default(),
            sync: SyncConfig::default(),
            worker: WorkerConfig::default(),
            remote: RemoteConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Window length in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Characters shared between consecutive windows.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1500
}
fn default_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL override (Ollama host, or an OpenAI-compatible endpoint).
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    50
}
fn default_batch_delay_ms() -> u64 {
    100
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    /// Requests kept in reserve; below this the tracker waits for reset.
    #[serde(default = "default_safety_buffer")]
    pub safety_buffer: i64,
    /// Extra wait added after the reported reset time.
    #[serde(default = "default_reset_buffer_ms")]
    pub reset_buffer_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            safety_buffer: default_safety_buffer(),
            reset_buffer_ms: default_reset_buffer_ms(),
        }
    }
}

fn default_safety_buffer() -> i64 {
    100
}
fn default_reset_buffer_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Largest file (bytes) whose content is fetched; bigger files are metadata-only.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_metadata_only_globs")]
    pub metadata_only_globs: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            metadata_only_globs: default_metadata_only_globs(),
        }
    }
}

fn default_max_file_size() -> u64 {
    50 * 1024
}

fn default_include_globs() -> Vec<String> {
    [
        "rs", "go", "py", "js", "jsx", "ts", "tsx", "java", "kt", "scala", "rb", "php", "c", "h",
        "cc", "cpp", "hpp", "cs", "swift", "m", "sh", "sql", "md", "txt", "rst", "toml", "yaml",
        "yml", "json", "html", "css", "scss", "vue", "svelte", "lua", "ex", "exs", "hs", "ml",
        "dart", "proto", "graphql",
    ]
    .iter()
    .map(|ext| format!("**/*.{}", ext))
    .chain(
        ["**/Dockerfile", "**/Makefile", "**/README", "**/LICENSE"]
            .iter()
            .map(|s| s.to_string()),
    )
    .collect()
}

fn default_metadata_only_globs() -> Vec<String> {
    vec![
        "**/*.min.js".to_string(),
        "**/*.min.css".to_string(),
        "**/*.map".to_string(),
        "**/package-lock.json".to_string(),
        "**/yarn.lock".to_string(),
        "**/Cargo.lock".to_string(),
        "**/*.pb.go".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Enqueue an embed job after every successful sync.
    #[serde(default = "default_auto_embed")]
    pub auto_embed: bool,
    /// Identity recorded on claimed jobs; must be unique per running
    /// process. A worker restarted under the same id fails its own
    /// unfinished jobs at once, otherwise they wait for the lease to lapse.
    /// A random id is used when unset.
    #[serde(default)]
    pub id: Option<String>,
    /// Seconds without a heartbeat after which an active job is orphaned.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            auto_embed: default_auto_embed(),
            id: None,
            lease_secs: default_lease_secs(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    5000
}
fn default_auto_embed() -> bool {
    true
}
fn default_lease_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Env var holding the token for the `default` credential.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Credential id -> env var holding that credential's token.
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token_env: default_token_env(),
            credentials: HashMap::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}
fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NotifyConfig {
    /// Chat webhook receiving job-completed and job-failed messages.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.chunk_size {
        anyhow::bail!(
            "chunking.overlap ({}) must be smaller than chunking.chunk_size ({})",
            config.chunking.overlap,
            config.chunking.chunk_size
        );
    }

    // Embedding
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    if config.worker.poll_interval_ms == 0 {
        anyhow::bail!("worker.poll_interval_ms must be > 0");
    }
    if config.worker.lease_secs == 0 {
        anyhow::bail!("worker.lease_secs must be > 0");
    }
    if config.worker.id.as_deref().is_some_and(|id| id.trim().is_empty()) {
        anyhow::bail!("worker.id must not be empty");
    }
    if config.rate_limit.safety_buffer < 0 {
        anyhow::bail!("rate_limit.safety_buffer must be >= 0");
    }

    Ok(())
}
