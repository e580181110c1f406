use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub source: SourceConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Directory holding one `<conversation_id>.jsonl` export per conversation.
    pub root: PathBuf,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_tokens")]
    pub target_tokens: usize,
    /// Fraction of the token budget carried over between adjacent chunks.
    #[serde(default = "default_overlap_fraction")]
    pub overlap_fraction: f64,
    #[serde(default = "default_reply_context_tokens")]
    pub reply_context_tokens: usize,
    #[serde(default = "default_version")]
    pub chunking_version: u32,
    #[serde(default = "default_version")]
    pub preprocess_version: u32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_target_tokens(),
            overlap_fraction: default_overlap_fraction(),
            reply_context_tokens: default_reply_context_tokens(),
            chunking_version: default_version(),
            preprocess_version: default_version(),
        }
    }
}

fn default_target_tokens() -> usize {
    1000
}
fn default_overlap_fraction() -> f64 {
    0.15
}
fn default_reply_context_tokens() -> usize {
    120
}
fn default_version() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Base URL of the embedding API (an OpenAI-compatible `/v1/embeddings`).
    pub endpoint: String,
    pub model: String,
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_concurrency")]
    pub concurrency: usize,
    /// 0 disables the budget check.
    #[serde(default)]
    pub daily_budget_usd: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_batch_size() -> usize {
    64
}
fn default_embed_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Base URL of the search index's document API.
    pub endpoint: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_index_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_namespace() -> String {
    "default".to_string()
}
fn default_index_concurrency() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    #[serde(default = "default_worker_limit")]
    pub worker_limit: usize,
    /// 0 disables the periodic consistency sweep.
    #[serde(default = "default_sweep_interval_minutes")]
    pub sweep_interval_minutes: u64,
    /// How far back each sweep re-walks recently-active conversations.
    #[serde(default = "default_sweep_window_days")]
    pub sweep_window_days: u32,
    /// Deleted messages older than this are purged from the index. 0 disables.
    #[serde(default = "default_purge_retention_days")]
    pub purge_retention_days: u32,
    /// Minutes of history replayed on startup to cover a gap in the live feed.
    #[serde(default = "default_lookback_minutes")]
    pub lookback_minutes: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            worker_limit: default_worker_limit(),
            sweep_interval_minutes: default_sweep_interval_minutes(),
            sweep_window_days: default_sweep_window_days(),
            purge_retention_days: default_purge_retention_days(),
            lookback_minutes: default_lookback_minutes(),
        }
    }
}

fn default_worker_limit() -> usize {
    3
}
fn default_sweep_interval_minutes() -> u64 {
    60
}
fn default_sweep_window_days() -> u32 {
    7
}
fn default_purge_retention_days() -> u32 {
    30
}
fn default_lookback_minutes() -> u64 {
    5
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.target_tokens == 0 {
        anyhow::bail!("chunking.target_tokens must be > 0");
    }

    if !(0.0..1.0).contains(&config.chunking.overlap_fraction) {
        anyhow::bail!("chunking.overlap_fraction must be in [0.0, 1.0)");
    }

    if config.chunking.chunking_version == 0 || config.chunking.preprocess_version == 0 {
        anyhow::bail!("chunking version tags start at 1");
    }

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }

    if config.embedding.batch_size == 0 || config.embedding.concurrency == 0 {
        anyhow::bail!("embedding.batch_size and embedding.concurrency must be > 0");
    }

    if config.embedding.daily_budget_usd < 0.0 {
        anyhow::bail!("embedding.daily_budget_usd must be >= 0 (0 disables the budget)");
    }

    if config.index.concurrency == 0 {
        anyhow::bail!("index.concurrency must be > 0");
    }

    if config.daemon.worker_limit == 0 {
        anyhow::bail!("daemon.worker_limit must be > 0");
    }

    Ok(config)
}
