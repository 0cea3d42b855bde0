use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub vault: VaultConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    pub chroma: ChromaConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.pdf".to_string(),
    ]
}

impl VaultConfig {
    /// Configured excludes behind the built-in ones.
    pub fn effective_excludes(&self) -> Vec<String> {
        let mut excludes = vec![
            ".obsidian/**".to_string(),
            ".trash/**".to_string(),
            "**/.git/**".to_string(),
        ];
        excludes.extend(self.exclude_globs.clone());
        excludes
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    #[serde(default = "default_target_len")]
    pub target_len: usize,
    #[serde(default = "default_overlap_len")]
    pub overlap_len: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_len: default_max_len(),
            target_len: default_target_len(),
            overlap_len: default_overlap_len(),
        }
    }
}

fn default_max_len() -> usize {
    16_000
}
fn default_target_len() -> usize {
    12_000
}
fn default_overlap_len() -> usize {
    400
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: f64,
    #[serde(default = "default_inter_batch_delay_ms")]
    pub inter_batch_delay_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_verification_max_age_hours")]
    pub verification_max_age_hours: u64,
    #[serde(default = "default_true")]
    pub verify_after_sync: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            success_threshold: default_success_threshold(),
            inter_batch_delay_ms: default_inter_batch_delay_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            verification_max_age_hours: default_verification_max_age_hours(),
            verify_after_sync: true,
        }
    }
}

impl SyncConfig {
    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn verification_max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.verification_max_age_hours as i64)
    }
}

fn default_batch_size() -> usize {
    50
}
fn default_max_retries() -> u32 {
    3
}
fn default_success_threshold() -> f64 {
    0.8
}
fn default_inter_batch_delay_ms() -> u64 {
    100
}
fn default_stop_grace_ms() -> u64 {
    1000
}
fn default_verification_max_age_hours() -> u64 {
    24
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChromaConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_token_header")]
    pub token_header: String,
    /// Inline credential; prefer `token_env`.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    #[serde(default = "default_database")]
    pub database: String,
    pub collection: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_chroma_retries")]
    pub max_retries: u32,
}

impl ChromaConfig {
    /// Resolve the credential: inline token first, then the environment.
    pub fn resolve_token(&self) -> Option<String> {
        self.token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| std::env::var(&self.token_env).ok())
            .filter(|t| !t.is_empty())
    }
}

fn default_endpoint() -> String {
    "https://api.trychroma.com".to_string()
}
fn default_token_header() -> String {
    "x-chroma-token".to_string()
}
fn default_token_env() -> String {
    "CHROMA_API_KEY".to_string()
}
fn default_tenant() -> String {
    "default_tenant".to_string()
}
fn default_database() -> String {
    "default_database".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_chroma_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Embeddings endpoint; OpenAI's when unset.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_embedding_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    /// True when vectors are computed locally instead of by the collection.
    pub fn is_client_side(&self) -> bool {
        self.provider != "server"
    }
}

fn default_provider() -> String {
    "server".to_string()
}
fn default_embedding_retries() -> u32 {
    5
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.max_len == 0 {
        anyhow::bail!("chunking.max_len must be > 0");
    }
    if config.chunking.target_len == 0 || config.chunking.target_len > config.chunking.max_len {
        anyhow::bail!("chunking.target_len must be in (0, max_len]");
    }
    if config.chunking.overlap_len >= config.chunking.max_len {
        anyhow::bail!("chunking.overlap_len must be < max_len");
    }

    // Validate sync
    if config.sync.batch_size == 0 {
        anyhow::bail!("sync.batch_size must be > 0");
    }
    if !(config.sync.success_threshold > 0.0 && config.sync.success_threshold <= 1.0) {
        anyhow::bail!("sync.success_threshold must be in (0.0, 1.0]");
    }

    // Validate chroma
    if config.chroma.collection.trim().is_empty() {
        anyhow::bail!("chroma.collection must not be empty");
    }
    if !config.chroma.endpoint.starts_with("http://")
        && !config.chroma.endpoint.starts_with("https://")
    {
        anyhow::bail!(
            "chroma.endpoint must be an http(s) URL, got '{}'",
            config.chroma.endpoint
        );
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "server" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                anyhow::bail!("embedding.model must be specified when provider is 'openai'");
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!("embedding.dims must be > 0 when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be server or openai.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[vault]
root = "/tmp/vault"

[chroma]
collection = "notes"
"#;

    #[test]
    fn minimal_config_fills_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.chunking, ChunkingConfig::default());
        assert_eq!(config.sync.batch_size, 50);
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.chroma.tenant, "default_tenant");
        assert_eq!(config.vault.include_globs.len(), 3);
        assert!(!config.embedding.is_client_side());
        assert!(config
            .vault
            .effective_excludes()
            .contains(&".obsidian/**".to_string()));
    }

    #[test]
    fn rejects_target_above_max() {
        let text = format!("{}\n[chunking]\nmax_len = 100\ntarget_len = 200\n", MINIMAL);
        let err = parse_config(&text).unwrap_err();
        assert!(err.to_string().contains("target_len"));
    }

    #[test]
    fn rejects_zero_batch_size() {
        let text = format!("{}\n[sync]\nbatch_size = 0\n", MINIMAL);
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn openai_provider_requires_model() {
        let text = format!("{}\n[embedding]\nprovider = \"openai\"\n", MINIMAL);
        let err = parse_config(&text).unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }

    #[test]
    fn inline_token_wins_over_env() {
        let text = MINIMAL.replace(
            "collection = \"notes\"",
            "collection = \"notes\"\ntoken = \"abc\"\ntoken_env = \"VSYNC_TEST_UNSET_TOKEN\"",
        );
        let config = parse_config(&text).unwrap();
        assert_eq!(config.chroma.resolve_token().as_deref(), Some("abc"));
    }
}
