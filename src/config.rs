//! Layered configuration: compiled defaults, then a TOML file, then
//! `HYBRID_RAG_*` environment variables.

#![allow(clippy::result_large_err)] // figment::Error is external

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::structured::FilterDialect;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "hybrid-rag.toml";

const ENV_PREFIX: &str = "HYBRID_RAG_";

const SECTIONS: &[&str] = &[
    "database",
    "llm",
    "embedding",
    "odata",
    "schema",
    "ingest",
    "memory",
    "retrieval",
    "maintenance",
    "logging",
];

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub odata: ODataConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "hybrid-rag.db".to_string()
}

/// Chat-completion provider settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    /// One of `openai`, `claude`, `ollama`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_llm_base_url(),
            api_key: String::new(),
            chat_model: default_chat_model(),
            temperature: None,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o".to_string()
}

/// Embedding endpoint settings. Unset URL and key fall back to `[llm]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            model: default_embedding_model(),
            dimensions: default_dimensions(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-ada-002".to_string()
}

fn default_dimensions() -> usize {
    1536
}

/// Structured source. Without a base URL every question goes to retrieval.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ODataConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Accept self-signed certificates on the structured source.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub dialect: FilterDialect,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for ODataConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            username: None,
            password: None,
            accept_invalid_certs: false,
            dialect: FilterDialect::default(),
            page_size: default_page_size(),
        }
    }
}

fn default_page_size() -> usize {
    20
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaConfig {
    /// Schema cache lifetime; unset keeps entries until invalidated.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_batch_size")]
    pub embedding_batch_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            embedding_batch_size: default_batch_size(),
        }
    }
}

fn default_chunk_size() -> usize {
    1500
}

fn default_chunk_overlap() -> usize {
    150
}

fn default_batch_size() -> usize {
    20
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    /// Token budget for prior turns included in prompts.
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    /// Model used for conversation titles; defaults to the chat model.
    #[serde(default)]
    pub title_model: Option<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            title_model: None,
        }
    }
}

fn default_token_budget() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Run the per-chunk citation check after each retrieval answer.
    #[serde(default = "default_true")]
    pub attribution: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            attribution: true,
        }
    }
}

fn default_top_k() -> usize {
    5
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MaintenanceConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Load `path` (or `hybrid-rag.toml` in the working directory) over the
/// defaults, apply environment overrides, and validate.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    let config: AppConfig = Figment::new()
        .merge(Serialized::defaults(AppConfig::default()))
        .merge(Toml::file(file))
        .merge(env_provider())
        .extract()
        .map_err(Box::new)?;
    validate(&config)?;
    Ok(config)
}

/// Load from a TOML string over the defaults; no environment lookup.
pub fn load_config_from_str(toml_content: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = Figment::new()
        .merge(Serialized::defaults(AppConfig::default()))
        .merge(Toml::string(toml_content))
        .extract()
        .map_err(Box::new)?;
    validate(&config)?;
    Ok(config)
}

fn env_provider() -> Env {
    Env::prefixed(ENV_PREFIX).map(|key| section_key(key.as_str()).into())
}

/// `llm_api_key` becomes `llm.api_key`: only the section prefix turns into a
/// dot, underscores inside key names survive.
fn section_key(key: &str) -> String {
    SECTIONS
        .iter()
        .find_map(|section| {
            key.strip_prefix(section)
                .and_then(|rest| rest.strip_prefix('_'))
                .map(|rest| format!("{section}.{rest}"))
        })
        .unwrap_or_else(|| key.to_string())
}

pub fn validate(config: &AppConfig) -> Result<(), ConfigError> {
    let ingest = &config.ingest;
    if ingest.chunk_size == 0 {
        return Err(ConfigError::Invalid("ingest.chunk_size must be positive".into()));
    }
    if ingest.chunk_overlap >= ingest.chunk_size {
        return Err(ConfigError::Invalid(format!(
            "ingest.chunk_overlap ({}) must be smaller than ingest.chunk_size ({})",
            ingest.chunk_overlap, ingest.chunk_size
        )));
    }
    if ingest.embedding_batch_size == 0 {
        return Err(ConfigError::Invalid(
            "ingest.embedding_batch_size must be positive".into(),
        ));
    }
    if config.embedding.dimensions == 0 {
        return Err(ConfigError::Invalid("embedding.dimensions must be positive".into()));
    }
    if config.retrieval.top_k == 0 {
        return Err(ConfigError::Invalid("retrieval.top_k must be positive".into()));
    }
    if config.odata.page_size == 0 {
        return Err(ConfigError::Invalid("odata.page_size must be positive".into()));
    }
    if config.maintenance.sweep_interval_secs == 0 {
        return Err(ConfigError::Invalid(
            "maintenance.sweep_interval_secs must be positive".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = AppConfig::default();
        validate(&config).unwrap();
        assert_eq!(config.ingest.chunk_size, 1500);
        assert_eq!(config.ingest.chunk_overlap, 150);
        assert_eq!(config.retrieval.top_k, 5);
        assert!(config.retrieval.attribution);
        assert_eq!(config.odata.dialect, FilterDialect::V4);
        assert_eq!(config.maintenance.sweep_interval_secs, 3600);
    }

    #[test]
    fn toml_overrides_defaults() {
        let config = load_config_from_str(
            r#"
[llm]
provider = "claude"
chat_model = "claude-sonnet-4-20250514"

[odata]
base_url = "https://erp.example.com/sap/opu/odata/sap/API_EQUIPMENT"
dialect = "v2"
accept_invalid_certs = true

[memory]
token_budget = 400
"#,
        )
        .unwrap();
        assert_eq!(config.llm.provider, "claude");
        assert_eq!(config.odata.dialect, FilterDialect::V2);
        assert!(config.odata.accept_invalid_certs);
        assert_eq!(config.memory.token_budget, 400);
        assert_eq!(config.embedding.dimensions, 1536);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = load_config_from_str("[retrieval]\ntopk = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        let err = load_config_from_str("[ingest]\nchunk_size = 100\nchunk_overlap = 100\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn sweep_interval_is_configurable_but_not_zero() {
        let config = load_config_from_str("[maintenance]\nsweep_interval_secs = 600\n").unwrap();
        assert_eq!(config.maintenance.sweep_interval_secs, 600);

        let err = load_config_from_str("[maintenance]\nsweep_interval_secs = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn env_keys_map_to_sections() {
        assert_eq!(section_key("llm_api_key"), "llm.api_key");
        assert_eq!(section_key("retrieval_top_k"), "retrieval.top_k");
        assert_eq!(section_key("odata_accept_invalid_certs"), "odata.accept_invalid_certs");
        assert_eq!(section_key("unrelated"), "unrelated");
    }
}
