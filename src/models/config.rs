//! Application configuration structures.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Retry, backoff and worker pool settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Shared HTTP client settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Content extraction client
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Summarization client
    #[serde(default)]
    pub summarization: SummarizationConfig,

    /// Record store backend
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.engine.retry_budget == 0 {
            return Err(AppError::validation("engine.retry_budget must be > 0"));
        }
        if self.engine.worker_concurrency == 0 {
            return Err(AppError::validation("engine.worker_concurrency must be > 0"));
        }
        if self.engine.backoff_cap_ms < self.engine.backoff_base_ms {
            return Err(AppError::validation(
                "engine.backoff_cap_ms must be >= engine.backoff_base_ms",
            ));
        }
        if self.http.user_agent.trim().is_empty() {
            return Err(AppError::validation("http.user_agent is empty"));
        }
        if self.extraction.timeout_ms == 0 {
            return Err(AppError::validation("extraction.timeout_ms must be > 0"));
        }
        if self.summarization.timeout_ms == 0 {
            return Err(AppError::validation("summarization.timeout_ms must be > 0"));
        }
        if self.summarization.max_summary_chars == 0 {
            return Err(AppError::validation(
                "summarization.max_summary_chars must be > 0",
            ));
        }
        if self.summarization.model.trim().is_empty() {
            return Err(AppError::validation("summarization.model is empty"));
        }
        Ok(())
    }
}

/// Reconciliation engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Attempts allowed per external-call stage transition
    #[serde(default = "defaults::retry_budget")]
    pub retry_budget: u32,

    /// First retry delay in milliseconds; doubles per attempt
    #[serde(default = "defaults::backoff_base")]
    pub backoff_base_ms: u64,

    /// Upper bound for a single retry delay
    #[serde(default = "defaults::backoff_cap")]
    pub backoff_cap_ms: u64,

    /// Maximum identities processed in parallel
    #[serde(default = "defaults::worker_concurrency")]
    pub worker_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_budget: defaults::retry_budget(),
            backoff_base_ms: defaults::backoff_base(),
            backoff_cap_ms: defaults::backoff_cap(),
            worker_concurrency: defaults::worker_concurrency(),
        }
    }
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    #[serde(default = "defaults::connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            connect_timeout_ms: defaults::connect_timeout(),
        }
    }
}

/// Which extraction client to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionProvider {
    /// FireCrawl scrape API
    #[default]
    Firecrawl,
    /// Direct page fetch with local text extraction
    Html,
}

/// Content extraction client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default)]
    pub provider: ExtractionProvider,

    #[serde(default = "defaults::firecrawl_endpoint")]
    pub endpoint: String,

    /// Environment variable holding the API key
    #[serde(default = "defaults::firecrawl_key_env")]
    pub api_key_env: String,

    /// Per-call timeout in milliseconds
    #[serde(default = "defaults::extraction_timeout")]
    pub timeout_ms: u64,

    /// Ask the extractor to drop navigation and footers
    #[serde(default = "defaults::only_main_content")]
    pub only_main_content: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            provider: ExtractionProvider::default(),
            endpoint: defaults::firecrawl_endpoint(),
            api_key_env: defaults::firecrawl_key_env(),
            timeout_ms: defaults::extraction_timeout(),
            only_main_content: defaults::only_main_content(),
        }
    }
}

/// Summarization client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizationConfig {
    #[serde(default = "defaults::gemini_endpoint")]
    pub endpoint: String,

    #[serde(default = "defaults::gemini_model")]
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default = "defaults::gemini_key_env")]
    pub api_key_env: String,

    /// Per-call timeout in milliseconds
    #[serde(default = "defaults::summarization_timeout")]
    pub timeout_ms: u64,

    /// Summaries are truncated to this many characters
    #[serde(default = "defaults::max_summary_chars")]
    pub max_summary_chars: usize,

    /// Inputs longer than this are rejected as too large
    #[serde(default = "defaults::max_input_chars")]
    pub max_input_chars: usize,

    /// Instruction placed before the page content
    #[serde(default = "defaults::prompt")]
    pub prompt: String,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            endpoint: defaults::gemini_endpoint(),
            model: defaults::gemini_model(),
            api_key_env: defaults::gemini_key_env(),
            timeout_ms: defaults::summarization_timeout(),
            max_summary_chars: defaults::max_summary_chars(),
            max_input_chars: defaults::max_input_chars(),
            prompt: defaults::prompt(),
        }
    }
}

/// Which record store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// One JSON file per record on the local filesystem
    #[default]
    Local,
    /// Notion database
    Notion,
}

/// Record store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Directory for the local backend, relative to the storage dir
    #[serde(default = "defaults::records_dir")]
    pub records_dir: PathBuf,

    #[serde(default = "defaults::notion_endpoint")]
    pub notion_endpoint: String,

    #[serde(default = "defaults::notion_key_env")]
    pub notion_api_key_env: String,

    #[serde(default = "defaults::notion_database_env")]
    pub notion_database_env: String,

    #[serde(default = "defaults::notion_timeout")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            records_dir: defaults::records_dir(),
            notion_endpoint: defaults::notion_endpoint(),
            notion_api_key_env: defaults::notion_key_env(),
            notion_database_env: defaults::notion_database_env(),
            timeout_ms: defaults::notion_timeout(),
        }
    }
}

/// Read a required secret from the environment variable named in config.
pub fn require_env(var: &str) -> Result<String> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(AppError::config(format!(
            "environment variable {var} is not set"
        ))),
    }
}

mod defaults {
    use std::path::PathBuf;

    // Engine defaults
    pub fn retry_budget() -> u32 {
        3
    }
    pub fn backoff_base() -> u64 {
        500
    }
    pub fn backoff_cap() -> u64 {
        30_000
    }
    pub fn worker_concurrency() -> usize {
        4
    }

    // HTTP defaults
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; enricher/0.1)".into()
    }
    pub fn connect_timeout() -> u64 {
        10_000
    }

    // Extraction defaults
    pub fn firecrawl_endpoint() -> String {
        "https://api.firecrawl.dev".into()
    }
    pub fn firecrawl_key_env() -> String {
        "FIRECRAWL_API_KEY".into()
    }
    pub fn extraction_timeout() -> u64 {
        60_000
    }
    pub fn only_main_content() -> bool {
        true
    }

    // Summarization defaults
    pub fn gemini_endpoint() -> String {
        "https://generativelanguage.googleapis.com/v1beta".into()
    }
    pub fn gemini_model() -> String {
        "gemini-2.0-flash".into()
    }
    pub fn gemini_key_env() -> String {
        "GEMINI_API_KEY".into()
    }
    pub fn summarization_timeout() -> u64 {
        60_000
    }
    pub fn max_summary_chars() -> usize {
        1_500
    }
    pub fn max_input_chars() -> usize {
        200_000
    }
    pub fn prompt() -> String {
        "Summarize this university data science program page for a prospective \
         graduate student. Cover degree type, duration, core curriculum, \
         admission requirements, tuition and application deadlines when the \
         page states them. Reply in plain text."
            .into()
    }

    // Store defaults
    pub fn records_dir() -> PathBuf {
        PathBuf::from("records")
    }
    pub fn notion_endpoint() -> String {
        "https://api.notion.com/v1".into()
    }
    pub fn notion_key_env() -> String {
        "NOTION_API_KEY".into()
    }
    pub fn notion_database_env() -> String {
        "NOTION_DATABASE_ID".into()
    }
    pub fn notion_timeout() -> u64 {
        30_000
    }
}
