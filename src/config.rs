use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::community::CommunityDetectionConfig;
use crate::extraction::ExtractorConfig;
use crate::indexing::IndexingConfig;
use crate::query::{GlobalQueryConfig, HybridQueryConfig};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub graphrag: GraphRagConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
    #[serde(default)]
    pub community: CommunityDetectionConfig,
    #[serde(default)]
    pub hybrid: HybridQueryConfig,
    #[serde(default)]
    pub global: GlobalQueryConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub extraction: ExtractorConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphRagConfig {
    pub db_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Chat-completions endpoint used for extraction, summaries and answers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: crate::llm::openai::DEFAULT_BASE_URL.to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.2,
            timeout_secs: 120,
        }
    }
}

/// Embeddings configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
    pub batch_size: usize,
    pub dimensions: Option<usize>,
    pub cache_capacity: usize,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            base_url: crate::embeddings::openai::DEFAULT_BASE_URL.to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            batch_size: 100,
            dimensions: None,
            cache_capacity: default_cache_capacity(),
        }
    }
}

/// Local data sources
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectorsConfig {
    /// Folder indexed by the documents connector.
    pub documents_root: Option<PathBuf>,
    /// JSON file holding the documents connector's last-sync timestamp.
    pub sync_state_path: Option<PathBuf>,
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in GRAPHRAG_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();

        let config_path = std::env::var("GRAPHRAG_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        Self::from_toml_str(&config_str)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(config_str).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if let Some(root) = &self.connectors.documents_root {
            if !root.is_dir() {
                anyhow::bail!(
                    "connectors.documents_root must be an existing directory: {}",
                    root.display()
                );
            }
        }

        let h = &self.hybrid;
        if h.cypher_weight < 0.0 || h.embedding_weight < 0.0 || h.community_weight < 0.0 {
            anyhow::bail!("hybrid weights must be non-negative");
        }
        if !(0.0..=1.0).contains(&h.similarity_threshold) {
            anyhow::bail!("hybrid.similarity_threshold must be between 0.0 and 1.0");
        }
        if h.top_k == 0 {
            anyhow::bail!("hybrid.top_k must be greater than 0");
        }

        if self.community.min_community_size == 0 {
            anyhow::bail!("community.min_community_size must be at least 1");
        }
        if self.community.max_depth == 0 {
            anyhow::bail!("community.max_depth must be at least 1");
        }
        if self.community.resolution <= 0.0 {
            anyhow::bail!("community.resolution must be greater than 0");
        }

        if self.global.min_helpfulness_score > 100 {
            anyhow::bail!("global.min_helpfulness_score must be between 0 and 100");
        }
        if self.global.max_community_answers == 0 {
            anyhow::bail!("global.max_community_answers must be greater than 0");
        }

        if self.indexing.batch_size == 0 {
            anyhow::bail!("indexing.batch_size must be greater than 0");
        }
        if self.embeddings.batch_size == 0 {
            anyhow::bail!("embeddings.batch_size must be greater than 0");
        }

        let e = &self.extraction;
        if !(0.0..=1.0).contains(&e.min_confidence) {
            anyhow::bail!("extraction.min_confidence must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&e.merge_similarity_threshold) {
            anyhow::bail!("extraction.merge_similarity_threshold must be between 0.0 and 1.0");
        }

        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> &Path {
        &self.graphrag.db_path
    }
}

/// Read an API key from the named environment variable
pub fn api_key_from_env(var: &str) -> Result<String> {
    std::env::var(var).with_context(|| {
        format!(
            "Environment variable {} not set. Set it in your .env file or as an environment variable.",
            var
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serialize tests that mutate process-wide env so they don't race.
    static CONFIG_TEST_LOCK: Mutex<()> = Mutex::new(());

    const MINIMAL: &str = r#"
[graphrag]
db_path = "./graph.db"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.graphrag.log_level, "info");
        assert_eq!(config.db_path(), Path::new("./graph.db"));
        assert_eq!(config.community, CommunityDetectionConfig::default());
        assert!((config.hybrid.cypher_weight - 0.4).abs() < 1e-9);
        assert!((config.hybrid.community_weight - 0.2).abs() < 1e-9);
        assert_eq!(config.global.min_helpfulness_score, 20);
        assert_eq!(config.global.max_community_answers, 10);
        assert_eq!(config.indexing.batch_size, 10);
        assert_eq!(config.embeddings.cache_capacity, 1000);
        assert!(config.connectors.documents_root.is_none());
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = Config::from_toml_str(
            r#"
[graphrag]
db_path = "g.db"
log_level = "debug"

[community]
random_seed = 42
max_depth = 3

[hybrid]
embedding_weight = 0.7
top_k = 5

[global]
response_type = "single paragraph"

[indexing]
batch_size = 4
fetch_limit = 100
"#,
        )
        .unwrap();
        assert_eq!(config.community.random_seed, Some(42));
        assert_eq!(config.community.max_depth, 3);
        assert_eq!(config.community.min_community_size, 2);
        assert!((config.hybrid.embedding_weight - 0.7).abs() < 1e-9);
        assert_eq!(config.hybrid.top_k, 5);
        assert_eq!(config.global.response_type, "single paragraph");
        assert_eq!(config.indexing.fetch_limit, Some(100));
    }

    #[test]
    fn test_validation_rejects_bad_ranges() {
        let cases = [
            ("[hybrid]\ncypher_weight = -0.1", "non-negative"),
            ("[community]\nmin_community_size = 0", "min_community_size"),
            ("[global]\nmin_helpfulness_score = 101", "min_helpfulness_score"),
            ("[indexing]\nbatch_size = 0", "batch_size"),
            ("[extraction]\nmin_confidence = 1.5", "min_confidence"),
        ];
        for (section, needle) in cases {
            let toml = format!("{}\n{}\n", MINIMAL, section);
            let err = Config::from_toml_str(&toml).unwrap_err();
            assert!(err.to_string().contains(needle), "{} -> {}", section, err);
        }
    }

    #[test]
    fn test_missing_documents_root_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope");
        let toml = format!(
            "{}\n[connectors]\ndocuments_root = \"{}\"\n",
            MINIMAL,
            missing.to_str().unwrap().replace('\\', "\\\\")
        );
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_config_load_from_env_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("graphrag.toml");
        fs::write(&config_path, MINIMAL).unwrap();

        let original = std::env::var("GRAPHRAG_CONFIG").ok();
        std::env::set_var("GRAPHRAG_CONFIG", &config_path);
        let loaded = Config::load();
        std::env::set_var("GRAPHRAG_CONFIG", temp_dir.path().join("missing.toml"));
        let missing = Config::load();
        match original {
            Some(v) => std::env::set_var("GRAPHRAG_CONFIG", v),
            None => std::env::remove_var("GRAPHRAG_CONFIG"),
        }

        assert!(loaded.is_ok(), "Config::load() failed: {:?}", loaded.err());
        assert!(missing.unwrap_err().to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_api_key_from_env() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        std::env::set_var("GRAPHRAG_TEST_KEY", "secret");
        assert_eq!(api_key_from_env("GRAPHRAG_TEST_KEY").unwrap(), "secret");
        std::env::remove_var("GRAPHRAG_TEST_KEY");
        let err = api_key_from_env("GRAPHRAG_TEST_KEY").unwrap_err();
        assert!(err.to_string().contains("GRAPHRAG_TEST_KEY"));
    }
}
