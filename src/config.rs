use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;

use crate::retrieval::RerankWeights;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    Ollama,
    OpenAiCompatible,
}

impl FromStr for LlmProvider {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ollama" | "local" => Ok(LlmProvider::Ollama),
            "openai" | "openrouter" | "groq" | "cloud" => Ok(LlmProvider::OpenAiCompatible),
            other => anyhow::bail!("unknown LLM_PROVIDER '{other}' (expected ollama or openai)"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmbeddingProvider {
    Ollama,
    Hashed,
}

impl FromStr for EmbeddingProvider {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(EmbeddingProvider::Ollama),
            "hashed" | "offline" => Ok(EmbeddingProvider::Hashed),
            other => {
                anyhow::bail!("unknown EMBEDDING_PROVIDER '{other}' (expected ollama or hashed)")
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub llm_provider: String,
    pub judge_model: String,
    pub embedding_provider: String,
    pub embedding_model: String,
    pub hashed_dimensions: usize,
    pub api_base_url: String,
    pub api_key: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    pub adaptive_k: bool,
    pub default_k: usize,
    pub recall_multiplier: usize,
    pub expansion: bool,
    pub rerank: bool,
    pub rerank_weights: RerankWeights,
    pub max_chunk_chars: usize,
}

#[derive(Clone, Debug)]
pub struct JudgeConfig {
    pub dual_pass: bool,
    pub max_output_tokens: usize,
    pub timeout_secs: u64,
    pub llm_max_concurrency: usize,
    pub batch_concurrency: usize,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub books_dir: PathBuf,
    pub ollama_base_url: String,
    pub models: ModelConfig,
    pub retrieval: RetrievalConfig,
    pub judge: JudgeConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let data_dir = env::var("NARRATIVE_CHECK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        Self {
            bind_addr: env::var("NARRATIVE_CHECK_BIND")
                .unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            data_dir,
            books_dir: env::var("BOOKS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./Dataset/Books")),
            ollama_base_url: env::var("OLLAMA_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:11434".to_string()),
            models: ModelConfig {
                llm_provider: env::var("LLM_PROVIDER").unwrap_or_else(|_| "ollama".to_string()),
                judge_model: env::var("LLM_MODEL").unwrap_or_else(|_| "mistral".to_string()),
                embedding_provider: env::var("EMBEDDING_PROVIDER")
                    .unwrap_or_else(|_| "ollama".to_string()),
                embedding_model: env::var("EMBEDDING_MODEL")
                    .unwrap_or_else(|_| "all-minilm".to_string()),
                hashed_dimensions: env_parse("HASHED_EMBEDDING_DIMS", 384),
                api_base_url: env::var("LLM_API_BASE")
                    .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string()),
                api_key: env::var("LLM_API_KEY")
                    .or_else(|_| env::var("OPENROUTER_API_KEY"))
                    .or_else(|_| env::var("OPENAI_API_KEY"))
                    .ok()
                    .filter(|key| !key.trim().is_empty()),
            },
            retrieval: RetrievalConfig {
                adaptive_k: env_flag("USE_ADAPTIVE_K", true),
                default_k: env_parse("RETRIEVAL_K", 10),
                recall_multiplier: env_parse("RECALL_MULTIPLIER", 3),
                expansion: env_flag("USE_EXPANSION", false),
                rerank: env_flag("USE_RERANK", false),
                rerank_weights: RerankWeights {
                    character_match: env_parse("RERANK_CHARACTER_WEIGHT", 5),
                    keyword_match: env_parse("RERANK_KEYWORD_WEIGHT", 1),
                    year_present: env_parse("RERANK_YEAR_WEIGHT", 2),
                    conflict_word: env_parse("RERANK_CONFLICT_WEIGHT", 1),
                },
                max_chunk_chars: env_parse("MAX_CHUNK_CHARS", 4_000),
            },
            judge: JudgeConfig {
                dual_pass: env_flag("USE_DUAL_PASS", false),
                max_output_tokens: env_parse("MAX_OUTPUT_TOKENS", 500),
                timeout_secs: env_parse("LLM_TIMEOUT_SECS", 300),
                llm_max_concurrency: env_parse("LLM_MAX_CONCURRENCY", 1),
                batch_concurrency: env_parse("BATCH_CONCURRENCY", 4),
            },
        }
    }

    /// Rejects configurations that would silently change which model answers.
    pub fn validate(&self) -> Result<()> {
        let provider: LlmProvider = self.models.llm_provider.parse()?;
        let _: EmbeddingProvider = self.models.embedding_provider.parse()?;

        if provider == LlmProvider::OpenAiCompatible && self.models.api_key.is_none() {
            anyhow::bail!(
                "LLM_PROVIDER={} requires LLM_API_KEY (or OPENROUTER_API_KEY / OPENAI_API_KEY); \
                 refusing to fall back to a different model",
                self.models.llm_provider
            );
        }
        if self.judge.llm_max_concurrency == 0 {
            anyhow::bail!("LLM_MAX_CONCURRENCY must be at least 1");
        }
        if !(3..=20).contains(&self.retrieval.default_k) {
            anyhow::bail!(
                "RETRIEVAL_K must be between 3 and 20, got {}",
                self.retrieval.default_k
            );
        }
        Ok(())
    }

    pub fn llm_provider(&self) -> Result<LlmProvider> {
        self.models.llm_provider.parse()
    }

    pub fn embedding_provider(&self) -> Result<EmbeddingProvider> {
        self.models.embedding_provider.parse()
    }

    /// Identifies vectors in the cache so a model switch forces re-embedding.
    pub fn embedding_key(&self) -> String {
        match self.embedding_provider() {
            Ok(EmbeddingProvider::Hashed) => {
                format!("hashed-{}", self.models.hashed_dimensions)
            }
            _ => self.models.embedding_model.clone(),
        }
    }

    pub fn sqlite_dsn(&self) -> String {
        format!(
            "sqlite://{}",
            self.data_dir.join("narrative_check.sqlite3").display()
        )
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            data_dir: PathBuf::from("./data"),
            books_dir: PathBuf::from("./books"),
            ollama_base_url: "http://127.0.0.1:11434".to_string(),
            models: ModelConfig {
                llm_provider: "ollama".to_string(),
                judge_model: "mistral".to_string(),
                embedding_provider: "hashed".to_string(),
                embedding_model: "all-minilm".to_string(),
                hashed_dimensions: 64,
                api_base_url: "https://openrouter.ai/api/v1".to_string(),
                api_key: None,
            },
            retrieval: RetrievalConfig {
                adaptive_k: true,
                default_k: 10,
                recall_multiplier: 3,
                expansion: false,
                rerank: false,
                rerank_weights: RerankWeights::default(),
                max_chunk_chars: 0,
            },
            judge: JudgeConfig {
                dual_pass: false,
                max_output_tokens: 500,
                timeout_secs: 300,
                llm_max_concurrency: 1,
                batch_concurrency: 1,
            },
        }
    }

    #[test]
    fn hosted_provider_without_key_fails_fast() {
        let mut config = base_config();
        config.models.llm_provider = "openai".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("LLM_API_KEY"));

        config.models.api_key = Some("sk-test".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let mut config = base_config();
        config.models.llm_provider = "carrier-pigeon".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn fixed_k_outside_deployment_range_is_rejected() {
        let mut config = base_config();
        config.retrieval.default_k = 40;
        assert!(config.validate().is_err());
    }

    #[test]
    fn embedding_key_tracks_hashed_dimensions() {
        let config = base_config();
        assert_eq!(config.embedding_key(), "hashed-64");
    }
}
