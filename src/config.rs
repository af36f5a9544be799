//! Startup configuration
//!
//! Every environment lookup happens here, once, at boot. Request handling
//! only ever sees the resolved [`ChatbotConfig`].

use crate::error::ChatbotError;
use crate::Result;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer all questions to the best of your ability.";
pub const DEFAULT_GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_GROQ_MODEL: &str = "llama-3.1-8b-instant";
pub const DEFAULT_EMBEDDING_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_TRACING_ENDPOINT: &str = "https://api.smith.langchain.com";

/// When the retrieval index is loaded (or built)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBuildPolicy {
    /// Load or build at startup; a failed cold build aborts boot
    Eager,
    /// Load or build on the first retrieval query
    Lazy,
}

impl FromStr for IndexBuildPolicy {
    type Err = ChatbotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "eager" => Ok(IndexBuildPolicy::Eager),
            "lazy" => Ok(IndexBuildPolicy::Lazy),
            other => Err(ChatbotError::Config(format!(
                "INDEX_BUILD must be 'eager' or 'lazy', got '{}'",
                other
            ))),
        }
    }
}

/// Completion provider settings
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// Embedding provider settings. Without an API key the local hashing
/// embedder is used.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub dimensions: usize,
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub enabled: bool,
    pub index_dir: PathBuf,
    pub build_policy: IndexBuildPolicy,
    pub seed_urls: Vec<String>,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub embedding: EmbeddingConfig,
}

/// Optional run tracing. `None` on [`ChatbotConfig`] when disabled.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub api_key: String,
    pub project: String,
    pub endpoint: String,
}

#[derive(Debug, Clone)]
pub struct ChatbotConfig {
    pub system_prompt: String,
    pub history_dir: PathBuf,
    pub token_budget: usize,
    pub port: u16,
    pub completion: CompletionConfig,
    pub retrieval: RetrievalConfig,
    pub tracing: Option<TracingConfig>,
}

impl ChatbotConfig {
    /// Load `.env` (if any) and resolve configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_key = get("GROQ_API_KEY");
        if api_key.is_none() {
            warn!("GROQ_API_KEY not set; completions will fail until it is configured");
        }

        let completion = CompletionConfig {
            api_key,
            base_url: get("GROQ_BASE_URL").unwrap_or_else(|| DEFAULT_GROQ_BASE_URL.to_string()),
            model: get("GROQ_MODEL").unwrap_or_else(|| DEFAULT_GROQ_MODEL.to_string()),
            max_tokens: parse_or(&get, "MAX_COMPLETION_TOKENS", 1024)?,
            timeout: Duration::from_secs(parse_or(&get, "PROVIDER_TIMEOUT_SECS", 30)?),
        };

        let chunk_size: usize = parse_or(&get, "CHUNK_SIZE", 1000)?;
        let chunk_overlap: usize = parse_or(&get, "CHUNK_OVERLAP", 200)?;
        if chunk_size == 0 || chunk_overlap >= chunk_size {
            return Err(ChatbotError::Config(format!(
                "CHUNK_OVERLAP ({}) must be smaller than a non-zero CHUNK_SIZE ({})",
                chunk_overlap, chunk_size
            )));
        }

        let top_k: usize = parse_or(&get, "TOP_K", 4)?;
        if top_k == 0 {
            return Err(ChatbotError::Config("TOP_K must be at least 1".into()));
        }

        let retrieval = RetrievalConfig {
            enabled: parse_bool(get("RETRIEVAL_ENABLED").as_deref()),
            index_dir: PathBuf::from(get("INDEX_DIR").unwrap_or_else(|| "vector_index".into())),
            build_policy: match get("INDEX_BUILD") {
                Some(v) => v.parse()?,
                None => IndexBuildPolicy::Lazy,
            },
            seed_urls: get("SEED_URLS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|u| !u.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            chunk_size,
            chunk_overlap,
            top_k,
            embedding: EmbeddingConfig {
                api_key: get("EMBEDDING_API_KEY"),
                base_url: get("EMBEDDING_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_EMBEDDING_BASE_URL.to_string()),
                model: get("EMBEDDING_MODEL").unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
                dimensions: parse_or(&get, "EMBEDDING_DIMENSIONS", 384)?,
            },
        };

        let token_budget: usize = parse_or(&get, "TOKEN_BUDGET", 5000)?;
        if token_budget == 0 {
            return Err(ChatbotError::Config("TOKEN_BUDGET must be at least 1".into()));
        }

        let port: u16 = match get("PORT").or_else(|| get("API_PORT")) {
            Some(v) => v
                .parse()
                .map_err(|_| ChatbotError::Config(format!("PORT is not a valid port: '{}'", v)))?,
            None => 5000,
        };

        Ok(Self {
            system_prompt: get("SYSTEM_PROMPT").unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            history_dir: PathBuf::from(get("HISTORY_DIR").unwrap_or_else(|| "chat_histories".into())),
            token_budget,
            port,
            completion,
            retrieval,
            tracing: resolve_tracing(&get),
        })
    }
}

/// Tracing is on only when explicitly enabled *and* a key is present.
fn resolve_tracing<G>(get: &G) -> Option<TracingConfig>
where
    G: Fn(&str) -> Option<String>,
{
    if !parse_bool(get("LANGCHAIN_TRACING_V2").as_deref()) {
        return None;
    }

    let Some(api_key) = get("LANGCHAIN_API_KEY") else {
        warn!("LANGCHAIN_TRACING_V2 is set but LANGCHAIN_API_KEY is missing; run tracing disabled");
        return None;
    };

    Some(TracingConfig {
        api_key,
        project: get("LANGCHAIN_PROJECT").unwrap_or_else(|| "default".into()),
        endpoint: get("LANGCHAIN_ENDPOINT")
            .unwrap_or_else(|| DEFAULT_TRACING_ENDPOINT.to_string())
            .trim_end_matches('/')
            .to_string(),
    })
}

fn parse_or<G, T>(get: &G, key: &str, default: T) -> Result<T>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ChatbotError::Config(format!("{} has an invalid value: '{}'", key, raw))),
        None => Ok(default),
    }
}

fn parse_bool(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.to_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}
